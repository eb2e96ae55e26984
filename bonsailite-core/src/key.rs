// src/key.rs
// Composite keys with boundary sentinels for partial-key search

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{BonsaiError, Result};

/// Ordered float wrapper so keys containing floats form a total order
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl OrderedFloat {
    /// Get the inner f64 value
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// One item of a composite key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    Str(String),
}

impl KeyPart {
    fn rank(&self) -> u8 {
        match self {
            KeyPart::Null => 0,
            KeyPart::Bool(_) => 1,
            KeyPart::Int(_) => 2,
            KeyPart::Float(_) => 3,
            KeyPart::Str(_) => 4,
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Bool(a), KeyPart::Bool(b)) => a.cmp(b),
            (KeyPart::Int(a), KeyPart::Int(b)) => a.cmp(b),
            (KeyPart::Float(a), KeyPart::Float(b)) => a.cmp(b),
            (KeyPart::Str(a), KeyPart::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Which full-arity boundary a short composite key resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Missing trailing parts compare below every real part
    Low,
    /// Missing trailing parts compare above every real part
    High,
}

/// Policy for resolving a short composite key during search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialSearchMode {
    None,
    LowestBoundary,
    HighestBoundary,
}

/// A tree key: an ordered list of parts, optionally tagged with the boundary
/// sentinel that stands in for missing trailing parts.
///
/// Stored keys always carry a full part list and no sentinel; sentinels exist
/// only on in-memory search keys produced by [`BonsaiKey::pad`].
#[derive(Debug, Clone)]
pub struct BonsaiKey {
    parts: Vec<KeyPart>,
    sentinel: Option<Boundary>,
}

impl BonsaiKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        BonsaiKey {
            parts,
            sentinel: None,
        }
    }

    /// Single-part integer key, the common case for id indexes
    pub fn int(value: i64) -> Self {
        BonsaiKey::new(vec![KeyPart::Int(value)])
    }

    pub fn str(value: &str) -> Self {
        BonsaiKey::new(vec![KeyPart::Str(value.to_string())])
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn sentinel(&self) -> Option<Boundary> {
        self.sentinel
    }

    /// Resolve a short key to a full-arity search boundary. Keys that already
    /// carry `key_size` parts are returned unchanged.
    pub fn pad(&self, key_size: usize, mode: PartialSearchMode) -> BonsaiKey {
        if self.parts.len() >= key_size || mode == PartialSearchMode::None {
            return self.clone();
        }
        let sentinel = match mode {
            PartialSearchMode::LowestBoundary => Some(Boundary::Low),
            PartialSearchMode::HighestBoundary => Some(Boundary::High),
            PartialSearchMode::None => None,
        };
        BonsaiKey {
            parts: self.parts.clone(),
            sentinel,
        }
    }

    /// Stable byte layout for on-page storage: part count, then per part a
    /// type tag and a little-endian payload. Sentinel keys are search-only
    /// and must never reach a page.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.sentinel.is_some() {
            return Err(BonsaiError::Corruption(
                "boundary key cannot be serialized".to_string(),
            ));
        }
        let mut buf = Vec::new();
        buf.push(self.parts.len() as u8);
        for part in &self.parts {
            match part {
                KeyPart::Null => buf.push(0),
                KeyPart::Bool(b) => {
                    buf.push(1);
                    buf.push(*b as u8);
                }
                KeyPart::Int(i) => {
                    buf.push(2);
                    buf.extend_from_slice(&i.to_le_bytes());
                }
                KeyPart::Float(f) => {
                    buf.push(3);
                    buf.extend_from_slice(&f.0.to_bits().to_le_bytes());
                }
                KeyPart::Str(s) => {
                    buf.push(4);
                    let bytes = s.as_bytes();
                    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                    buf.extend_from_slice(bytes);
                }
            }
        }
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let corrupt = || BonsaiError::Corruption("truncated key payload".to_string());
        let count = *data.first().ok_or_else(corrupt)? as usize;
        let mut offset = 1;
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = *data.get(offset).ok_or_else(corrupt)?;
            offset += 1;
            let part = match tag {
                0 => KeyPart::Null,
                1 => {
                    let b = *data.get(offset).ok_or_else(corrupt)?;
                    offset += 1;
                    KeyPart::Bool(b != 0)
                }
                2 => {
                    let raw = data
                        .get(offset..offset + 8)
                        .ok_or_else(corrupt)?
                        .try_into()
                        .map_err(|_| corrupt())?;
                    offset += 8;
                    KeyPart::Int(i64::from_le_bytes(raw))
                }
                3 => {
                    let raw = data
                        .get(offset..offset + 8)
                        .ok_or_else(corrupt)?
                        .try_into()
                        .map_err(|_| corrupt())?;
                    offset += 8;
                    KeyPart::Float(OrderedFloat(f64::from_bits(u64::from_le_bytes(raw))))
                }
                4 => {
                    let raw = data
                        .get(offset..offset + 2)
                        .ok_or_else(corrupt)?
                        .try_into()
                        .map_err(|_| corrupt())?;
                    let len = u16::from_le_bytes(raw) as usize;
                    offset += 2;
                    let bytes = data.get(offset..offset + len).ok_or_else(corrupt)?;
                    offset += len;
                    KeyPart::Str(
                        std::str::from_utf8(bytes)
                            .map_err(|_| {
                                BonsaiError::Corruption("invalid utf-8 in key".to_string())
                            })?
                            .to_string(),
                    )
                }
                other => {
                    return Err(BonsaiError::Corruption(format!(
                        "unknown key part tag {}",
                        other
                    )))
                }
            };
            parts.push(part);
        }
        Ok(BonsaiKey::new(parts))
    }
}

impl PartialEq for BonsaiKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BonsaiKey {}

impl PartialOrd for BonsaiKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BonsaiKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let longest = self.parts.len().max(other.parts.len());
        for i in 0..longest {
            match (self.parts.get(i), other.parts.get(i)) {
                (Some(a), Some(b)) => {
                    let ord = a.cmp(b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                // A missing trailing part matches the key's sentinel; a key
                // without a sentinel sorts as a bare prefix, below any
                // longer key sharing that prefix.
                (None, Some(_)) => {
                    return match self.sentinel {
                        Some(Boundary::High) => Ordering::Greater,
                        _ => Ordering::Less,
                    };
                }
                (Some(_), None) => {
                    return match other.sentinel {
                        Some(Boundary::High) => Ordering::Less,
                        _ => Ordering::Greater,
                    };
                }
                (None, None) => unreachable!(),
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_int() {
        assert!(BonsaiKey::int(1) < BonsaiKey::int(2));
        assert!(BonsaiKey::int(-5) < BonsaiKey::int(0));
        assert_eq!(BonsaiKey::int(42), BonsaiKey::int(42));
    }

    #[test]
    fn test_key_roundtrip() {
        let key = BonsaiKey::new(vec![
            KeyPart::Int(7),
            KeyPart::Str("alpha".to_string()),
            KeyPart::Bool(true),
            KeyPart::Float(OrderedFloat(2.5)),
            KeyPart::Null,
        ]);

        let bytes = key.to_bytes().unwrap();
        let restored = BonsaiKey::from_bytes(&bytes).unwrap();

        assert_eq!(restored, key);
    }

    #[test]
    fn test_boundary_key_not_serializable() {
        let key = BonsaiKey::int(1).pad(2, PartialSearchMode::HighestBoundary);
        assert!(key.to_bytes().is_err());
    }

    #[test]
    fn test_high_boundary_sorts_above_real_suffixes() {
        let prefix = BonsaiKey::new(vec![KeyPart::Int(2)]);
        let high = prefix.pad(2, PartialSearchMode::HighestBoundary);
        let low = prefix.pad(2, PartialSearchMode::LowestBoundary);

        let full = BonsaiKey::new(vec![KeyPart::Int(2), KeyPart::Int(999)]);

        assert!(high > full);
        assert!(low < full);
        assert!(high < BonsaiKey::new(vec![KeyPart::Int(3), KeyPart::Int(0)]));
        assert!(low > BonsaiKey::new(vec![KeyPart::Int(1), KeyPart::Int(999)]));
    }

    #[test]
    fn test_pad_full_arity_is_identity() {
        let full = BonsaiKey::new(vec![KeyPart::Int(1), KeyPart::Int(2)]);
        let padded = full.pad(2, PartialSearchMode::HighestBoundary);
        assert!(padded.sentinel().is_none());
        assert_eq!(padded, full);
    }

    #[test]
    fn test_mixed_type_parts_total_order() {
        let null = BonsaiKey::new(vec![KeyPart::Null]);
        let boolean = BonsaiKey::new(vec![KeyPart::Bool(false)]);
        let int = BonsaiKey::new(vec![KeyPart::Int(i64::MIN)]);
        let string = BonsaiKey::new(vec![KeyPart::Str(String::new())]);

        assert!(null < boolean);
        assert!(boolean < int);
        assert!(int < string);
    }
}
