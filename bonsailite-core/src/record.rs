// src/record.rs
// Per-record CSV serializer: maps documents to text fields and back.
// Independent of the tree core; a collaborator of the storage layer above.

use crate::document::{Document, FieldValue};
use crate::error::{BonsaiError, Result};

/// Serializes documents against a fixed field order. Every record carries
/// the same columns; missing fields render as null.
pub struct RecordSerializer {
    schema: Vec<String>,
}

impl RecordSerializer {
    pub fn new(schema: Vec<String>) -> Self {
        RecordSerializer { schema }
    }

    pub fn schema(&self) -> &[String] {
        &self.schema
    }

    /// Render one document as a single CSV record line
    pub fn to_record(&self, doc: &Document) -> Result<String> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        let cells: Vec<String> = self
            .schema
            .iter()
            .map(|field| render_cell(doc.get(field).unwrap_or(&FieldValue::Null)))
            .collect();
        writer
            .write_record(&cells)
            .map_err(|e| BonsaiError::Serialization(e.to_string()))?;

        let bytes = writer
            .into_inner()
            .map_err(|e| BonsaiError::Serialization(e.to_string()))?;
        let mut line =
            String::from_utf8(bytes).map_err(|e| BonsaiError::Serialization(e.to_string()))?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Parse one CSV record line back into a document
    pub fn from_record(&self, line: &str) -> Result<Document> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(line.as_bytes());

        let record = reader
            .records()
            .next()
            .ok_or_else(|| BonsaiError::Serialization("empty record line".to_string()))?
            .map_err(|e| BonsaiError::Serialization(e.to_string()))?;

        if record.len() != self.schema.len() {
            return Err(BonsaiError::Serialization(format!(
                "expected {} fields, found {}",
                self.schema.len(),
                record.len()
            )));
        }

        let mut doc = Document::new();
        for (field, cell) in self.schema.iter().zip(record.iter()) {
            let value = parse_cell(cell)?;
            if value != FieldValue::Null {
                doc.set(field.clone(), value);
            }
        }
        Ok(doc)
    }
}

/// Strings carry their own quotes inside the cell so numeric-looking text
/// survives the round trip; the other types render as bare literals.
fn render_cell(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => String::new(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Int(i) => i.to_string(),
        FieldValue::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{:.1}", f)
            } else {
                f.to_string()
            }
        }
        FieldValue::Str(s) => format!("\"{}\"", s.replace('"', "\"\"")),
    }
}

fn parse_cell(cell: &str) -> Result<FieldValue> {
    if cell.is_empty() {
        return Ok(FieldValue::Null);
    }
    if cell.len() >= 2 && cell.starts_with('"') && cell.ends_with('"') {
        let inner = &cell[1..cell.len() - 1];
        return Ok(FieldValue::Str(inner.replace("\"\"", "\"")));
    }
    match cell {
        "true" => return Ok(FieldValue::Bool(true)),
        "false" => return Ok(FieldValue::Bool(false)),
        _ => {}
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Ok(FieldValue::Int(i));
    }
    if let Ok(f) = cell.parse::<f64>() {
        return Ok(FieldValue::Float(f));
    }
    Err(BonsaiError::Serialization(format!(
        "unparseable cell: {}",
        cell
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serializer() -> RecordSerializer {
        RecordSerializer::new(vec![
            "name".to_string(),
            "age".to_string(),
            "score".to_string(),
            "active".to_string(),
        ])
    }

    #[test]
    fn test_document_roundtrip() {
        let mut doc = Document::new();
        doc.set("name", FieldValue::Str("bob".to_string()));
        doc.set("age", FieldValue::Int(41));
        doc.set("score", FieldValue::Float(9.5));
        doc.set("active", FieldValue::Bool(true));

        let s = serializer();
        let line = s.to_record(&doc).unwrap();
        let restored = s.from_record(&line).unwrap();

        assert_eq!(restored, doc);
    }

    #[test]
    fn test_missing_fields_render_null() {
        let mut doc = Document::new();
        doc.set("name", FieldValue::Str("carol".to_string()));

        let s = serializer();
        let line = s.to_record(&doc).unwrap();
        let restored = s.from_record(&line).unwrap();

        assert!(!restored.contains("age"));
        assert_eq!(
            restored.get("name"),
            Some(&FieldValue::Str("carol".to_string()))
        );
    }

    #[test]
    fn test_numeric_looking_string_stays_string() {
        let mut doc = Document::new();
        doc.set("name", FieldValue::Str("12345".to_string()));

        let s = serializer();
        let line = s.to_record(&doc).unwrap();
        let restored = s.from_record(&line).unwrap();

        assert_eq!(
            restored.get("name"),
            Some(&FieldValue::Str("12345".to_string()))
        );
    }

    #[test]
    fn test_string_with_commas_and_quotes() {
        let mut doc = Document::new();
        doc.set("name", FieldValue::Str("a,\"b\",c".to_string()));

        let s = serializer();
        let line = s.to_record(&doc).unwrap();
        let restored = s.from_record(&line).unwrap();

        assert_eq!(
            restored.get("name"),
            Some(&FieldValue::Str("a,\"b\",c".to_string()))
        );
    }

    #[test]
    fn test_field_count_mismatch_rejected() {
        let s = serializer();
        assert!(s.from_record("only,three,cells").is_err());
    }
}
