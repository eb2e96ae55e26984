// src/document.rs
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A flat record: ordered field map, the unit the record serializer works on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, FieldValue>,
}

/// Field value taxonomy shared with key parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Document {
    pub fn new() -> Self {
        Document {
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut doc = Document::new();
        doc.set("name", FieldValue::Str("alice".to_string()));
        doc.set("age", FieldValue::Int(30));

        assert_eq!(doc.get("name"), Some(&FieldValue::Str("alice".to_string())));
        assert!(doc.contains("age"));
        assert_eq!(doc.len(), 2);

        assert_eq!(doc.remove("age"), Some(FieldValue::Int(30)));
        assert!(!doc.contains("age"));
    }

    #[test]
    fn test_field_names_are_ordered() {
        let mut doc = Document::new();
        doc.set("b", FieldValue::Int(2));
        doc.set("a", FieldValue::Int(1));

        let names: Vec<_> = doc.field_names().collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
