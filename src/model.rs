use serde::ser::{Serialize, SerializeMap, Serializer};

/// Name of a file observed on the remote server (no directory component).
pub type FileToken = String;

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileEntry {
    pub name: String,
    pub size: u64,
    pub is_file: bool,
    /// Last modification instant in epoch milliseconds, as reported by the server.
    pub timestamp_ms: i64,
}

impl RemoteFileEntry {
    pub fn file(name: impl Into<String>, size: u64, timestamp_ms: i64) -> Self {
        Self {
            name: name.into(),
            size,
            is_file: true,
            timestamp_ms,
        }
    }

    pub fn directory(name: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            name: name.into(),
            size: 0,
            is_file: false,
            timestamp_ms,
        }
    }
}

/// Typed value of a document field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    I32(i32),
    I64(i64),
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Str(s) => serializer.serialize_str(s),
            FieldValue::I32(v) => serializer.serialize_i32(*v),
            FieldValue::I64(v) => serializer.serialize_i64(*v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::I32(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::I64(value)
    }
}

/// A document ready to be handed to the bulk indexer.
///
/// `id` is derived from the row content so that re-processing a file
/// upserts the same documents instead of creating new ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexableDoc {
    pub index: String,
    pub doc_type: String,
    pub id: String,
    fields: Vec<(String, FieldValue)>,
}

impl IndexableDoc {
    pub fn new(
        index: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            id: id.into(),
            fields: Vec::new(),
        }
    }

    /// Set a field. An existing field with the same name keeps its position
    /// and takes the new value, so names stay unique.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// `index`, `doc_type` and `id` must all be non-empty before indexing.
    pub fn is_addressable(&self) -> bool {
        !self.index.is_empty() && !self.doc_type.is_empty() && !self.id.is_empty()
    }

    /// JSON source of the document, fields in emission order.
    pub fn source_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&DocSource(&self.fields))
    }
}

struct DocSource<'a>(&'a [(String, FieldValue)]);

impl Serialize for DocSource<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_names_unique_and_order_stable() {
        let mut doc = IndexableDoc::new("weather", "forecast", "1|2");
        doc.add("b", 1);
        doc.add("a", "x");
        doc.add("b", 7i64);
        assert_eq!(doc.fields().len(), 2);
        assert_eq!(doc.fields()[0].0, "b");
        assert_eq!(doc.get("b"), Some(&FieldValue::I64(7)));
    }

    #[test]
    fn source_json_preserves_emission_order() {
        let mut doc = IndexableDoc::new("weather", "forecast", "id");
        doc.add("zeta", 1);
        doc.add("alpha", "two");
        doc.add("mid", 3_000_000_000i64);
        assert_eq!(
            doc.source_json().unwrap(),
            r#"{"zeta":1,"alpha":"two","mid":3000000000}"#
        );
    }

    #[test]
    fn addressable_requires_all_keys() {
        assert!(IndexableDoc::new("i", "t", "x").is_addressable());
        assert!(!IndexableDoc::new("i", "", "x").is_addressable());
        assert!(!IndexableDoc::new("i", "t", "").is_addressable());
        assert!(!IndexableDoc::default().is_addressable());
    }
}
