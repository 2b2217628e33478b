//! Column and index metadata

use serde::{Deserialize, Serialize};

/// Declared type of a model column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Variable-length string, with an optional declared length for backends
    /// that have length-typed string columns
    String(Option<u32>),
    /// Double-precision floating point number
    Number,
    Boolean,
    /// 32-bit range integer
    Integer,
    /// 64-bit range integer
    BigInteger,
    /// Point in time, canonicalized to RFC 3339 on the way in
    Date,
    /// Arbitrary nested document
    Object,
    /// Unbounded text
    Text,
    /// Longitude/latitude pair
    GeoPoint,
    /// Backend-assigned record identifier
    RecordId,
    /// Raw bytes
    Blob,
}

impl ColumnType {
    /// True for the numeric types that participate in sentinel clamping
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Number | ColumnType::Integer | ColumnType::BigInteger
        )
    }
}

/// One declared column of a model schema
///
/// Immutable once the owning [`ModelSchema`](super::ModelSchema) is frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Logical name used in conditions and records
    pub name: String,
    pub column_type: ColumnType,
    /// Column holds an array of `column_type` values
    pub array: bool,
    /// Name contains a `.` and addresses a nested document path
    pub nested: bool,
    pub required: bool,
    pub unique: bool,
    /// Backend-side name; defaults to the logical name
    pub storage_name: String,
    pub description: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        let nested = name.contains('.');
        Self {
            storage_name: name.clone(),
            name,
            column_type,
            array: false,
            nested,
            required: false,
            unique: false,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    pub fn stored_as(mut self, storage_name: impl Into<String>) -> Self {
        self.storage_name = storage_name.into();
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A declared index over one or more columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    /// Storage names of the indexed columns, in order
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_flag_follows_dotted_names() {
        let flat = ColumnSchema::new("name", ColumnType::String(None));
        let nested = ColumnSchema::new("address.city", ColumnType::String(None));
        assert!(!flat.nested);
        assert!(nested.nested);
    }

    #[test]
    fn storage_name_defaults_to_logical_name() {
        let column = ColumnSchema::new("age", ColumnType::Integer);
        assert_eq!(column.storage_name, "age");
        let mapped = ColumnSchema::new("age", ColumnType::Integer).stored_as("age_years");
        assert_eq!(mapped.storage_name, "age_years");
    }
}
