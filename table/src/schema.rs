//! Table schemas and their JSON wire format.
//!
//! Schemas are persisted inside the log as a nested JSON document (the
//! `schemaString` of the metadata action), with the same shape other Delta
//! implementations use: a `struct` of named fields, each field carrying a
//! type, a nullability flag and a free-form metadata object.

use std::collections::HashMap;
use std::fmt;

use arrow::datatypes::{DataType as ArrowDataType, Schema as ArrowSchema, TimeUnit};
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::require;
use crate::{DeltaResult, Error};

/// A primitive type, named the way the log spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrimitiveType {
    String,
    Long,
    Integer,
    Short,
    Byte,
    Float,
    Double,
    Boolean,
    Binary,
    Date,
    Timestamp,
    TimestampNtz,
}

impl PrimitiveType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Long => "long",
            Self::Integer => "integer",
            Self::Short => "short",
            Self::Byte => "byte",
            Self::Float => "float",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Binary => "binary",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::TimestampNtz => "timestampNtz",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A logical table data type.
///
/// Primitives serialize as bare JSON strings, composite types as objects, so
/// the enum is untagged and the variants are told apart by shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataType {
    Primitive(PrimitiveType),
    Struct(Box<StructType>),
    Array(Box<ArrayType>),
    Map(Box<MapType>),
}

impl DataType {
    pub const STRING: Self = Self::Primitive(PrimitiveType::String);
    pub const LONG: Self = Self::Primitive(PrimitiveType::Long);
    pub const INTEGER: Self = Self::Primitive(PrimitiveType::Integer);
    pub const SHORT: Self = Self::Primitive(PrimitiveType::Short);
    pub const BYTE: Self = Self::Primitive(PrimitiveType::Byte);
    pub const FLOAT: Self = Self::Primitive(PrimitiveType::Float);
    pub const DOUBLE: Self = Self::Primitive(PrimitiveType::Double);
    pub const BOOLEAN: Self = Self::Primitive(PrimitiveType::Boolean);
    pub const BINARY: Self = Self::Primitive(PrimitiveType::Binary);
    pub const DATE: Self = Self::Primitive(PrimitiveType::Date);
    pub const TIMESTAMP: Self = Self::Primitive(PrimitiveType::Timestamp);
    pub const TIMESTAMP_NTZ: Self = Self::Primitive(PrimitiveType::TimestampNtz);

    /// Create a struct type from the given fields.
    pub fn struct_type(fields: impl IntoIterator<Item = StructField>) -> DeltaResult<Self> {
        Ok(Self::Struct(Box::new(StructType::try_new(fields)?)))
    }

    /// Create an array type with the given element type.
    pub fn array_type(element_type: DataType, contains_null: bool) -> Self {
        Self::Array(Box::new(ArrayType::new(element_type, contains_null)))
    }

    /// Create a map type with the given key and value types.
    pub fn map_type(key_type: DataType, value_type: DataType, value_contains_null: bool) -> Self {
        Self::Map(Box::new(MapType::new(key_type, value_type, value_contains_null)))
    }

    /// Whether values of this type can name a partition directory.
    ///
    /// Partition values travel through the log as strings and back into file
    /// paths, so only types with an unambiguous string form qualify.
    pub(crate) fn is_valid_partition_type(&self) -> bool {
        matches!(
            self,
            Self::Primitive(
                PrimitiveType::String
                    | PrimitiveType::Long
                    | PrimitiveType::Integer
                    | PrimitiveType::Short
                    | PrimitiveType::Byte
                    | PrimitiveType::Boolean
                    | PrimitiveType::Date
            )
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => write!(f, "{p}"),
            Self::Struct(s) => {
                write!(f, "struct<")?;
                for (i, field) in s.fields().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.data_type)?;
                }
                write!(f, ">")
            }
            Self::Array(a) => write!(f, "array<{}>", a.element_type),
            Self::Map(m) => write!(f, "map<{}, {}>", m.key_type, m.value_type),
        }
    }
}

fn ensure_tag<'de, D: Deserializer<'de>>(d: D, expected: &'static str) -> Result<(), D::Error> {
    let tag = String::deserialize(d)?;
    if tag == expected {
        Ok(())
    } else {
        Err(serde::de::Error::custom(format!(
            "expected type \"{expected}\", got \"{tag}\""
        )))
    }
}

fn struct_tag<'de, D: Deserializer<'de>>(d: D) -> Result<(), D::Error> {
    ensure_tag(d, "struct")
}

fn array_tag<'de, D: Deserializer<'de>>(d: D) -> Result<(), D::Error> {
    ensure_tag(d, "array")
}

fn map_tag<'de, D: Deserializer<'de>>(d: D) -> Result<(), D::Error> {
    ensure_tag(d, "map")
}

fn serialize_tag<S: Serializer>(tag: &str, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(tag)
}

fn struct_tag_ser<S: Serializer>(_: &(), s: S) -> Result<S::Ok, S::Error> {
    serialize_tag("struct", s)
}

fn array_tag_ser<S: Serializer>(_: &(), s: S) -> Result<S::Ok, S::Error> {
    serialize_tag("array", s)
}

fn map_tag_ser<S: Serializer>(_: &(), s: S) -> Result<S::Ok, S::Error> {
    serialize_tag("map", s)
}

/// A named field inside a [`StructType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    /// Field name, unique within the containing struct.
    pub name: String,
    /// Logical type of the field.
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Whether the field admits nulls.
    pub nullable: bool,
    /// Free-form metadata, preserved verbatim across the wire.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StructField {
    /// A new field that admits nulls.
    pub fn nullable(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            metadata: HashMap::new(),
        }
    }

    /// A new field that rejects nulls.
    pub fn not_null(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            metadata: HashMap::new(),
        }
    }

    /// Replace the field metadata.
    pub fn with_metadata(
        mut self,
        metadata: impl IntoIterator<Item = (impl Into<String>, impl Into<serde_json::Value>)>,
    ) -> Self {
        self.metadata = metadata
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }
}

/// An ordered collection of named fields. The root type of every table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    #[serde(
        rename = "type",
        deserialize_with = "struct_tag",
        serialize_with = "struct_tag_ser"
    )]
    type_tag: (),
    fields: Vec<StructField>,
}

impl StructType {
    /// Build a struct type, rejecting duplicate field names.
    pub fn try_new(fields: impl IntoIterator<Item = StructField>) -> DeltaResult<Self> {
        let fields: Vec<_> = fields.into_iter().collect();
        let duplicates: Vec<_> = fields
            .iter()
            .map(|f| f.name.as_str())
            .duplicates()
            .collect();
        require!(
            duplicates.is_empty(),
            Error::schema(format!("duplicate field names: {}", duplicates.join(", ")))
        );
        Ok(Self {
            type_tag: (),
            fields,
        })
    }

    /// Iterate the fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &StructField> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of a field by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Parse a schema from the JSON document stored in the log.
    pub fn from_schema_string(schema_string: &str) -> DeltaResult<Self> {
        Ok(serde_json::from_str(schema_string)?)
    }

    /// Serialize this schema to the JSON document stored in the log.
    pub fn to_schema_string(&self) -> DeltaResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An array type: a variable number of elements of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayType {
    #[serde(
        rename = "type",
        deserialize_with = "array_tag",
        serialize_with = "array_tag_ser"
    )]
    type_tag: (),
    /// Type of the array elements.
    pub element_type: DataType,
    /// Whether elements may be null.
    pub contains_null: bool,
}

impl ArrayType {
    pub fn new(element_type: DataType, contains_null: bool) -> Self {
        Self {
            type_tag: (),
            element_type,
            contains_null,
        }
    }
}

/// A map type: keys of one type mapped to values of another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapType {
    #[serde(
        rename = "type",
        deserialize_with = "map_tag",
        serialize_with = "map_tag_ser"
    )]
    type_tag: (),
    /// Type of the map keys.
    pub key_type: DataType,
    /// Type of the map values.
    pub value_type: DataType,
    /// Whether values may be null.
    pub value_contains_null: bool,
}

impl MapType {
    pub fn new(key_type: DataType, value_type: DataType, value_contains_null: bool) -> Self {
        Self {
            type_tag: (),
            key_type,
            value_type,
            value_contains_null,
        }
    }
}

/// Whether an arrow type is an acceptable physical encoding of a logical type.
fn arrow_type_matches(logical: &DataType, physical: &ArrowDataType) -> bool {
    use PrimitiveType::*;
    let DataType::Primitive(primitive) = logical else {
        // nested columns never arrive through the insert path
        return false;
    };
    match primitive {
        String => matches!(physical, ArrowDataType::Utf8),
        Long => matches!(physical, ArrowDataType::Int64),
        Integer => matches!(physical, ArrowDataType::Int32),
        Short => matches!(physical, ArrowDataType::Int16),
        Byte => matches!(physical, ArrowDataType::Int8),
        Float => matches!(physical, ArrowDataType::Float32),
        Double => matches!(physical, ArrowDataType::Float64),
        Boolean => matches!(physical, ArrowDataType::Boolean),
        Binary => matches!(physical, ArrowDataType::Binary),
        Date => matches!(physical, ArrowDataType::Date32),
        Timestamp => matches!(physical, ArrowDataType::Timestamp(TimeUnit::Microsecond, Some(_))),
        TimestampNtz => matches!(physical, ArrowDataType::Timestamp(TimeUnit::Microsecond, None)),
    }
}

/// Check that a record batch schema lines up with the table schema: same
/// field names in the same order, compatible types, and no nullable batch
/// column feeding a non-null table column.
pub(crate) fn validate_batch_schema(
    table_schema: &StructType,
    batch_schema: &ArrowSchema,
) -> DeltaResult<()> {
    require!(
        table_schema.num_fields() == batch_schema.fields().len(),
        Error::schema_mismatch(format!(
            "table has {} columns but the batch has {}",
            table_schema.num_fields(),
            batch_schema.fields().len()
        ))
    );
    for (expected, actual) in table_schema.fields().zip(batch_schema.fields()) {
        require!(
            expected.name == *actual.name(),
            Error::schema_mismatch(format!(
                "expected column \"{}\", batch has \"{}\" in its place",
                expected.name,
                actual.name()
            ))
        );
        require!(
            arrow_type_matches(&expected.data_type, actual.data_type()),
            Error::schema_mismatch(format!(
                "column \"{}\" expects type {}, batch provides {}",
                expected.name,
                expected.data_type,
                actual.data_type()
            ))
        );
        require!(
            expected.nullable || !actual.is_nullable(),
            Error::schema_mismatch(format!(
                "column \"{}\" is non-nullable but the batch column admits nulls",
                expected.name
            ))
        );
    }
    Ok(())
}
