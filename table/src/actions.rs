//! Log actions and their JSON wire format.
//!
//! A commit file holds one action per line, each serialized as a single-key
//! JSON object whose key names the action type, for example
//! `{"add":{"path":...}}`. Field names are camelCase on the wire. Readers
//! tolerate unknown fields inside actions and skip action types they do not
//! recognize, so logs written by newer implementations stay readable as long
//! as the table protocol itself is supported.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::schema::StructType;
use crate::utils::{current_time_ms, require};
use crate::{DeltaResult, Error};

/// Highest log reader version this crate understands.
pub const SUPPORTED_READER_VERSION: i32 = 1;
/// Highest log writer version this crate understands.
pub const SUPPORTED_WRITER_VERSION: i32 = 2;

/// Table property controlling how many commits elapse between checkpoints.
pub(crate) const CHECKPOINT_INTERVAL_PROP: &str = "delta.checkpointInterval";
pub(crate) const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// Declares the minimum reader and writer versions required to use a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    /// Minimum log reader version required to read this table.
    pub min_reader_version: i32,
    /// Minimum log writer version required to write this table.
    pub min_writer_version: i32,
    /// Reader feature names, only present on reader version 3 tables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_features: Option<Vec<String>>,
    /// Writer feature names, only present on writer version 7 tables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer_features: Option<Vec<String>>,
}

impl Protocol {
    /// The protocol written into new tables.
    pub fn supported() -> Self {
        Self {
            min_reader_version: SUPPORTED_READER_VERSION,
            min_writer_version: SUPPORTED_WRITER_VERSION,
            reader_features: None,
            writer_features: None,
        }
    }

    fn unsupported(&self) -> Error {
        Error::UnsupportedProtocol {
            min_reader_version: self.min_reader_version,
            min_writer_version: self.min_writer_version,
        }
    }

    /// Fail if this table demands reader capabilities we do not have.
    pub fn ensure_read_supported(&self) -> DeltaResult<()> {
        require!(
            self.min_reader_version <= SUPPORTED_READER_VERSION,
            self.unsupported()
        );
        Ok(())
    }

    /// Fail if this table demands writer capabilities we do not have.
    pub fn ensure_write_supported(&self) -> DeltaResult<()> {
        self.ensure_read_supported()?;
        require!(
            self.min_writer_version <= SUPPORTED_WRITER_VERSION,
            self.unsupported()
        );
        Ok(())
    }
}

/// Describes the encoding of the data files referenced by the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    /// Name of the file format, always `parquet` for tables we write.
    pub provider: String,
    /// Format-specific options. Empty for parquet.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: HashMap::new(),
        }
    }
}

/// Table metadata: schema, partitioning and configuration. The latest
/// metadata action in the log wholly replaces any earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Unique table identifier, assigned at creation.
    pub id: String,
    /// Optional user-facing table name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Data file format.
    pub format: Format,
    /// Table schema as a nested JSON document.
    pub schema_string: String,
    /// Columns the data files are partitioned by, possibly empty.
    pub partition_columns: Vec<String>,
    /// Table properties such as the checkpoint interval.
    pub configuration: HashMap<String, String>,
    /// Creation time in milliseconds since the unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
}

impl Metadata {
    /// Metadata for a brand new table. Validates that the partition columns
    /// exist in the schema and have types with an unambiguous string form.
    pub(crate) fn try_new(
        schema: &StructType,
        partition_columns: Vec<String>,
        configuration: HashMap<String, String>,
        name: Option<String>,
        description: Option<String>,
    ) -> DeltaResult<Self> {
        require!(
            schema.num_fields() > 0,
            Error::schema("table schema must have at least one column")
        );
        require!(
            partition_columns.len() < schema.num_fields(),
            Error::schema("at least one column must not be a partition column")
        );
        for column in &partition_columns {
            let field = schema.field(column).ok_or_else(|| {
                Error::schema(format!("partition column \"{column}\" is not in the schema"))
            })?;
            require!(
                field.data_type.is_valid_partition_type(),
                Error::unsupported(format!(
                    "partition column \"{column}\" has type {}, which cannot name a partition",
                    field.data_type
                ))
            );
        }
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            description,
            format: Format::default(),
            schema_string: schema.to_schema_string()?,
            partition_columns,
            configuration,
            created_time: Some(current_time_ms()?),
        })
    }

    /// Parse the embedded schema document.
    pub fn parse_schema(&self) -> DeltaResult<StructType> {
        StructType::from_schema_string(&self.schema_string)
    }

    /// Commits between checkpoints, from table configuration or the default.
    pub(crate) fn checkpoint_interval(&self) -> u64 {
        self.configuration
            .get(CHECKPOINT_INTERVAL_PROP)
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|interval| *interval > 0)
            .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL)
    }
}

/// Adds a data file to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    /// Path of the file, relative to the table root and url-encoded, or an
    /// absolute url.
    pub path: String,
    /// Partition column values for this file. `None` encodes a null value.
    pub partition_values: HashMap<String, Option<String>>,
    /// File size in bytes.
    pub size: i64,
    /// File modification time in milliseconds since the unix epoch.
    pub modification_time: i64,
    /// Whether the file changes the logical contents of the table.
    pub data_change: bool,
    /// Optional statistics as a JSON document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
    /// Optional user-defined tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, Option<String>>>,
}

impl Add {
    /// The tombstone that logically deletes this file.
    pub(crate) fn to_remove(&self, deletion_timestamp: i64) -> Remove {
        Remove {
            path: self.path.clone(),
            deletion_timestamp: Some(deletion_timestamp),
            data_change: true,
            extended_file_metadata: Some(true),
            partition_values: Some(self.partition_values.clone()),
            size: Some(self.size),
        }
    }
}

/// Logically deletes a data file added by an earlier version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    /// Path of the file, matching the path of its add action.
    pub path: String,
    /// When the file was logically deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    /// Whether the removal changes the logical contents of the table.
    pub data_change: bool,
    /// Whether partition values and size are populated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_file_metadata: Option<bool>,
    /// Partition column values of the removed file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_values: Option<HashMap<String, Option<String>>>,
    /// Size of the removed file in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// Provenance information attached to a commit. Informational only; replay
/// never depends on it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    /// When the commit was produced, in milliseconds since the unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Name of the operation, for example `WRITE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Operation-specific parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_parameters: Option<HashMap<String, serde_json::Value>>,
    /// Identifies the writer implementation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_info: Option<String>,
    /// Unique identifier of this commit attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,
    /// Any further fields other writers put here, preserved verbatim.
    #[serde(flatten)]
    pub info: HashMap<String, serde_json::Value>,
}

impl CommitInfo {
    /// Commit info for an operation performed by this crate, stamped with the
    /// current time and a fresh transaction id.
    pub(crate) fn for_operation(
        operation: &str,
        operation_parameters: HashMap<String, serde_json::Value>,
    ) -> DeltaResult<Self> {
        Ok(Self {
            timestamp: Some(current_time_ms()?),
            operation: Some(operation.to_string()),
            operation_parameters: Some(operation_parameters),
            engine_info: Some(format!("delta-table/{}", env!("CARGO_PKG_VERSION"))),
            txn_id: Some(uuid::Uuid::new_v4().to_string()),
            info: HashMap::new(),
        })
    }
}

/// Records the latest transaction version of an idempotent application
/// writer. Carried through replay untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTransaction {
    /// Application identifier.
    pub app_id: String,
    /// Application-defined version.
    pub version: i64,
    /// When the transaction was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

/// A change data file written by a writer with change data capture enabled.
/// Carried through replay untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cdc {
    pub path: String,
    pub partition_values: HashMap<String, Option<String>>,
    pub size: i64,
    pub data_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, Option<String>>>,
}

/// Configuration owned by a named metadata domain. Carried through replay
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainMetadata {
    pub domain: String,
    pub configuration: String,
    pub removed: bool,
}

/// One line of a commit or checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfo),
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    #[serde(rename = "protocol")]
    Protocol(Protocol),
    #[serde(rename = "add")]
    Add(Add),
    #[serde(rename = "remove")]
    Remove(Remove),
    #[serde(rename = "txn")]
    Txn(SetTransaction),
    #[serde(rename = "cdc")]
    Cdc(Cdc),
    #[serde(rename = "domainMetadata")]
    DomainMetadata(DomainMetadata),
}

const KNOWN_ACTIONS: [&str; 8] = [
    "commitInfo",
    "metaData",
    "protocol",
    "add",
    "remove",
    "txn",
    "cdc",
    "domainMetadata",
];

/// Serialize actions into the newline-delimited JSON body of a commit file.
pub fn encode_actions<'a>(actions: impl IntoIterator<Item = &'a Action>) -> DeltaResult<Bytes> {
    let mut buf = Vec::new();
    for action in actions {
        serde_json::to_writer(&mut buf, action)?;
        buf.push(b'\n');
    }
    Ok(buf.into())
}

/// Parse the body of a commit or checkpoint file into actions.
///
/// Blank lines and unrecognized action types are skipped; anything else that
/// fails to parse makes the whole file corrupt.
pub fn decode_actions(data: &[u8], location: &Url) -> DeltaResult<Vec<Action>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::corrupt_log(location, "file is not valid utf-8"))?;
    let mut actions = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| Error::corrupt_log(location, format!("line {}: {e}", idx + 1)))?;
        let Some(object) = value.as_object() else {
            return Err(Error::corrupt_log(
                location,
                format!("line {} is not a JSON object", idx + 1),
            ));
        };
        if !object.keys().any(|key| KNOWN_ACTIONS.contains(&key.as_str())) {
            tracing::debug!(%location, line = idx + 1, "skipping unrecognized action");
            continue;
        }
        let action: Action = serde_json::from_value(value)
            .map_err(|e| Error::corrupt_log(location, format!("line {}: {e}", idx + 1)))?;
        actions.push(action);
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::schema::{DataType, StructField};

    use super::*;

    fn test_url() -> Url {
        Url::parse("memory:///table/_delta_log/00000000000000000000.json").unwrap()
    }

    #[test]
    fn protocol_wire_format() {
        let action = Action::Protocol(Protocol::supported());
        let json = serde_json::to_string(&action).unwrap();
        assert_eq!(
            json,
            r#"{"protocol":{"minReaderVersion":1,"minWriterVersion":2}}"#
        );
    }

    #[test]
    fn add_wire_format() {
        let add = Add {
            path: "colAuthorIdTest=1/part-00000-aaaa-c000.snappy.parquet".to_string(),
            partition_values: HashMap::from([("colAuthorIdTest".to_string(), Some("1".to_string()))]),
            size: 1234,
            modification_time: 1700000000000,
            data_change: true,
            stats: Some(r#"{"numRecords":10}"#.to_string()),
            tags: None,
        };
        let value = serde_json::to_value(Action::Add(add.clone())).unwrap();
        assert_eq!(
            value,
            json!({
                "add": {
                    "path": "colAuthorIdTest=1/part-00000-aaaa-c000.snappy.parquet",
                    "partitionValues": {"colAuthorIdTest": "1"},
                    "size": 1234,
                    "modificationTime": 1700000000000i64,
                    "dataChange": true,
                    "stats": "{\"numRecords\":10}",
                }
            })
        );
        // absent optional fields stay off the wire entirely
        let text = serde_json::to_string(&Action::Add(add)).unwrap();
        assert!(!text.contains("tags"));
    }

    #[test]
    fn remove_wire_format_skips_absent_fields() {
        let remove = Remove {
            path: "part-00000-bbbb-c000.snappy.parquet".to_string(),
            deletion_timestamp: Some(1700000000001),
            data_change: true,
            extended_file_metadata: None,
            partition_values: None,
            size: None,
        };
        let json = serde_json::to_string(&Action::Remove(remove)).unwrap();
        assert_eq!(
            json,
            r#"{"remove":{"path":"part-00000-bbbb-c000.snappy.parquet","deletionTimestamp":1700000000001,"dataChange":true}}"#
        );
    }

    #[test]
    fn null_partition_value_serializes_as_json_null() {
        let add = Add {
            path: "colAuthorIdTest=__HIVE_DEFAULT_PARTITION__/part-00000-cccc-c000.snappy.parquet"
                .to_string(),
            partition_values: HashMap::from([("colAuthorIdTest".to_string(), None)]),
            size: 10,
            modification_time: 0,
            data_change: true,
            stats: None,
            tags: None,
        };
        let json = serde_json::to_string(&add).unwrap();
        assert!(json.contains(r#""partitionValues":{"colAuthorIdTest":null}"#));
    }

    #[test]
    fn metadata_round_trip() {
        let schema = crate::schema::StructType::try_new(vec![
            StructField::not_null("id", DataType::LONG),
            StructField::nullable("payload", DataType::STRING),
        ])
        .unwrap();
        let metadata = Metadata::try_new(
            &schema,
            vec!["id".to_string()],
            HashMap::from([(CHECKPOINT_INTERVAL_PROP.to_string(), "5".to_string())]),
            Some("events".to_string()),
            None,
        )
        .unwrap();
        assert_eq!(metadata.checkpoint_interval(), 5);
        assert_eq!(metadata.parse_schema().unwrap(), schema);

        let encoded = serde_json::to_string(&Action::Metadata(metadata.clone())).unwrap();
        let decoded: Action = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, Action::Metadata(metadata));
    }

    #[test]
    fn metadata_rejects_unknown_partition_column() {
        let schema =
            crate::schema::StructType::try_new(vec![StructField::not_null("id", DataType::LONG)])
                .unwrap();
        let err = Metadata::try_new(&schema, vec!["other".to_string()], HashMap::new(), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn metadata_rejects_unpartitionable_type() {
        let schema =
            crate::schema::StructType::try_new(vec![StructField::not_null("x", DataType::DOUBLE)])
                .unwrap();
        let err = Metadata::try_new(&schema, vec!["x".to_string()], HashMap::new(), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn checkpoint_interval_defaults_and_ignores_garbage() {
        let schema =
            crate::schema::StructType::try_new(vec![StructField::not_null("id", DataType::LONG)])
                .unwrap();
        let mut metadata = Metadata::try_new(&schema, vec![], HashMap::new(), None, None).unwrap();
        assert_eq!(metadata.checkpoint_interval(), DEFAULT_CHECKPOINT_INTERVAL);
        metadata
            .configuration
            .insert(CHECKPOINT_INTERVAL_PROP.to_string(), "zero".to_string());
        assert_eq!(metadata.checkpoint_interval(), DEFAULT_CHECKPOINT_INTERVAL);
        metadata
            .configuration
            .insert(CHECKPOINT_INTERVAL_PROP.to_string(), "0".to_string());
        assert_eq!(metadata.checkpoint_interval(), DEFAULT_CHECKPOINT_INTERVAL);
    }

    #[test]
    fn commit_info_preserves_foreign_fields() {
        let line = r#"{"commitInfo":{"timestamp":1,"operation":"WRITE","clusterId":"c-17"}}"#;
        let actions = decode_actions(line.as_bytes(), &test_url()).unwrap();
        let Action::CommitInfo(info) = &actions[0] else {
            panic!("expected commit info");
        };
        assert_eq!(info.info.get("clusterId"), Some(&json!("c-17")));
        let encoded = serde_json::to_string(&actions[0]).unwrap();
        assert!(encoded.contains("clusterId"));
    }

    #[test]
    fn decode_skips_blank_lines_and_unknown_actions() {
        let body = concat!(
            r#"{"commitInfo":{"timestamp":1}}"#,
            "\n\n",
            r#"{"somethingNew":{"x":1}}"#,
            "\n",
            r#"{"add":{"path":"f","partitionValues":{},"size":1,"modificationTime":2,"dataChange":true,"futureField":7}}"#,
            "\n",
        );
        let actions = decode_actions(body.as_bytes(), &test_url()).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], Action::CommitInfo(_)));
        assert!(matches!(&actions[1], Action::Add(a) if a.path == "f"));
    }

    #[test]
    fn decode_reports_corrupt_line_numbers() {
        let body = "{\"commitInfo\":{}}\nnot json\n";
        let err = decode_actions(body.as_bytes(), &test_url()).unwrap_err();
        assert!(matches!(err, Error::LogCorrupt { message, .. } if message.contains("line 2")));
    }

    #[test]
    fn encode_decode_round_trip() {
        let actions = vec![
            Action::Protocol(Protocol::supported()),
            Action::Txn(SetTransaction {
                app_id: "app-1".to_string(),
                version: 3,
                last_updated: None,
            }),
        ];
        let bytes = encode_actions(&actions).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 2);
        let decoded = decode_actions(&bytes, &test_url()).unwrap();
        assert_eq!(decoded, actions);
    }

    #[test]
    fn pass_through_actions_round_trip() {
        let actions = vec![
            Action::Cdc(Cdc {
                path: "_change_data/cdc-00000-dddd.snappy.parquet".to_string(),
                partition_values: HashMap::from([(
                    "colAuthorIdTest".to_string(),
                    Some("2".to_string()),
                )]),
                size: 99,
                data_change: false,
                tags: None,
            }),
            Action::DomainMetadata(DomainMetadata {
                domain: "delta.clustering".to_string(),
                configuration: r#"{"clusteringColumns":[]}"#.to_string(),
                removed: false,
            }),
        ];
        let bytes = encode_actions(&actions).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""cdc":{"#));
        assert!(text.contains(r#""domainMetadata":{"#));
        let decoded = decode_actions(&bytes, &test_url()).unwrap();
        assert_eq!(decoded, actions);
    }

    #[test]
    fn protocol_gates() {
        Protocol::supported().ensure_read_supported().unwrap();
        Protocol::supported().ensure_write_supported().unwrap();

        let newer_reader = Protocol {
            min_reader_version: 3,
            min_writer_version: 7,
            reader_features: Some(vec!["deletionVectors".to_string()]),
            writer_features: Some(vec!["deletionVectors".to_string()]),
        };
        assert!(matches!(
            newer_reader.ensure_read_supported(),
            Err(Error::UnsupportedProtocol { .. })
        ));

        let newer_writer = Protocol {
            min_reader_version: 1,
            min_writer_version: 4,
            reader_features: None,
            writer_features: None,
        };
        newer_writer.ensure_read_supported().unwrap();
        assert!(matches!(
            newer_writer.ensure_write_supported(),
            Err(Error::UnsupportedProtocol { .. })
        ));
    }
}
