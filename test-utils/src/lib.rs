//! Shared helpers for integration tests.

use std::sync::Arc;

use arrow::array::{Int32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use serde_json::{json, Deserializer, Value};
use url::Url;

use delta_table::schema::{DataType, StructField, StructType};

/// The column names of the standard test table.
pub const STRING_COLUMN: &str = "colStringTest";
pub const INTEGER_COLUMN: &str = "colIntegerTest";
pub const AUTHOR_COLUMN: &str = "colAuthorIdTest";

/// An in-memory store plus the base url it serves and the url of a table
/// named `name` inside it. Register the store under the base url and point
/// table operations at the table url.
pub fn memory_store_and_table_url(name: &str) -> (Arc<dyn ObjectStore>, Url, Url) {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let base = Url::parse("memory:///").unwrap();
    let table = base.join(&format!("{name}/")).unwrap();
    (store, base, table)
}

/// The path of a log file for `version`, e.g. suffix `json` for a commit.
pub fn delta_path_for_version(version: u64, suffix: &str) -> Path {
    let path = format!("_delta_log/{version:020}.{suffix}");
    Path::from(path.as_str())
}

/// Put a commit file for `version` at the store root.
pub async fn add_commit(
    store: &dyn ObjectStore,
    version: u64,
    data: String,
) -> Result<(), object_store::Error> {
    let path = delta_path_for_version(version, "json");
    store.put(&path, data.into()).await?;
    Ok(())
}

/// A fragment of a fabricated commit.
pub enum TestAction {
    /// Protocol line followed by a metadata line for [`test_schema`].
    Metadata,
    Add(String),
    Remove(String),
}

/// Render test actions as newline-delimited commit content.
pub fn actions_to_string(actions: &[TestAction]) -> String {
    actions
        .iter()
        .map(|action| match action {
            TestAction::Metadata => format!(
                "{}\n{}",
                json!({"protocol": {"minReaderVersion": 1, "minWriterVersion": 2}}),
                json!({"metaData": {
                    "id": "00000000-0000-0000-0000-000000000000",
                    "format": {"provider": "parquet", "options": {}},
                    "schemaString": test_schema().to_schema_string().unwrap(),
                    "partitionColumns": [],
                    "configuration": {},
                }}),
            ),
            TestAction::Add(path) => json!({"add": {
                "path": path,
                "partitionValues": {},
                "size": 100,
                "modificationTime": 100,
                "dataChange": true,
            }})
            .to_string(),
            TestAction::Remove(path) => json!({"remove": {
                "path": path,
                "deletionTimestamp": 100,
                "dataChange": true,
            }})
            .to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The standard test table schema: a not-null string column and a not-null
/// integer column.
pub fn test_schema() -> StructType {
    StructType::try_new(vec![
        StructField::not_null(STRING_COLUMN, DataType::STRING),
        StructField::not_null(INTEGER_COLUMN, DataType::INTEGER),
    ])
    .unwrap()
}

/// [`test_schema`] plus a nullable integer author id, meant to be the
/// partition column.
pub fn partitioned_test_schema() -> StructType {
    StructType::try_new(vec![
        StructField::not_null(STRING_COLUMN, DataType::STRING),
        StructField::not_null(INTEGER_COLUMN, DataType::INTEGER),
        StructField::nullable(AUTHOR_COLUMN, DataType::INTEGER),
    ])
    .unwrap()
}

fn arrow_test_schema(with_author: bool) -> Arc<ArrowSchema> {
    let mut fields = vec![
        Field::new(STRING_COLUMN, ArrowDataType::Utf8, false),
        Field::new(INTEGER_COLUMN, ArrowDataType::Int32, false),
    ];
    if with_author {
        fields.push(Field::new(AUTHOR_COLUMN, ArrowDataType::Int32, true));
    }
    Arc::new(ArrowSchema::new(fields))
}

/// A batch of `rows` rows matching [`test_schema`], with deterministic
/// values `row-0..row-N` and `0..N`.
pub fn test_batch(rows: usize) -> RecordBatch {
    let strings = StringArray::from_iter_values((0..rows).map(|i| format!("row-{i}")));
    let integers = Int32Array::from_iter_values(0..rows as i32);
    RecordBatch::try_new(
        arrow_test_schema(false),
        vec![Arc::new(strings), Arc::new(integers)],
    )
    .unwrap()
}

/// A batch matching [`partitioned_test_schema`], one row per entry in
/// `author_ids` (with `None` for authors that should land in the null
/// partition).
pub fn partitioned_test_batch(author_ids: &[Option<i32>]) -> RecordBatch {
    let rows = author_ids.len();
    let strings = StringArray::from_iter_values((0..rows).map(|i| format!("row-{i}")));
    let integers = Int32Array::from_iter_values(0..rows as i32);
    let authors = Int32Array::from_iter(author_ids.iter().copied());
    RecordBatch::try_new(
        arrow_test_schema(true),
        vec![Arc::new(strings), Arc::new(integers), Arc::new(authors)],
    )
    .unwrap()
}

/// Read an object as newline-delimited JSON.
pub async fn read_json_lines(
    store: &dyn ObjectStore,
    path: &Path,
) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
    let data = store.get(path).await?.bytes().await?;
    let values = Deserializer::from_slice(&data)
        .into_iter::<Value>()
        .collect::<Result<_, _>>()?;
    Ok(values)
}

/// Overwrite the value at a dotted `path` inside a JSON document, so tests
/// can normalize timestamps and ids before comparing against a golden value.
pub fn set_json_value(value: &mut Value, path: &str, new_value: Value) -> Result<(), String> {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, init) = parts
        .split_last()
        .ok_or_else(|| "empty json path".to_string())?;
    let mut current = value;
    for key in init {
        current = current
            .get_mut(key)
            .ok_or_else(|| format!("no key {key} in json path {path}"))?;
    }
    current
        .as_object_mut()
        .ok_or_else(|| format!("{path} does not point into an object"))?
        .insert((*last).to_string(), new_value);
    Ok(())
}
