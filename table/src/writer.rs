//! Writing record batches out as parquet data files.
//!
//! Incoming batches are validated against the table schema, split into one
//! group per distinct combination of partition values, and each group is
//! encoded as a single snappy-compressed parquet file. Partition columns are
//! not written into the files; their values live in the directory names and
//! in the `partitionValues` of the add action.

use std::collections::HashMap;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, PrimitiveArray, RecordBatch, StringArray,
    UInt32Array,
};
use arrow::compute;
use arrow::datatypes::{ArrowPrimitiveType, DataType as ArrowDataType};
use futures::stream::{self, StreamExt, TryStreamExt};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;
use uuid::Uuid;

use crate::actions::Add;
use crate::schema::{validate_batch_schema, StructType};
use crate::storage::StorageClient;
use crate::utils::require;
use crate::{DeltaResult, Error};

/// Directory name standing in for a null partition value.
const NULL_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

/// Characters escaped in partition directory names, following the hive
/// layout convention.
const INVALID: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'*')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'~');

/// Write `batches` into new data files under `table_root` and return the add
/// actions describing them. Uploads run `io_concurrency` at a time.
pub(crate) async fn write_data_files(
    storage: &StorageClient,
    table_root: &Url,
    table_schema: &StructType,
    partition_columns: &[String],
    batches: &[RecordBatch],
    io_concurrency: usize,
) -> DeltaResult<Vec<Add>> {
    for batch in batches {
        validate_batch_schema(table_schema, batch.schema().as_ref())?;
    }
    let groups = partition_batches(batches, partition_columns)?;
    let uploads = groups.into_iter().map(|(key, batch)| {
        let storage = storage.clone();
        let table_root = table_root.clone();
        async move { upload_data_file(&storage, &table_root, partition_columns, key, batch).await }
    });
    stream::iter(uploads)
        .buffered(io_concurrency.max(1))
        .try_collect()
        .await
}

/// Split batches into one combined batch per distinct partition key, ordered
/// by key. Unpartitioned tables produce at most one group.
fn partition_batches(
    batches: &[RecordBatch],
    partition_columns: &[String],
) -> DeltaResult<Vec<(Vec<Option<String>>, RecordBatch)>> {
    let non_empty: Vec<&RecordBatch> = batches.iter().filter(|b| b.num_rows() > 0).collect();
    let Some(first) = non_empty.first() else {
        return Ok(Vec::new());
    };
    if partition_columns.is_empty() {
        let combined = compute::concat_batches(&first.schema(), non_empty)?;
        return Ok(vec![(Vec::new(), combined)]);
    }

    let mut groups: HashMap<Vec<Option<String>>, Vec<RecordBatch>> = HashMap::new();
    for batch in non_empty {
        let mut key_columns = Vec::with_capacity(partition_columns.len());
        for column in partition_columns {
            let idx = batch.schema().index_of(column)?;
            key_columns.push(stringify_column(batch.column(idx).as_ref(), column)?);
        }
        let mut row_indices: HashMap<Vec<Option<String>>, Vec<u32>> = HashMap::new();
        for row in 0..batch.num_rows() {
            let key: Vec<Option<String>> =
                key_columns.iter().map(|values| values[row].clone()).collect();
            row_indices.entry(key).or_default().push(row as u32);
        }
        for (key, indices) in row_indices {
            groups.entry(key).or_default().push(take_rows(batch, &indices)?);
        }
    }

    let mut grouped: Vec<(Vec<Option<String>>, Vec<RecordBatch>)> = groups.into_iter().collect();
    grouped.sort_by(|a, b| a.0.cmp(&b.0));
    grouped
        .into_iter()
        .map(|(key, parts)| {
            let combined = compute::concat_batches(&parts[0].schema(), &parts)?;
            Ok((key, combined))
        })
        .collect()
}

fn take_rows(batch: &RecordBatch, indices: &[u32]) -> DeltaResult<RecordBatch> {
    let indices = UInt32Array::from(indices.to_vec());
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|column| compute::take(column.as_ref(), &indices, None))
        .collect::<Result<_, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

/// Render a partition column as the strings that go into directory names and
/// `partitionValues`, one entry per row, `None` for null.
fn stringify_column(array: &dyn Array, column: &str) -> DeltaResult<Vec<Option<String>>> {
    use arrow::datatypes::{Int16Type, Int32Type, Int64Type, Int8Type};
    match array.data_type() {
        ArrowDataType::Utf8 => {
            let values = downcast::<StringArray>(array, column)?;
            Ok((0..values.len())
                .map(|i| (!values.is_null(i)).then(|| values.value(i).to_string()))
                .collect())
        }
        ArrowDataType::Int64 => stringify_primitive::<Int64Type>(array, column),
        ArrowDataType::Int32 => stringify_primitive::<Int32Type>(array, column),
        ArrowDataType::Int16 => stringify_primitive::<Int16Type>(array, column),
        ArrowDataType::Int8 => stringify_primitive::<Int8Type>(array, column),
        ArrowDataType::Boolean => {
            let values = downcast::<BooleanArray>(array, column)?;
            Ok((0..values.len())
                .map(|i| (!values.is_null(i)).then(|| values.value(i).to_string()))
                .collect())
        }
        ArrowDataType::Date32 => {
            let values = downcast::<Date32Array>(array, column)?;
            let mut out = Vec::with_capacity(values.len());
            for i in 0..values.len() {
                if values.is_null(i) {
                    out.push(None);
                } else {
                    let date = values.value_as_date(i).ok_or_else(|| {
                        Error::generic(format!("column \"{column}\" holds an out of range date"))
                    })?;
                    out.push(Some(date.to_string()));
                }
            }
            Ok(out)
        }
        other => Err(Error::schema_mismatch(format!(
            "column \"{column}\" of type {other} cannot be a partition column"
        ))),
    }
}

fn stringify_primitive<T>(array: &dyn Array, column: &str) -> DeltaResult<Vec<Option<String>>>
where
    T: ArrowPrimitiveType,
    T::Native: ToString,
{
    let values = downcast::<PrimitiveArray<T>>(array, column)?;
    Ok((0..values.len())
        .map(|i| (!values.is_null(i)).then(|| values.value(i).to_string()))
        .collect())
}

fn downcast<'a, T: 'static>(array: &'a dyn Array, column: &str) -> DeltaResult<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::generic(format!("unexpected array type for column \"{column}\"")))
}

async fn upload_data_file(
    storage: &StorageClient,
    table_root: &Url,
    partition_columns: &[String],
    key: Vec<Option<String>>,
    batch: RecordBatch,
) -> DeltaResult<Add> {
    let relative_path = relative_data_path(partition_columns, &key);
    let physical = strip_partition_columns(&batch, partition_columns)?;
    let data = encode_parquet(&physical)?;
    let size = data.len();

    let file_url = table_root.join(&relative_path)?;
    storage.put(&file_url, data.into()).await?;
    let meta = storage.head(&file_url).await?;
    require!(
        meta.size == size as u64,
        Error::generic(format!(
            "file {file_url} has size {} after writing {size} bytes",
            meta.size
        ))
    );

    let partition_values = partition_columns.iter().cloned().zip(key).collect();
    Ok(Add {
        path: relative_path,
        partition_values,
        size: size as i64,
        modification_time: meta.last_modified,
        data_change: true,
        stats: Some(format!(r#"{{"numRecords":{}}}"#, batch.num_rows())),
        tags: None,
    })
}

/// Table-relative path of a new data file: hive-style partition directories
/// followed by a unique file name.
fn relative_data_path(partition_columns: &[String], key: &[Option<String>]) -> String {
    let mut path = String::new();
    for (column, value) in partition_columns.iter().zip(key) {
        path.push_str(column);
        path.push('=');
        match value {
            Some(value) => path.push_str(&utf8_percent_encode(value, INVALID).to_string()),
            None => path.push_str(NULL_PARTITION_VALUE),
        }
        path.push('/');
    }
    path.push_str(&format!("part-00000-{}-c000.snappy.parquet", Uuid::new_v4()));
    path
}

fn strip_partition_columns(
    batch: &RecordBatch,
    partition_columns: &[String],
) -> DeltaResult<RecordBatch> {
    if partition_columns.is_empty() {
        return Ok(batch.clone());
    }
    let keep: Vec<usize> = batch
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, field)| !partition_columns.iter().any(|p| p == field.name()))
        .map(|(idx, _)| idx)
        .collect();
    Ok(batch.project(&keep)?)
}

fn encode_parquet(batch: &RecordBatch) -> DeltaResult<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buf)
}
