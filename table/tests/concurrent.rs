use std::collections::HashSet;

use futures::StreamExt;
use object_store::path::Path;
use object_store::ObjectStore;

use delta_table::{InsertOptions, Runtime, Table, TableCreateOptions, TableLoadOptions};

use test_utils::{
    memory_store_and_table_url, partitioned_test_batch, partitioned_test_schema, test_batch,
    test_schema, AUTHOR_COLUMN,
};

#[tokio::test]
async fn racing_writers_take_consecutive_versions() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt::try_init();
    let runtime = Runtime::new()?;
    let (store, base, table_url) = memory_store_and_table_url("race");
    runtime.register_store(&base, store.clone());
    Table::create(
        &runtime,
        table_url.as_str(),
        TableCreateOptions::new(test_schema()),
    )
    .await?;

    let mut writers = Vec::new();
    for _ in 0..2 {
        let runtime = runtime.clone();
        let table_url = table_url.clone();
        writers.push(tokio::spawn(async move {
            let mut table =
                Table::load(&runtime, table_url.as_str(), TableLoadOptions::new()).await?;
            table.insert(&[test_batch(3)], InsertOptions::default()).await
        }));
    }
    let mut versions = HashSet::new();
    for writer in writers {
        versions.insert(writer.await??);
    }
    // exactly one writer won version 1, the other retried onto version 2
    assert_eq!(versions, HashSet::from([1, 2]));

    let table = Table::load(&runtime, table_url.as_str(), TableLoadOptions::new()).await?;
    assert_eq!(table.version(), 2);
    assert_eq!(table.files().len(), 2);
    Ok(())
}

#[tokio::test]
async fn disjoint_partition_writes_both_land() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt::try_init();
    let runtime = Runtime::new()?;
    let (store, base, table_url) = memory_store_and_table_url("disjoint");
    runtime.register_store(&base, store.clone());
    let options = TableCreateOptions::new(partitioned_test_schema())
        .with_partition_columns([AUTHOR_COLUMN]);
    Table::create(&runtime, table_url.as_str(), options).await?;

    let mut writers = Vec::new();
    for author in [1, 2] {
        let runtime = runtime.clone();
        let table_url = table_url.clone();
        writers.push(tokio::spawn(async move {
            let mut table =
                Table::load(&runtime, table_url.as_str(), TableLoadOptions::new()).await?;
            table
                .insert(
                    &[partitioned_test_batch(&[Some(author); 4])],
                    InsertOptions::default(),
                )
                .await
        }));
    }
    let mut versions = HashSet::new();
    for writer in writers {
        versions.insert(writer.await??);
    }
    assert_eq!(versions, HashSet::from([1, 2]));

    // the final file set is the union of both writes
    let table = Table::load(&runtime, table_url.as_str(), TableLoadOptions::new()).await?;
    assert_eq!(table.files().len(), 2);
    let authors: HashSet<String> = table
        .files()
        .iter()
        .map(|f| f.partition_values[AUTHOR_COLUMN].clone().unwrap())
        .collect();
    assert_eq!(authors, HashSet::from(["1".to_string(), "2".to_string()]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_writers_looping_inserts_never_share_a_version(
) -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt::try_init();
    let runtime = Runtime::new()?;
    let (store, base, table_url) = memory_store_and_table_url("loop");
    runtime.register_store(&base, store.clone());
    let options = TableCreateOptions::new(partitioned_test_schema())
        .with_partition_columns([AUTHOR_COLUMN]);
    Table::create(&runtime, table_url.as_str(), options).await?;

    let mut writers = Vec::new();
    for author in [1, 2] {
        let runtime = runtime.clone();
        let table_url = table_url.clone();
        writers.push(tokio::spawn(async move {
            let mut table =
                Table::load(&runtime, table_url.as_str(), TableLoadOptions::new()).await?;
            let mut versions = Vec::new();
            for _ in 0..10 {
                let version = table
                    .insert(
                        &[partitioned_test_batch(&[Some(author)])],
                        InsertOptions::default(),
                    )
                    .await?;
                versions.push(version);
            }
            Ok::<_, delta_table::Error>(versions)
        }));
    }
    let mut all_versions = Vec::new();
    for writer in writers {
        all_versions.extend(writer.await??);
    }

    // twenty commits landed, no two sharing a version number
    let distinct: HashSet<u64> = all_versions.iter().copied().collect();
    assert_eq!(distinct.len(), 20);
    all_versions.sort_unstable();
    assert_eq!(all_versions, (1..=20).collect::<Vec<u64>>());

    // a full replay sees every written file
    let table = Table::load(&runtime, table_url.as_str(), TableLoadOptions::new()).await?;
    assert_eq!(table.version(), 20);
    assert_eq!(table.files().len(), 20);
    let per_author = |id: &str| {
        table
            .files()
            .iter()
            .filter(|f| f.partition_values[AUTHOR_COLUMN].as_deref() == Some(id))
            .count()
    };
    assert_eq!(per_author("1"), 10);
    assert_eq!(per_author("2"), 10);
    assert_eq!(table.history(None).await?.len(), 21);
    Ok(())
}

#[tokio::test]
async fn rename_strategy_races_cleanly() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt::try_init();
    let runtime = Runtime::new()?;
    let (store, base, table_url) = memory_store_and_table_url("rename_race");
    runtime.register_store(&base, store.clone());
    let options = TableCreateOptions::new(test_schema())
        .with_storage_options([("commit_strategy", "rename")]);
    Table::create(&runtime, table_url.as_str(), options).await?;

    let mut writers = Vec::new();
    for _ in 0..2 {
        let runtime = runtime.clone();
        let table_url = table_url.clone();
        writers.push(tokio::spawn(async move {
            let options = TableLoadOptions::new()
                .with_storage_options([("commit_strategy", "rename")]);
            let mut table = Table::load(&runtime, table_url.as_str(), options).await?;
            table.insert(&[test_batch(3)], InsertOptions::default()).await
        }));
    }
    let mut versions = HashSet::new();
    for writer in writers {
        versions.insert(writer.await??);
    }
    assert_eq!(versions, HashSet::from([1, 2]));

    // staged commits were either renamed into place or cleaned up
    let mut listing = store.list(Some(&Path::from("rename_race/_delta_log")));
    while let Some(meta) = listing.next().await {
        let name = meta?.location.to_string();
        assert!(!name.contains("_commit_"), "staged file left behind: {name}");
    }
    Ok(())
}
