//! The shared runtime behind table handles.
//!
//! A [`Runtime`] owns two things every table handle needs: a cache of object
//! store clients keyed by store identity and the storage options they were
//! built with, and a dedicated background thread that runs maintenance work
//! such as checkpointing without blocking commits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use object_store::DynObjectStore;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::storage::StorageClient;
use crate::transaction::DEFAULT_MAX_COMMIT_RETRIES;
use crate::{DeltaResult, Error};

/// Tunables shared by every table handle created under one [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// How many storage requests one operation may have in flight at a time.
    pub io_concurrency: usize,
    /// How many times a commit retries after losing a race.
    pub max_commit_retries: u32,
    /// Whether checkpoints get written in the background when they come due.
    pub background_checkpoints: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            io_concurrency: 10,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            background_checkpoints: true,
        }
    }
}

type StoreKey = (String, Option<String>, Option<u16>);

/// Store identity plus the options the client was built with. Options are
/// part of the key so two tables on the same host with different credentials
/// never share a client.
type BuiltStoreKey = (StoreKey, Vec<(String, String)>);

fn store_key(url: &Url) -> StoreKey {
    (
        url.scheme().to_string(),
        url.host_str().map(str::to_string),
        url.port(),
    )
}

fn built_store_key(url: &Url, options: &HashMap<String, String>) -> BuiltStoreKey {
    let mut options: Vec<_> = options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    options.sort_unstable();
    (store_key(url), options)
}

/// Shared infrastructure for table handles. Cheap to clone; clones share the
/// same store cache and maintenance thread.
///
/// Once [`Runtime::shutdown`] runs, every handle created under the runtime
/// fails with [`Error::RuntimeShutdown`].
#[derive(Debug, Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

#[derive(Debug)]
struct RuntimeInner {
    options: RuntimeOptions,
    /// Clients handed in through [`Runtime::register_store`], one per store
    /// identity. They override url parsing for every lookup that matches.
    registered: RwLock<HashMap<StoreKey, Arc<DynObjectStore>>>,
    /// Clients built from a url and storage options, pooled per identity and
    /// option set.
    built: RwLock<HashMap<BuiltStoreKey, Arc<DynObjectStore>>>,
    maintenance: Mutex<Option<mpsc::UnboundedSender<BoxFuture<'static, ()>>>>,
    closed: AtomicBool,
}

impl Runtime {
    /// A runtime with default options.
    pub fn new() -> DeltaResult<Self> {
        Self::with_options(RuntimeOptions::default())
    }

    /// A runtime with the given options.
    pub fn with_options(options: RuntimeOptions) -> DeltaResult<Self> {
        let maintenance = spawn_maintenance_thread()?;
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                options,
                registered: RwLock::new(HashMap::new()),
                built: RwLock::new(HashMap::new()),
                maintenance: Mutex::new(Some(maintenance)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// Register an object store for every table reachable under `url`'s
    /// scheme and authority. Lookups for matching locations reuse the
    /// registered client instead of building one from the url.
    pub fn register_store(&self, url: &Url, store: Arc<DynObjectStore>) {
        let mut registered = match self.inner.registered.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registered.insert(store_key(url), store);
    }

    /// The storage client for a table location: a registered client if one
    /// matches, otherwise built from the url and options and pooled.
    pub(crate) fn store_for(
        &self,
        url: &Url,
        options: &HashMap<String, String>,
    ) -> DeltaResult<StorageClient> {
        self.ensure_open()?;
        {
            let registered = match self.inner.registered.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(store) = registered.get(&store_key(url)) {
                return Ok(StorageClient::new(store.clone(), url.scheme()));
            }
        }

        let key = built_store_key(url, options);
        {
            let built = match self.inner.built.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(store) = built.get(&key) {
                return Ok(StorageClient::new(store.clone(), url.scheme()));
            }
        }

        let (store, _) = object_store::parse_url_opts(url, options)
            .map_err(|e| Error::invalid_table_location(format!("{url}: {e}")))?;
        let store: Arc<DynObjectStore> = Arc::from(store);
        let mut built = match self.inner.built.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // first in wins if two threads raced on the same key
        let store = built.entry(key).or_insert(store).clone();
        Ok(StorageClient::new(store, url.scheme()))
    }

    /// Queue work for the maintenance thread. Silently dropped when the
    /// runtime is shut down.
    pub(crate) fn spawn_maintenance(&self, task: BoxFuture<'static, ()>) {
        let maintenance = match self.inner.maintenance.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match maintenance.as_ref() {
            Some(sender) => {
                if sender.send(task).is_err() {
                    warn!("maintenance thread is gone, dropping task");
                }
            }
            None => debug!("runtime is shut down, dropping maintenance task"),
        }
    }

    pub(crate) fn ensure_open(&self) -> DeltaResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::RuntimeShutdown);
        }
        Ok(())
    }

    /// Stop accepting work and let the maintenance thread drain and exit.
    /// Every handle created under this runtime becomes unusable.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut maintenance = match self.inner.maintenance.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        maintenance.take();
    }
}

/// Start the maintenance thread: a current-thread tokio runtime draining a
/// queue of boxed futures, one at a time, in submission order.
fn spawn_maintenance_thread() -> DeltaResult<mpsc::UnboundedSender<BoxFuture<'static, ()>>> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::generic(format!("failed to build maintenance runtime: {e}")))?;
    std::thread::Builder::new()
        .name("delta-table-maintenance".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                while let Some(task) = receiver.recv().await {
                    task.await;
                }
            });
        })
        .map_err(|e| Error::generic(format!("failed to start maintenance thread: {e}")))?;
    Ok(sender)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn registered_store_is_reused_for_lookups() {
        let runtime = Runtime::new().unwrap();
        let url = Url::parse("memory:///shared/table/").unwrap();
        runtime.register_store(&url, Arc::new(InMemory::new()));

        let object = Url::parse("memory:///shared/table/file").unwrap();
        let writer = runtime.store_for(&url, &HashMap::new()).unwrap();
        writer.put(&object, Bytes::from_static(b"x")).await.unwrap();

        // a second lookup must observe what the first one wrote
        let reader = runtime.store_for(&url, &HashMap::new()).unwrap();
        assert_eq!(reader.get(&object).await.unwrap().as_ref(), b"x");
    }

    #[tokio::test]
    async fn unregistered_memory_urls_get_a_fresh_store() {
        let runtime = Runtime::new().unwrap();
        let url = Url::parse("memory:///elsewhere/").unwrap();
        let client = runtime.store_for(&url, &HashMap::new()).unwrap();
        let object = Url::parse("memory:///elsewhere/file").unwrap();
        assert!(client.get_opt(&object).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn storage_options_are_part_of_the_client_identity() {
        let runtime = Runtime::new().unwrap();
        let url = Url::parse("memory:///pooled/").unwrap();
        let object = Url::parse("memory:///pooled/file").unwrap();
        let options = HashMap::from([("bearer_token".to_string(), "a".to_string())]);

        let first = runtime.store_for(&url, &options).unwrap();
        first.put(&object, Bytes::from_static(b"x")).await.unwrap();

        // same options hit the pooled client and see its writes
        let second = runtime.store_for(&url, &options).unwrap();
        assert_eq!(second.get(&object).await.unwrap().as_ref(), b"x");

        // different options build a separate client
        let other_options = HashMap::from([("bearer_token".to_string(), "b".to_string())]);
        let other = runtime.store_for(&url, &other_options).unwrap();
        assert!(other.get_opt(&object).await.unwrap().is_none());
    }

    #[test]
    fn unknown_scheme_is_an_invalid_location() {
        let runtime = Runtime::new().unwrap();
        let url = Url::parse("carrier-pigeon://coop/table/").unwrap();
        let err = runtime.store_for(&url, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidTableLocation(_)));
    }

    #[tokio::test]
    async fn maintenance_thread_runs_queued_tasks_in_order() {
        let runtime = Runtime::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        for i in 0..3 {
            let tx = tx.clone();
            runtime.spawn_maintenance(Box::pin(async move {
                let _ = tx.send(i);
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn shutdown_invalidates_the_runtime() {
        let runtime = Runtime::new().unwrap();
        let clone = runtime.clone();
        runtime.shutdown();

        assert!(matches!(runtime.ensure_open(), Err(Error::RuntimeShutdown)));
        // clones share the shut down state
        let url = Url::parse("memory:///after/").unwrap();
        assert!(matches!(
            clone.store_for(&url, &HashMap::new()),
            Err(Error::RuntimeShutdown)
        ));
        // queueing after shutdown is a quiet no-op
        runtime.spawn_maintenance(Box::pin(async {}));
    }
}
