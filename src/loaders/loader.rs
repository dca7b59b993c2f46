//! Request-scoped batching loader.
//!
//! `load` enqueues a key into the open batch and hands back a shared future.
//! Nothing is fetched until some handle is first polled: that poll yields
//! once to the scheduler, so every `load` issued in the same execution
//! quantum lands in the batch, then closes the batch and calls the batch
//! function with the queued keys. A batch that reaches the size cap closes
//! immediately and dispatches on its first poll without yielding.
//!
//! Every key has one cache slot for the lifetime of the loader, so a key is
//! fetched at most once and duplicate `load`s resolve to the same `Arc`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use futures_util::future::{self, BoxFuture, FutureExt, JoinAll, Shared};

use crate::context::RequestContext;
use crate::error::ErrorKind;
use crate::loaders::LoaderError;
use crate::observability::metrics;
use crate::resilience::timeouts::{bounded, Interrupted};

/// One slot's outcome: `Ok(None)` means no row.
pub type LoadResult<V> = Result<Option<Arc<V>>, LoaderError>;

/// A pending or completed lookup. Clones resolve to the same value.
pub type LoadHandle<V> = Shared<BoxFuture<'static, LoadResult<V>>>;

type BatchOutput<V> = Shared<BoxFuture<'static, Arc<Vec<LoadResult<V>>>>>;

/// Fetches a batch of unique keys.
///
/// The returned vector must be positionally aligned with `keys`; `None`
/// marks a key with no row.
#[async_trait]
pub trait BatchFn<K, V>: Send + Sync {
    async fn load(&self, ctx: &RequestContext, keys: &[K]) -> Result<Vec<Option<V>>, LoaderError>;
}

#[derive(Debug)]
struct Pending<K> {
    keys: Vec<K>,
    closed: bool,
}

struct Batch<K, V> {
    pending: Arc<Mutex<Pending<K>>>,
    output: BatchOutput<V>,
}

struct State<K, V> {
    cache: HashMap<K, LoadHandle<V>>,
    open: Option<Batch<K, V>>,
}

/// A batching, caching loader bound to one request.
pub struct Loader<K, V> {
    name: &'static str,
    batch_fn: Arc<dyn BatchFn<K, V>>,
    max_batch_size: usize,
    ctx: RequestContext,
    state: Arc<Mutex<State<K, V>>>,
}

impl<K, V> Clone for Loader<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            batch_fn: self.batch_fn.clone(),
            max_batch_size: self.max_batch_size,
            ctx: self.ctx.clone(),
            state: self.state.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for Loader<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("name", &self.name)
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
    }
}

impl<K, V> Loader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// `max_batch_size` of 0 leaves batches unbounded.
    pub fn new(
        name: &'static str,
        ctx: RequestContext,
        batch_fn: Arc<dyn BatchFn<K, V>>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            name,
            batch_fn,
            max_batch_size,
            ctx,
            state: Arc::new(Mutex::new(State {
                cache: HashMap::new(),
                open: None,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue `key` and return a handle to its result.
    pub fn load(&self, key: K) -> LoadHandle<V> {
        let mut state = self.lock();
        if let Some(handle) = state.cache.get(&key) {
            return handle.clone();
        }

        let joined = state.open.as_ref().and_then(|batch| {
            let mut pending = batch.pending.lock().expect("loader batch mutex poisoned");
            if pending.closed {
                return None;
            }
            pending.keys.push(key.clone());
            let index = pending.keys.len() - 1;
            let full = self.is_full(pending.keys.len());
            if full {
                pending.closed = true;
            }
            Some((batch.output.clone(), index, full))
        });

        let (output, index, full) = match joined {
            Some(joined) => joined,
            None => {
                let full = self.is_full(1);
                let batch = self.open_batch(key.clone(), full);
                let output = batch.output.clone();
                state.open = Some(batch);
                (output, 0, full)
            }
        };
        if full {
            state.open = None;
        }

        let handle = async move {
            let results = output.await;
            results
                .get(index)
                .cloned()
                .unwrap_or_else(|| {
                    Err(LoaderError::Misaligned {
                        expected: index + 1,
                        got: results.len(),
                    })
                })
        }
        .boxed()
        .shared();
        state.cache.insert(key, handle.clone());
        handle
    }

    /// Enqueue every key; the batch is shared with any other pending loads.
    pub fn load_many(&self, keys: impl IntoIterator<Item = K>) -> JoinAll<LoadHandle<V>> {
        let handles: Vec<_> = keys.into_iter().map(|key| self.load(key)).collect();
        future::join_all(handles)
    }

    /// Seed the cache with a known value. No-op when `key` is already cached
    /// or in flight.
    pub fn prime(&self, key: K, value: V) {
        let mut state = self.lock();
        state.cache.entry(key).or_insert_with(|| {
            future::ready(Ok(Some(Arc::new(value))))
                .boxed()
                .shared()
        });
    }

    /// Number of cached keys.
    pub fn cached(&self) -> usize {
        self.lock().cache.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K, V>> {
        self.state.lock().expect("loader mutex poisoned")
    }

    fn is_full(&self, queued: usize) -> bool {
        self.max_batch_size > 0 && queued >= self.max_batch_size
    }

    fn open_batch(&self, first: K, closed: bool) -> Batch<K, V> {
        let pending = Arc::new(Mutex::new(Pending {
            keys: vec![first],
            closed,
        }));
        let output = dispatch(
            self.name,
            self.batch_fn.clone(),
            self.ctx.clone(),
            pending.clone(),
        )
        .boxed()
        .shared();
        Batch { pending, output }
    }
}

async fn dispatch<K, V>(
    name: &'static str,
    batch_fn: Arc<dyn BatchFn<K, V>>,
    ctx: RequestContext,
    pending: Arc<Mutex<Pending<K>>>,
) -> Arc<Vec<LoadResult<V>>>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let closed_by_size = pending.lock().expect("loader batch mutex poisoned").closed;
    if !closed_by_size {
        tokio::task::yield_now().await;
    }

    let keys = {
        let mut pending = pending.lock().expect("loader batch mutex poisoned");
        pending.closed = true;
        std::mem::take(&mut pending.keys)
    };
    metrics::record_loader_batch(name, keys.len());
    tracing::trace!(loader = name, keys = keys.len(), "Dispatching batch");

    let fail_all = |err: LoaderError| -> Vec<LoadResult<V>> {
        (0..keys.len()).map(|_| Err(err.clone())).collect()
    };
    let results: Vec<LoadResult<V>> = match bounded(&ctx, batch_fn.load(&ctx, &keys)).await {
        Ok(Ok(values)) if values.len() == keys.len() => {
            values.into_iter().map(|v| Ok(v.map(Arc::new))).collect()
        }
        Ok(Ok(values)) => {
            tracing::error!(
                loader = name,
                expected = keys.len(),
                got = values.len(),
                "Batch result count mismatch"
            );
            fail_all(LoaderError::Misaligned {
                expected: keys.len(),
                got: values.len(),
            })
        }
        Ok(Err(err)) => fail_all(err),
        Err(Interrupted::Cancelled) => fail_all(LoaderError::Cancelled),
        Err(Interrupted::DeadlineExceeded) => fail_all(LoaderError::Fetch {
            kind: ErrorKind::Timeout,
            message: "Upstream timed out".to_string(),
        }),
    };
    Arc::new(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Echoes keys back upper-cased and records every batch it sees.
    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<String>>>,
        fail: bool,
        short: bool,
        delay: Option<Duration>,
    }

    impl Recorder {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchFn<String, String> for Recorder {
        async fn load(
            &self,
            _ctx: &RequestContext,
            keys: &[String],
        ) -> Result<Vec<Option<String>>, LoaderError> {
            self.batches.lock().unwrap().push(keys.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(LoaderError::Fetch {
                    kind: ErrorKind::Backend,
                    message: "Datastore unavailable".into(),
                });
            }
            let mut out: Vec<Option<String>> = keys
                .iter()
                .map(|k| (k != "missing").then(|| k.to_uppercase()))
                .collect();
            if self.short {
                out.pop();
            }
            Ok(out)
        }
    }

    fn loader(recorder: Arc<Recorder>, max: usize) -> Loader<String, String> {
        Loader::new("test", RequestContext::background(), recorder, max)
    }

    #[tokio::test]
    async fn test_coalesces_duplicate_keys_into_one_batch() {
        let recorder = Arc::new(Recorder::default());
        let loader = loader(recorder.clone(), 0);

        let a1 = loader.load("a".to_string());
        let b = loader.load("b".to_string());
        let a2 = loader.load("a".to_string());
        let (a1, b, a2) = futures_util::join!(a1, b, a2);

        assert_eq!(recorder.batches(), vec![vec!["a".to_string(), "b".to_string()]]);
        let a1 = a1.unwrap().unwrap();
        let a2 = a2.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(*a1, "A");
        assert_eq!(b.unwrap().as_deref().map(String::as_str), Some("B"));
    }

    #[tokio::test]
    async fn test_missing_row_is_empty_not_error() {
        let recorder = Arc::new(Recorder::default());
        let loader = loader(recorder, 0);
        assert_eq!(loader.load("missing".to_string()).await, Ok(None));
    }

    #[tokio::test]
    async fn test_prime_skips_batch_call() {
        let recorder = Arc::new(Recorder::default());
        let loader = loader(recorder.clone(), 0);
        loader.prime("p".to_string(), "primed".to_string());

        let value = loader.load("p".to_string()).await.unwrap().unwrap();
        assert_eq!(*value, "primed");
        assert!(recorder.batches().is_empty());
    }

    #[tokio::test]
    async fn test_prime_does_not_overwrite() {
        let recorder = Arc::new(Recorder::default());
        let loader = loader(recorder, 0);
        let value = loader.load("a".to_string()).await.unwrap().unwrap();
        loader.prime("a".to_string(), "other".to_string());
        assert_eq!(*loader.load("a".to_string()).await.unwrap().unwrap(), *value);
    }

    #[tokio::test]
    async fn test_completed_keys_are_not_refetched() {
        let recorder = Arc::new(Recorder::default());
        let loader = loader(recorder.clone(), 0);
        loader.load("a".to_string()).await.unwrap();
        let results = loader.load_many(["a".to_string(), "c".to_string()]).await;

        assert_eq!(results.len(), 2);
        assert_eq!(
            recorder.batches(),
            vec![vec!["a".to_string()], vec!["c".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_max_batch_size_splits_batches() {
        let recorder = Arc::new(Recorder::default());
        let loader = loader(recorder.clone(), 2);
        let keys = ["a", "b", "c", "d", "e"].map(String::from);
        let results = loader.load_many(keys).await;

        assert!(results.iter().all(|r| r.is_ok()));
        let batches = recorder.batches();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() <= 2));
        let mut seen: Vec<String> = batches.into_iter().flatten().collect();
        seen.sort();
        assert_eq!(seen, ["a", "b", "c", "d", "e"].map(String::from));
    }

    #[tokio::test]
    async fn test_batch_error_fails_every_slot() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let loader = loader(recorder, 0);
        let results = loader.load_many(["a".to_string(), "b".to_string()]).await;
        for result in results {
            assert!(matches!(
                result,
                Err(LoaderError::Fetch { kind: ErrorKind::Backend, .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_misaligned_results_are_internal_errors() {
        let recorder = Arc::new(Recorder {
            short: true,
            ..Recorder::default()
        });
        let loader = loader(recorder, 0);
        let results = loader.load_many(["a".to_string(), "b".to_string()]).await;
        for result in results {
            assert_eq!(result, Err(LoaderError::Misaligned { expected: 2, got: 1 }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_resolves_every_slot() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_secs(5)),
            ..Recorder::default()
        });
        let ctx = RequestContext::background();
        let loader = Loader::new("test", ctx.clone(), recorder, 0);
        let pending = loader.load_many(["a".to_string(), "b".to_string()]);

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        for result in pending.await {
            assert_eq!(result, Err(LoaderError::Cancelled));
        }
    }

    #[tokio::test]
    async fn test_loaders_do_not_share_state() {
        let recorder = Arc::new(Recorder::default());
        let first = loader(recorder.clone(), 0);
        first.load("a".to_string()).await.unwrap();
        let second = loader(recorder.clone(), 0);
        assert_eq!(second.cached(), 0);
        second.load("a".to_string()).await.unwrap();
        assert_eq!(recorder.batches().len(), 2);
    }
}
