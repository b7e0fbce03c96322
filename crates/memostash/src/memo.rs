use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{Config, PoolSize};
use crate::dispatch::{Dispatcher, DrainReport, Status, WorkItem};
use crate::error::{Error, Result};
use crate::key::{CacheKey, KeyBuilder, safe_path_segment};
use crate::pool::WorkerPool;
use crate::serialize::{Bincode, Serializer};
use crate::store::Store;

/// What a call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<R> {
    /// The value for this call, served from the store or computed inline.
    Ready(R),
    /// The result is not yet available. With a running pool the
    /// computation has been dispatched; a later call for the same
    /// arguments observes the committed value.
    Pending,
}

impl<R> Outcome<R> {
    /// Returns the value if it is available.
    pub fn ready(self) -> Option<R> {
        match self {
            Outcome::Ready(value) => Some(value),
            Outcome::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }
}

/// Per-call override of the default caching behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallMode {
    /// Serve from the store; dispatch a background computation on a miss.
    #[default]
    Default,
    /// Compute inline and bypass the store entirely.
    NoCache,
    /// Serve from the store only; a miss reports
    /// [`Outcome::Pending`] without enqueueing anything.
    CacheOnly,
    /// Compute inline and overwrite whatever the store holds.
    Update,
}

/// Memoizes a function with a persistent store and a background worker
/// pool.
///
/// `Memoized` is the stateful controller tying the pieces together: it
/// derives a [`CacheKey`] from the call arguments, consults the sharded
/// [`Store`], and on a miss either dispatches the computation to the
/// worker pool (returning [`Outcome::Pending`] immediately) or, when no
/// pool is running, computes and commits synchronously.
///
/// Cloning is cheap and shares all state, so a controller can be handed to
/// any number of call sites and threads.
///
/// ```no_run
/// use memostash::{Memoized, Outcome, PoolSize};
///
/// # fn main() -> memostash::Result<()> {
/// let slow_square = Memoized::new("demo::slow_square", |x: u64| x * x)?;
///
/// slow_square.start(PoolSize::All)?;
/// for x in 0..10 {
///     // returns immediately; misses are computed in the background
///     let _ = slow_square.call(x)?;
/// }
/// slow_square.wait(std::time::Duration::from_secs(2))?;
///
/// assert_eq!(slow_square.call(3)?, Outcome::Ready(9));
/// slow_square.join();
/// # Ok(())
/// # }
/// ```
pub struct Memoized<A, R, F, S = Bincode> {
    inner: Arc<Inner<A, R, F, S>>,
}

impl<A, R, F, S> Clone for Memoized<A, R, F, S> {
    fn clone(&self) -> Self {
        Memoized {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A, R, F, S> {
    name: String,
    func: F,
    store: Store,
    serializer: S,
    dispatcher: Dispatcher<A>,
    pool: Mutex<Option<WorkerPool>>,
    config: Config,
    _result: PhantomData<fn(A) -> R>,
}

impl<A, R, F> Memoized<A, R, F, Bincode>
where
    A: Serialize + Send + 'static,
    R: Serialize + DeserializeOwned + 'static,
    F: Fn(A) -> R + Send + Sync + 'static,
{
    /// Wraps `func` with the default configuration and serializer.
    ///
    /// `name` is the stable identity of the function, fixed at
    /// registration; use the fully qualified name
    /// (`concat!(module_path!(), "::square")`) so distinct functions can
    /// never share a cache tree.
    pub fn new(name: impl Into<String>, func: F) -> Result<Self> {
        Self::with_config(name, func, Config::default(), Bincode)
    }
}

impl<A, R, F, S> Memoized<A, R, F, S>
where
    A: Serialize + Send + 'static,
    R: Serialize + DeserializeOwned + 'static,
    F: Fn(A) -> R + Send + Sync + 'static,
    S: Serializer,
{
    /// Wraps `func` with an explicit configuration and serializer.
    pub fn with_config(
        name: impl Into<String>,
        func: F,
        config: Config,
        serializer: S,
    ) -> Result<Self> {
        let name = name.into();
        let dir_name = if config.include_module_path {
            safe_path_segment(&name)
        } else {
            name.rsplit("::").next().unwrap_or(&name).to_string()
        };
        let store = Store::new(config.cache_dir.join(dir_name))?;

        Ok(Memoized {
            inner: Arc::new(Inner {
                name,
                func,
                store,
                serializer,
                dispatcher: Dispatcher::new(),
                pool: Mutex::new(None),
                config,
                _result: PhantomData,
            }),
        })
    }

    /// The registered identity of the wrapped function.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The store backing this function's cache tree.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Calls the wrapped function in [`CallMode::Default`].
    pub fn call(&self, args: A) -> Result<Outcome<R>> {
        self.call_with(args, CallMode::Default)
    }

    /// Calls the wrapped function with an explicit [`CallMode`].
    ///
    /// For the key `K` derived from `args`:
    ///
    /// 1. [`NoCache`](CallMode::NoCache): compute inline, bypass the store.
    /// 2. [`Update`](CallMode::Update): compute inline, overwrite the
    ///    entry for `K`.
    /// 3. If an entry for `K` exists, return it.
    /// 4. [`CacheOnly`](CallMode::CacheOnly): report
    ///    [`Outcome::Pending`] without enqueueing.
    /// 5. If a pool is running: enqueue (idempotent while the key is
    ///    unresolved) and report [`Outcome::Pending`] without blocking.
    /// 6. Otherwise compute synchronously, commit, and return the value.
    ///
    /// Repeating step 5 any number of times before the key resolves
    /// performs exactly one computation.
    pub fn call_with(&self, args: A, mode: CallMode) -> Result<Outcome<R>> {
        if mode == CallMode::NoCache {
            return Ok(Outcome::Ready((self.inner.func)(args)));
        }

        let key = self.key_for(&args)?;

        if mode == CallMode::Update {
            let value = (self.inner.func)(args);
            self.inner.store.put(&key, &value, &self.inner.serializer)?;
            return Ok(Outcome::Ready(value));
        }

        match self.inner.store.get(&key, &self.inner.serializer) {
            Ok(value) => return Ok(Outcome::Ready(value)),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        if mode == CallMode::CacheOnly {
            return Ok(Outcome::Pending);
        }

        if self.pool_running() {
            self.inner.dispatcher.enqueue(key, args);
            return Ok(Outcome::Pending);
        }

        // straight-through fallback: no pool, compute right here
        let value = (self.inner.func)(args);
        self.inner.store.put(&key, &value, &self.inner.serializer)?;
        Ok(Outcome::Ready(value))
    }

    /// Whether a committed entry exists for `args`. Neither enqueues nor
    /// computes.
    pub fn has_key(&self, args: &A) -> Result<bool> {
        Ok(self.inner.store.exists(&self.key_for(args)?))
    }

    /// Seeds the cache with an externally computed `value` for `args`.
    ///
    /// Refuses to replace an existing entry unless `overwrite` is set.
    pub fn set_result(&self, args: &A, value: &R, overwrite: bool) -> Result<()> {
        let key = self.key_for(args)?;
        if !overwrite && self.inner.store.exists(&key) {
            return Err(Error::Config(
                "a result for these arguments is already cached; set `overwrite` to replace it"
                    .into(),
            ));
        }
        self.inner.store.put(&key, value, &self.inner.serializer)
    }

    /// Removes the committed entry for `args`, returning whether one
    /// existed.
    pub fn remove(&self, args: &A) -> Result<bool> {
        self.inner.store.remove(&self.key_for(args)?)
    }

    /// Starts the background worker pool.
    ///
    /// `size` is resolved against the available execution units; invalid
    /// sizings fail with [`Error::Config`]. Fails with [`Error::State`] if
    /// the pool is already running. Returns the number of workers spawned.
    pub fn start(&self, size: PoolSize) -> Result<usize> {
        let available = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let count = size.resolve(available)?;

        let mut pool = self.inner.pool.lock().unwrap();
        if pool.is_some() {
            return Err(Error::State("worker pool is already running".into()));
        }

        let inner = Arc::clone(&self.inner);
        let work = Arc::new(move |item: WorkItem<A>| inner.process(item));
        let spawned = WorkerPool::spawn(
            count,
            self.inner.config.worker_poll,
            &self.inner.dispatcher,
            work,
        )?;
        tracing::debug!(
            name = %self.inner.name,
            workers = spawned.len(),
            "started worker pool"
        );
        *pool = Some(spawned);
        Ok(count)
    }

    /// Whether a worker pool is currently running.
    pub fn pool_running(&self) -> bool {
        self.inner.pool.lock().unwrap().is_some()
    }

    /// Stops the workers after their current item and waits for them to
    /// exit. Unfetched queued items remain for a future [`start`](Self::start).
    /// No-op when no pool is running.
    pub fn join(&self) {
        let pool = self.inner.pool.lock().unwrap().take();
        if let Some(pool) = pool {
            pool.join();
            tracing::debug!(name = %self.inner.name, "worker pool stopped");
        }
    }

    /// A snapshot of the dispatch bookkeeping.
    pub fn status(&self) -> Status {
        self.inner.dispatcher.status()
    }

    /// Blocks until every enqueued key has been committed or reported
    /// failed, emitting a status line at `status_interval`.
    ///
    /// Failed keys are surfaced through the returned [`DrainReport`] and
    /// the log rather than as an `Err`. Fails with [`Error::State`] when
    /// work is pending but no pool is running, since the queue could never
    /// drain.
    pub fn wait(&self, status_interval: Duration) -> Result<DrainReport> {
        const TICK: Duration = Duration::from_millis(25);

        let mut last_report = Instant::now();
        loop {
            let status = self.status();
            if status.is_drained() {
                break;
            }
            if !self.pool_running() {
                return Err(Error::State(
                    "cannot wait for queued work without a running pool".into(),
                ));
            }
            if last_report.elapsed() >= status_interval {
                tracing::info!(name = %self.inner.name, %status, "waiting for queued work");
                last_report = Instant::now();
            }
            thread::sleep(TICK.min(status_interval));
        }

        let report = self.inner.dispatcher.drain_report();
        if !report.failed.is_empty() {
            tracing::warn!(
                name = %self.inner.name,
                failed = report.failed.len(),
                "queue drained with failed keys"
            );
        }
        Ok(report)
    }

    fn key_for(&self, args: &A) -> Result<CacheKey> {
        let mut builder = KeyBuilder::new(&self.inner.name);
        builder.write_arg("args", args, &self.inner.serializer)?;
        Ok(builder.build())
    }
}

impl<A, R, F, S> Inner<A, R, F, S>
where
    A: Serialize + Send + 'static,
    R: Serialize + DeserializeOwned + 'static,
    F: Fn(A) -> R + Send + Sync + 'static,
    S: Serializer,
{
    /// Runs one work item on a worker thread.
    ///
    /// A panic in the wrapped function is captured per key; the worker
    /// keeps running and the key is reported failed rather than silently
    /// dropped.
    fn process(&self, item: WorkItem<A>) {
        self.dispatcher.started();

        // Another worker, a straight-through call or a previous pool run
        // may have resolved this key while the item sat in the queue.
        if self.store.exists(&item.key) {
            self.dispatcher.committed(&item.key);
            return;
        }

        let WorkItem { key, args } = item;
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.func)(args)))
            .map_err(|payload| Error::Compute(panic_message(payload.as_ref())))
            .and_then(|value| self.store.put(&key, &value, &self.serializer));

        match result {
            Ok(()) => {
                tracing::trace!(name = %self.name, key = %key, "worker committed entry");
                self.dispatcher.committed(&key);
            }
            Err(e) => {
                tracing::warn!(
                    name = %self.name,
                    key = %key,
                    metadata = key.metadata(),
                    error = %e,
                    "worker failed to resolve key"
                );
                self.dispatcher.failed(&key, e.to_string());
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
