//! # memostash
//!
//! Persistent, content-addressed memoization for expensive, referentially
//! transparent functions, combined with background parallel computation
//! via a worker pool. This module documentation gives an overview of how
//! the pieces fit together; the individual types carry the details.
//!
//! ## How a call flows
//!
//! A [`Memoized`] controller wraps one function. Every call derives a
//! [`CacheKey`] — the SHA-256 digest of the registered function identity
//! plus the canonicalized arguments — and goes through the following
//! steps:
//!
//! - If the sharded on-disk [`Store`] holds a committed entry for the key,
//!   the call returns [`Outcome::Ready`] with the deserialized value.
//! - On a miss with a running worker pool, the call enqueues a work item
//!   (deduplicated: any number of duplicate misses before resolution cost
//!   exactly one computation) and returns [`Outcome::Pending`]
//!   immediately. Calls never block by default.
//! - On a miss without a pool, the call computes synchronously, commits
//!   the result and returns it.
//!
//! Per-call overrides are expressed as a [`CallMode`]
//! (`NoCache`/`CacheOnly`/`Update`) plus the dedicated
//! [`has_key`](Memoized::has_key) query.
//!
//! ## The store
//!
//! Entries live in a sharded directory tree, one tree per wrapped
//! function. Writes always go to a temp file first and are atomically
//! renamed into place, so concurrent readers — including readers in other
//! processes — observe either nothing or a fully valid entry. The
//! filesystem is the single source of truth: there is no in-memory index,
//! and once a `put` completes, any subsequent `exists`/`get` for that key
//! from any process observes the committed value. Entries are never
//! evicted; they persist until explicitly removed.
//!
//! ## The worker pool
//!
//! [`start`](Memoized::start) spawns background worker threads sized by a
//! [`PoolSize`] specification. Workers pull items off a shared queue,
//! blocking with a timeout so shutdown stays responsive, and commit
//! results through the same atomic store path. A panic inside the wrapped
//! function is captured per key — the worker keeps running and the key is
//! reported failed rather than silently dropped. [`join`](Memoized::join)
//! stops the workers after their current item; unfetched queued items
//! remain for a future pool start. [`wait`](Memoized::wait) blocks until
//! the queue has drained and returns a [`DrainReport`] carrying the
//! failed keys; [`status`](Memoized::status) gives a snapshot at any
//! time. There is no cancellation: a dispatched computation always runs
//! to completion or failure.
//!
//! ## Errors
//!
//! The central [`Error`] type distinguishes configuration and lifecycle
//! misuse (which surface synchronously) from per-key conditions: a miss is
//! an internal signal that becomes [`Outcome::Pending`], a corrupt
//! committed entry is surfaced rather than silently recomputed, and a
//! failed computation is reported through `status`/`wait` without
//! affecting other keys.
//!
//! ## Instance caching
//!
//! [`InstanceCache`] applies the same pipeline to object construction: a
//! registered constructor persists the built state, and later builds with
//! the same arguments restore that state without re-running the
//! constructor. Each concrete type registers exactly once; double
//! registration fails fast, before any instance is built.

mod config;
mod dispatch;
mod error;
mod instance;
mod key;
mod memo;
mod pool;
mod serialize;
mod store;

#[cfg(test)]
mod tests;

pub use config::{Config, PoolSize};
pub use dispatch::{DrainReport, Status};
pub use error::{Error, Result};
pub use instance::{Built, CachedCtor, InstanceCache};
pub use key::{CacheKey, KeyBuilder};
pub use memo::{CallMode, Memoized, Outcome};
pub use serialize::{Bincode, Json, Serializer};
pub use store::Store;
