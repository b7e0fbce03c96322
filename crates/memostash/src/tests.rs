use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::key::CacheKey;
use crate::serialize::Bincode;

use super::*;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(dir: &Path) -> Config {
    Config {
        cache_dir: dir.join("cache"),
        worker_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

const WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// The single committed entry file under `root`, skipping the tmp dir.
fn only_entry_file(root: &Path) -> PathBuf {
    fn walk(dir: &Path, found: &mut Vec<PathBuf>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                if path.file_name().is_some_and(|name| name == "tmp") {
                    continue;
                }
                walk(&path, found);
            } else {
                found.push(path);
            }
        }
    }
    let mut found = Vec::new();
    walk(root, &mut found);
    assert_eq!(found.len(), 1, "expected exactly one committed entry");
    found.pop().unwrap()
}

#[test]
fn straight_through_fallback_computes_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let square = Memoized::with_config(
        "tests::square",
        move |x: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            x * x
        },
        test_config(dir.path()),
        Bincode,
    )?;

    assert_eq!(square.call(7)?, Outcome::Ready(49));
    assert_eq!(square.call(7)?, Outcome::Ready(49));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(square.has_key(&7)?);
    Ok(())
}

#[test]
fn misses_return_pending_and_resolve_after_wait() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;

    let identity = Memoized::with_config(
        "tests::slow_identity",
        |x: u64| {
            thread::sleep(Duration::from_millis(50));
            x
        },
        test_config(dir.path()),
        Bincode,
    )?;

    let size = if thread::available_parallelism().map(|n| n.get()).unwrap_or(1) >= 2 {
        PoolSize::Fixed(2)
    } else {
        PoolSize::All
    };
    identity.start(size)?;

    let started = Instant::now();
    for x in 0..10u64 {
        assert_eq!(identity.call(x)?, Outcome::Pending);
    }
    // dispatching never blocks on the computation itself
    assert!(started.elapsed() < Duration::from_secs(1));

    let report = identity.wait(WAIT_INTERVAL)?;
    assert!(report.failed.is_empty());
    assert_eq!(report.done, 10);

    for x in 0..10u64 {
        assert_eq!(identity.call(x)?, Outcome::Ready(x));
    }
    assert!(identity.status().is_drained());
    identity.join();
    Ok(())
}

#[test]
fn duplicate_misses_cost_exactly_one_computation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let slow = Memoized::with_config(
        "tests::slow_dup",
        move |x: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            x
        },
        test_config(dir.path()),
        Bincode,
    )?;
    slow.start(PoolSize::Fixed(1))?;

    for _ in 0..5 {
        let outcome = slow.call(3)?;
        if outcome.is_pending() {
            continue;
        }
        // the worker may have committed between iterations
        assert_eq!(outcome, Outcome::Ready(3));
    }

    slow.wait(WAIT_INTERVAL)?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    slow.join();
    Ok(())
}

#[test]
fn concurrent_coordinators_share_one_computation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let slow = Memoized::with_config(
        "tests::slow_shared",
        move |x: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            x * 2
        },
        test_config(dir.path()),
        Bincode,
    )?;
    slow.start(PoolSize::Fixed(1))?;

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = slow.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator.call(21).unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    slow.wait(WAIT_INTERVAL)?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(slow.call(21)?, Outcome::Ready(42));
    slow.join();
    Ok(())
}

#[test]
fn has_key_and_no_cache_leave_the_store_untouched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let double = Memoized::with_config(
        "tests::double",
        |x: f64| x * 2.0,
        test_config(dir.path()),
        Bincode,
    )?;

    assert_eq!(double.call(1.0)?, Outcome::Ready(2.0));

    assert!(!double.has_key(&2.0)?);
    assert_eq!(double.call_with(2.0, CallMode::NoCache)?, Outcome::Ready(4.0));
    assert!(!double.has_key(&2.0)?);
    assert!(double.has_key(&1.0)?);
    Ok(())
}

#[test]
fn cache_only_never_enqueues() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let triple = Memoized::with_config(
        "tests::triple",
        |x: i32| x * 3,
        test_config(dir.path()),
        Bincode,
    )?;
    triple.start(PoolSize::Fixed(1))?;

    assert_eq!(triple.call_with(5, CallMode::CacheOnly)?, Outcome::Pending);
    assert_eq!(triple.status().pending, 0);

    triple.set_result(&5, &15, false)?;
    assert_eq!(triple.call_with(5, CallMode::CacheOnly)?, Outcome::Ready(15));
    triple.join();
    Ok(())
}

#[test]
fn set_result_refuses_silent_overwrite() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let noop = Memoized::with_config(
        "tests::noop",
        |x: u8| x,
        test_config(dir.path()),
        Bincode,
    )?;

    noop.set_result(&1, &10, false)?;
    assert!(matches!(
        noop.set_result(&1, &20, false),
        Err(Error::Config(_))
    ));
    noop.set_result(&1, &20, true)?;
    assert_eq!(noop.call(1)?, Outcome::Ready(20));
    Ok(())
}

#[test]
fn update_mode_recomputes_and_overwrites() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let answer = Memoized::with_config(
        "tests::answer",
        |_: ()| 42u32,
        test_config(dir.path()),
        Bincode,
    )?;

    // seed a stale value, as an upgraded computation might
    answer.set_result(&(), &7, false)?;
    assert_eq!(answer.call(())?, Outcome::Ready(7));

    assert_eq!(answer.call_with((), CallMode::Update)?, Outcome::Ready(42));
    assert_eq!(answer.call(())?, Outcome::Ready(42));
    Ok(())
}

#[test]
fn remove_is_the_only_way_out() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let id = Memoized::with_config(
        "tests::id",
        |x: u16| x,
        test_config(dir.path()),
        Bincode,
    )?;

    id.call(9)?;
    assert!(id.has_key(&9)?);
    assert!(id.remove(&9)?);
    assert!(!id.has_key(&9)?);
    assert!(!id.remove(&9)?);
    Ok(())
}

#[test]
fn corrupt_entries_surface_from_the_call_site() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let wordy = Memoized::with_config(
        "tests::wordy",
        |x: u32| vec![x; 16],
        config,
        Bincode,
    )?;

    wordy.call(3)?;
    let entry = only_entry_file(wordy.store().root());
    fs::write(entry, b"\x00garbage")?;

    assert!(matches!(wordy.call(3), Err(Error::Corrupt(_))));
    assert!(matches!(
        wordy.call_with(3, CallMode::CacheOnly),
        Err(Error::Corrupt(_))
    ));
    Ok(())
}

#[test]
fn failed_computations_are_captured_per_key() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let fussy = Memoized::with_config(
        "tests::fussy",
        |x: u64| {
            if x == 13 {
                panic!("unlucky number");
            }
            x + 1
        },
        test_config(dir.path()),
        Bincode,
    )?;
    fussy.start(PoolSize::Fixed(1))?;

    assert_eq!(fussy.call(13)?, Outcome::Pending);
    assert_eq!(fussy.call(7)?, Outcome::Pending);

    let report = fussy.wait(WAIT_INTERVAL)?;
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("unlucky number"));

    // the worker survived the panic and resolved the other key
    assert_eq!(fussy.call(7)?, Outcome::Ready(8));
    assert!(!fussy.has_key(&13)?);
    assert_eq!(fussy.status().failed, 1);
    fussy.join();
    Ok(())
}

#[test]
fn double_start_is_a_lifecycle_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let id = Memoized::with_config(
        "tests::id_lifecycle",
        |x: u8| x,
        test_config(dir.path()),
        Bincode,
    )?;

    id.start(PoolSize::Fixed(1))?;
    assert!(matches!(id.start(PoolSize::Fixed(1)), Err(Error::State(_))));

    id.join();
    // joining twice is fine, and the pool can start again afterwards
    id.join();
    id.start(PoolSize::Fixed(1))?;
    id.join();
    Ok(())
}

#[test]
fn join_leaves_queued_items_for_the_next_start() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let slow = Memoized::with_config(
        "tests::slow_leftover",
        |x: u64| {
            thread::sleep(Duration::from_millis(80));
            x
        },
        test_config(dir.path()),
        Bincode,
    )?;

    slow.start(PoolSize::Fixed(1))?;
    for x in 0..3u64 {
        slow.call(x)?;
    }
    slow.join();

    // with one worker and an 80ms computation, joining right away leaves
    // unfetched items behind
    if !slow.status().is_drained() {
        assert!(matches!(slow.wait(WAIT_INTERVAL), Err(Error::State(_))));
    }

    slow.start(PoolSize::Fixed(1))?;
    slow.wait(WAIT_INTERVAL)?;
    for x in 0..3u64 {
        assert!(slow.has_key(&x)?);
    }
    slow.join();
    Ok(())
}

#[test]
fn readers_racing_a_writer_never_observe_partial_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("entries")).unwrap();
    let key = CacheKey::for_testing("contended");
    let payload = vec![7u8; 4096];

    let writer = {
        let store = store.clone();
        let key = key.clone();
        let payload = payload.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                store.put(&key, &payload, &Bincode).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            let payload = payload.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    match store.get::<Vec<u8>, _>(&key, &Bincode) {
                        Ok(value) => assert_eq!(value, payload),
                        Err(Error::NotFound) => {}
                        Err(e) => panic!("reader observed an invalid entry: {e}"),
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn concurrent_puts_of_one_key_leave_a_valid_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("entries")).unwrap();
    let key = CacheKey::for_testing("last-writer-wins");

    let writers: Vec<_> = [1u64, 2u64]
        .into_iter()
        .map(|value| {
            let store = store.clone();
            let key = key.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    store.put(&key, &vec![value; 512], &Bincode).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let value: Vec<u64> = store.get(&key, &Bincode).unwrap();
    assert_eq!(value.len(), 512);
    assert!(value.iter().all(|&v| v == value[0]));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Catalog {
    entries: Vec<String>,
    total: u64,
}

#[test]
fn instance_cache_skips_constructor_side_effects_on_hit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = InstanceCache::new(dir.path().join("instances"));
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let catalog = cache.register::<Catalog, u64, _>(move |n| {
        counter.fetch_add(1, Ordering::SeqCst);
        Catalog {
            entries: (0..n).map(|i| format!("entry-{i}")).collect(),
            total: n,
        }
    })?;

    let fresh = catalog.build(3)?;
    assert!(!fresh.is_restored());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let restored = catalog.build(3)?;
    assert!(restored.is_restored());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(fresh.into_inner(), restored.into_inner());

    // different arguments are a different instance
    catalog.build(5)?;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(catalog.has_key(&3)?);
    assert!(catalog.remove(&3)?);
    assert!(!catalog.has_key(&3)?);
    Ok(())
}

#[test]
fn double_registration_fails_before_construction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = InstanceCache::new(dir.path().join("instances"));

    let _first = cache.register::<Catalog, u64, _>(|n| Catalog {
        entries: Vec::new(),
        total: n,
    })?;

    let second = cache.register::<Catalog, u64, _>(|n| Catalog {
        entries: Vec::new(),
        total: n + 1,
    });
    assert!(matches!(second, Err(Error::AlreadyRegistered(_))));
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TinyCatalog(Catalog);

#[test]
fn wrapper_types_register_independently() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = InstanceCache::new(dir.path().join("instances"));

    let _catalog = cache.register::<Catalog, u64, _>(|n| Catalog {
        entries: Vec::new(),
        total: n,
    })?;

    // specialization goes through a dedicated wrapper type
    let tiny = cache.register::<TinyCatalog, u64, _>(|n| {
        TinyCatalog(Catalog {
            entries: Vec::new(),
            total: n.min(8),
        })
    })?;
    assert!(!tiny.build(32)?.is_restored());
    assert_eq!(tiny.build(32)?.into_inner().0.total, 8);
    Ok(())
}
