use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::dispatch::{Dispatcher, WorkItem};

/// A running set of background worker threads.
///
/// Workers block on the queue with a timeout so a stop request is noticed
/// within one poll interval even when the queue is empty. There is no
/// forced termination: an in-flight computation always runs to completion
/// or failure.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `count` workers feeding every received item to `work`.
    pub fn spawn<A, F>(
        count: usize,
        poll: Duration,
        dispatcher: &Dispatcher<A>,
        work: Arc<F>,
    ) -> io::Result<WorkerPool>
    where
        A: Send + 'static,
        F: Fn(WorkItem<A>) + Send + Sync + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let rx = dispatcher.receiver();
            let stop = Arc::clone(&stop);
            let work = Arc::clone(&work);
            let handle = std::thread::Builder::new()
                .name(format!("memostash-worker-{i}"))
                .spawn(move || worker_loop(rx, stop, poll, work))?;
            handles.push(handle);
        }
        Ok(WorkerPool { handles, stop })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Stops the workers after their current item and waits for them to
    /// exit. Unfetched queued items remain for a future pool start.
    pub fn join(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            if handle.join().is_err() {
                // computations are unwind-guarded, so this is a bug in the
                // pool itself rather than in a wrapped function
                tracing::error!("worker thread panicked outside of a computation");
            }
        }
    }
}

fn worker_loop<A, F>(
    rx: Receiver<WorkItem<A>>,
    stop: Arc<AtomicBool>,
    poll: Duration,
    work: Arc<F>,
) where
    F: Fn(WorkItem<A>),
{
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match rx.recv_timeout(poll) {
            Ok(item) => work(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
