//! Callback delivery off the loop thread.
//!
//! Every request is pinned to one worker (`request_id % num_workers`), so its
//! outputs arrive in order while different requests are delivered
//! concurrently. Each worker drains its own bounded channel; a full channel
//! blocks the loop thread until the worker catches up.
//!
//! ```text
//!   loop thread ──dispatch()──► [sync_channel 0] ──► callback-0
//!                          └──► [sync_channel 1] ──► callback-1
//!                          └──► ...
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::core::request::{CancellationFlag, RequestId};
use crate::engine::output::{OutputCallback, RequestOutput};
use crate::error::Result;

/// Delivery endpoint of one request.
pub(crate) struct OutputSink {
    callback: Mutex<OutputCallback>,
    cancellation: CancellationFlag,
    /// Set once the callback asked to stop.
    poisoned: AtomicBool,
}

impl OutputSink {
    pub(crate) fn new(callback: OutputCallback, cancellation: CancellationFlag) -> Self {
        Self {
            callback: Mutex::new(callback),
            cancellation,
            poisoned: AtomicBool::new(false),
        }
    }

    pub(crate) fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Run the callback on `output`.
    ///
    /// After the callback returned `false` only the terminal output is
    /// delivered, rewritten to a cancellation.
    pub(crate) fn deliver(&self, output: RequestOutput) {
        let terminal = output.finished;
        let output = match (terminal, self.is_poisoned()) {
            (false, true) => return,
            (true, true) => output.into_cancelled(),
            _ => output,
        };

        let request_id = output.request_id;
        let mut callback = self.callback.lock();
        let keep_going = panic::catch_unwind(AssertUnwindSafe(|| (*callback)(output)))
            .unwrap_or_else(|_| {
                error!(request_id, "output callback panicked");
                false
            });

        if !keep_going && !terminal {
            self.poisoned.store(true, Ordering::Release);
            self.cancellation.cancel();
        }
    }
}

/// Counts requests whose terminal output has not been delivered yet.
#[derive(Default)]
pub(crate) struct Completion {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl Completion {
    pub(crate) fn add(&self) {
        *self.pending.lock() += 1;
    }

    pub(crate) fn done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Block until nothing is pending.
    pub(crate) fn wait_idle(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }

    /// Wait up to `timeout` for nothing to be pending; returns whether it is.
    pub(crate) fn wait_idle_for(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if *pending > 0 {
            self.idle.wait_for(&mut pending, timeout);
        }
        *pending == 0
    }
}

struct Job {
    sink: Arc<OutputSink>,
    output: RequestOutput,
}

/// Fixed pool of named callback workers.
pub(crate) struct CallbackPool {
    senders: Vec<SyncSender<Job>>,
    handles: Vec<JoinHandle<()>>,
    completion: Arc<Completion>,
}

impl CallbackPool {
    pub(crate) fn new(
        num_threads: usize,
        queue_capacity: usize,
        completion: Arc<Completion>,
    ) -> Result<Self> {
        let mut senders = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);

        for worker in 0..num_threads {
            let (tx, rx) = mpsc::sync_channel(queue_capacity);
            let completion = Arc::clone(&completion);
            let handle = thread::Builder::new()
                .name(format!("nano-serve-callback-{worker}"))
                .spawn(move || Self::worker_loop(rx, completion))?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            senders,
            handles,
            completion,
        })
    }

    fn worker_loop(jobs: Receiver<Job>, completion: Arc<Completion>) {
        for Job { sink, output } in jobs {
            let terminal = output.finished;
            sink.deliver(output);
            if terminal {
                completion.done();
            }
        }
    }

    /// Queue `output` on the worker owning `request_id`.
    pub(crate) fn dispatch(&self, request_id: RequestId, sink: Arc<OutputSink>, output: RequestOutput) {
        let worker = (request_id % self.senders.len() as u64) as usize;
        let terminal = output.finished;
        if self.senders[worker].send(Job { sink, output }).is_err() {
            warn!(request_id, worker, "callback worker is gone; output dropped");
            if terminal {
                self.completion.done();
            }
        }
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::output::{Status, StatusCode};

    fn output(request_id: RequestId, finished: bool) -> RequestOutput {
        RequestOutput {
            request_id,
            outputs: Vec::new(),
            status: finished.then(Status::ok),
            usage: None,
            finished,
        }
    }

    #[test]
    fn test_false_callback_poisons_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let flag = CancellationFlag::new();
        let sink = OutputSink::new(
            Box::new(move |out: RequestOutput| {
                seen_cb.lock().push(out.status.map(|s| s.code));
                false
            }),
            flag.clone(),
        );

        sink.deliver(output(1, false));
        assert!(flag.is_cancelled());
        assert!(sink.is_poisoned());

        // Later partial outputs are dropped, the terminal one turns into a cancellation
        sink.deliver(output(1, false));
        sink.deliver(output(1, true));
        assert_eq!(*seen.lock(), vec![None, Some(StatusCode::Cancelled)]);
    }

    #[test]
    fn test_pool_preserves_per_request_order() {
        let completion = Arc::new(Completion::default());
        let pool = CallbackPool::new(2, 4, Arc::clone(&completion)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_cb = Arc::clone(&seen);
        let sink = Arc::new(OutputSink::new(
            Box::new(move |out: RequestOutput| {
                seen_cb.lock().push(out.finished);
                true
            }),
            CancellationFlag::new(),
        ));

        completion.add();
        for _ in 0..10 {
            pool.dispatch(7, Arc::clone(&sink), output(7, false));
        }
        pool.dispatch(7, Arc::clone(&sink), output(7, true));

        completion.wait_idle();
        let seen = seen.lock();
        assert_eq!(seen.len(), 11);
        assert_eq!(seen.iter().filter(|finished| **finished).count(), 1);
        assert!(seen[10]);
    }
}
