//! Shared deadline heap for assured waits.
//!
//! One thread serves every in-flight update: deadlines go into a min-heap
//! and the thread sleeps on its command channel until the earliest one.
//! Resolved records are not removed from the heap; their expiry is simply
//! ignored by the pending table.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{RecvTimeoutError, Sender};

use crate::core::Csn;

enum TimerCommand {
    Schedule { at: Instant, csn: Csn, epoch: u64 },
    Shutdown,
}

pub struct DeadlineTimer {
    tx: Sender<TimerCommand>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlineTimer {
    pub fn spawn<F>(on_expire: F) -> Self
    where
        F: Fn(Csn, u64) + Send + 'static,
    {
        let (tx, rx) = crossbeam::channel::unbounded::<TimerCommand>();
        let join = thread::spawn(move || {
            let mut heap: BinaryHeap<Reverse<(Instant, Csn, u64)>> = BinaryHeap::new();
            loop {
                let next = match heap.peek() {
                    Some(Reverse((at, _, _))) => rx.recv_deadline(*at),
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match next {
                    Ok(TimerCommand::Schedule { at, csn, epoch }) => {
                        heap.push(Reverse((at, csn, epoch)));
                    }
                    Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let now = Instant::now();
                        while let Some(Reverse((at, csn, epoch))) = heap.peek().copied()
                            && at <= now
                        {
                            heap.pop();
                            on_expire(csn, epoch);
                        }
                    }
                }
            }
            tracing::debug!(dropped = heap.len(), "deadline timer stopped");
        });

        Self {
            tx,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn schedule(&self, at: Instant, csn: Csn, epoch: u64) {
        if self
            .tx
            .send(TimerCommand::Schedule { at, csn, epoch })
            .is_err()
        {
            tracing::debug!(csn = %csn, "deadline timer already stopped");
        }
    }

    /// Stop the timer thread; pending deadlines are dropped.
    pub fn shutdown(&self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
        let join = self.join.lock().expect("timer join lock poisoned").take();
        if let Some(join) = join
            && join.thread().id() != thread::current().id()
        {
            let _ = join.join();
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
