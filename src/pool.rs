//! Bounded worker pool with error fan-in.
//!
//! The pipeline runs two embarrassingly parallel phases — layer extraction
//! and repack-with-hash — through the same discipline: a fixed number of
//! worker threads, submission that blocks while every worker is busy, and
//! an error channel that is polled after each submission so failures become
//! visible early. [`WorkerPool::join`] is the phase fence: it closes the
//! task channel, joins every worker, drains the error channel, and reports
//! the first failure. In-flight tasks always run to completion; their
//! results are the caller's to discard on error.

use std::num::NonZeroUsize;
use std::thread;

use crossbeam::channel::{Receiver, Sender, TryRecvError, bounded, unbounded};

use crate::error::{MeltError, Result};

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A fixed-capacity pool of worker threads consuming fallible tasks.
pub struct WorkerPool {
    tasks: Option<Sender<Task>>,
    errors: Receiver<MeltError>,
    workers: Vec<thread::JoinHandle<()>>,
    first_error: Option<MeltError>,
}

impl WorkerPool {
    /// Spawn a pool with `capacity` workers (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        // A rendezvous channel: submission blocks until a worker takes the
        // task, holding concurrency to exactly `capacity`.
        let (task_tx, task_rx) = bounded::<Task>(0);
        let (err_tx, err_rx) = unbounded::<MeltError>();

        let workers = (0..capacity)
            .map(|_| {
                let task_rx = task_rx.clone();
                let err_tx = err_tx.clone();
                thread::spawn(move || {
                    for task in task_rx.iter() {
                        if let Err(err) = task() {
                            // The receiver outlives the workers; a failed
                            // send only means join already gave up.
                            let _ = err_tx.send(err);
                        }
                    }
                })
            })
            .collect();

        Self {
            tasks: Some(task_tx),
            errors: err_rx,
            workers,
            first_error: None,
        }
    }

    /// Spawn a pool sized to the host's available CPU count.
    pub fn with_host_capacity() -> Self {
        let capacity = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self::new(capacity)
    }

    /// Submit a task, blocking while all workers are busy.
    ///
    /// Worker errors observed so far are polled non-blockingly afterwards,
    /// so a failing phase surfaces early instead of at the fence.
    pub fn submit<F>(&mut self, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let send_failed = match &self.tasks {
            Some(tasks) => tasks.send(Box::new(task)).is_err(),
            None => true,
        };
        if send_failed {
            self.note_error(MeltError::Worker(
                "all workers exited before the phase completed".to_string(),
            ));
        }
        self.poll_errors();
    }

    /// Wait for every submitted task to finish and surface the first
    /// failure, if any.
    pub fn join(mut self) -> Result<()> {
        // Closing the channel lets the workers drain and exit.
        self.tasks.take();
        let workers: Vec<_> = self.workers.drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                self.note_error(MeltError::Worker("worker thread panicked".to_string()));
            }
        }
        self.poll_errors();
        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn poll_errors(&mut self) {
        loop {
            match self.errors.try_recv() {
                Ok(err) => self.note_error(err),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn note_error(&mut self, err: MeltError) {
        if self.first_error.is_some() {
            tracing::warn!("additional worker error: {err}");
        } else {
            self.first_error = Some(err);
        }
    }
}
