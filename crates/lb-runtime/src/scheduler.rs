use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use lb_core::{BridgeError, HostValue};

use crate::runner::{closed_error, eval_chunk, eval_file, ExecCallback, SharedInstance};

#[derive(Debug)]
pub(crate) enum TaskPayload {
    Chunk(String),
    File(PathBuf),
}

impl TaskPayload {
    fn kind(&self) -> &'static str {
        match self {
            Self::Chunk(_) => "chunk",
            Self::File(_) => "file",
        }
    }
}

/// One queued unit of async work. The callback box is consumed exactly once:
/// invoked during dispatch, or dropped with the record when the task is
/// disposed without a callback or without ever being pumped.
pub(crate) struct AsyncTask {
    pub(crate) payload: TaskPayload,
    pub(crate) callback: Option<ExecCallback>,
}

struct CompletedTask {
    outcome: Result<HostValue, BridgeError>,
    callback: Option<ExecCallback>,
}

/// Bounded pool of worker threads plus the completion channel back to the
/// host control thread. Workers serialize against sync operations and each
/// other through the shared instance lock; the scheduler itself promises no
/// cross-task ordering.
pub(crate) struct TaskScheduler {
    task_tx: Option<Sender<AsyncTask>>,
    done_rx: Receiver<CompletedTask>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskScheduler {
    pub(crate) fn new(
        instance: SharedInstance,
        worker_threads: usize,
    ) -> Result<Self, BridgeError> {
        let (task_tx, task_rx) = unbounded::<AsyncTask>();
        let (done_tx, done_rx) = unbounded::<CompletedTask>();

        let mut workers = Vec::new();
        for index in 0..worker_threads.max(1) {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            let instance = Arc::clone(&instance);
            let handle = thread::Builder::new()
                .name(format!("lb-worker-{index}"))
                .spawn(move || worker_loop(&instance, &task_rx, &done_tx))
                .map_err(|error| {
                    BridgeError::new(
                        "SCHEDULER_SPAWN_FAILED",
                        format!("Worker thread spawn failed: {}", error),
                    )
                })?;
            workers.push(handle);
        }

        Ok(Self {
            task_tx: Some(task_tx),
            done_rx,
            workers,
        })
    }

    pub(crate) fn submit(&self, task: AsyncTask) -> Result<(), BridgeError> {
        tracing::debug!(kind = task.payload.kind(), "async task queued");
        let Some(task_tx) = self.task_tx.as_ref() else {
            return Err(stopped_error());
        };
        task_tx.send(task).map_err(|_| stopped_error())
    }

    /// Dispatches every completion already waiting, on the calling thread.
    pub(crate) fn poll(&self) -> usize {
        let mut dispatched = 0usize;
        for task in self.done_rx.try_iter() {
            dispatch(task);
            dispatched += 1;
        }
        dispatched
    }

    /// Blocks up to `timeout` for the first completion, then drains the rest.
    pub(crate) fn pump(&self, timeout: Duration) -> usize {
        match self.done_rx.recv_timeout(timeout) {
            Ok(task) => {
                dispatch(task);
                1 + self.poll()
            }
            Err(_) => self.poll(),
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.task_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn stopped_error() -> BridgeError {
    BridgeError::new("SCHEDULER_STOPPED", "Task scheduler is no longer running.")
}

fn dispatch(task: CompletedTask) {
    if let Err(error) = &task.outcome {
        tracing::debug!(%error, "async task completed with error");
    }
    if let Some(callback) = task.callback {
        callback(task.outcome);
    }
}

fn worker_loop(
    instance: &SharedInstance,
    task_rx: &Receiver<AsyncTask>,
    done_tx: &Sender<CompletedTask>,
) {
    for task in task_rx.iter() {
        let outcome = run_task(instance, &task.payload);
        let completed = CompletedTask {
            outcome,
            callback: task.callback,
        };
        // The owner dropping the receiver disposes the callback with it.
        if done_tx.send(completed).is_err() {
            break;
        }
    }
    tracing::debug!("worker thread exiting");
}

/// Runs the payload under the instance lock, exactly as the sync path does,
/// and converts the result to a host value before the lock is released. A
/// closed instance fails the task with the uniform closed error.
fn run_task(instance: &SharedInstance, payload: &TaskPayload) -> Result<HostValue, BridgeError> {
    let guard = instance.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(lua) = guard.as_ref() else {
        return Err(closed_error());
    };
    match payload {
        TaskPayload::Chunk(code) => eval_chunk(lua, code),
        TaskPayload::File(path) => eval_file(lua, path),
    }
}
