//! Pluggable observers for scheduler events.

use std::sync::Mutex;

use futures::future::BoxFuture;
use jiff::Timestamp;
use tracing::{info, warn};

use crate::{
    scheduler::SkipReason,
    task::{TaskError, TaskId},
};

/// What the scheduler reports as a run unfolds.
///
/// For any executed task, `Ready` precedes `Started` precedes `Ended`;
/// `Init` precedes all task events of its run.
#[derive(Clone, Debug)]
pub enum Event {
    /// A run is about to start over this graph.
    Init {
        tasks: Vec<TaskId>,
        deps: Vec<(TaskId, TaskId)>,
    },

    /// All dependencies succeeded; the task is waiting for resources.
    Ready(TaskId),

    /// Resources granted; the task is performing.
    Started(TaskId),

    /// The task finished performing.
    Ended {
        task: TaskId,
        outcome: Result<(), TaskError>,
    },

    /// The task was not performed.
    Skipped { task: TaskId, reason: SkipReason },
}

/// An observer of scheduler events.
///
/// `event` is invoked from within the scheduler and must not block;
/// implementations that do real work queue internally and process the
/// queue on their own time.
pub trait Logger: Send + Sync + 'static {
    /// Observe one event. Must not block.
    fn event(&self, time: Timestamp, event: Event);

    /// Ask the logger to finish up; no further events will arrive.
    fn stop(&self) {}

    /// Wait until queued events have been fully processed.
    fn wait_for_shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Discards every event.
pub struct NullLogger;

impl Logger for NullLogger {
    fn event(&self, _: Timestamp, _: Event) {}
}

/// Forwards events to `tracing`, one `info` line per event.
///
/// Events are queued through an unbounded channel and drained by a
/// spawned task, so `event` never blocks the scheduler.
pub struct TracingLogger {
    tx: flume::Sender<Message>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

enum Message {
    Event(Timestamp, Event),
    Stop,
}

impl TracingLogger {
    /// Spawn the draining task on the current runtime.
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded::<Message>();
        let worker = tokio::spawn(async move {
            while let Ok(message) = rx.recv_async().await {
                match message {
                    Message::Stop => break,
                    Message::Event(time, event) => report(time, &event),
                }
            }
        });
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger for TracingLogger {
    fn event(&self, time: Timestamp, event: Event) {
        // Unbounded send never blocks; a closed channel means the worker
        // is already gone and the event can only be dropped.
        let _ = self.tx.send(Message::Event(time, event));
    }

    fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }

    fn wait_for_shutdown(&self) -> BoxFuture<'_, ()> {
        let worker = self.worker.lock().expect("logger worker lock").take();
        Box::pin(async move {
            if let Some(worker) = worker {
                if let Err(err) = worker.await {
                    warn!(error = ?err, "logger worker did not shut down cleanly");
                }
            }
        })
    }
}

fn report(time: Timestamp, event: &Event) {
    match event {
        Event::Init { tasks, deps } => {
            info!(%time, tasks = tasks.len(), deps = deps.len(), "run started");
        }
        Event::Ready(task) => info!(%time, %task, "task ready"),
        Event::Started(task) => info!(%time, %task, "task started"),
        Event::Ended { task, outcome } => match outcome {
            Ok(()) => info!(%time, %task, "task succeeded"),
            Err(err) => info!(%time, %task, error = %err, "task failed"),
        },
        Event::Skipped { task, reason } => info!(%time, %task, %reason, "task skipped"),
    }
}
