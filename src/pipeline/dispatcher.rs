use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, oneshot, Semaphore};
use tracing::{debug, error};

use super::worker::{ExtractionWorker, WorkerOutcome};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Article was already terminal or vanished; nothing to do.
    Skipped,
    /// Worker ran and recorded a failure on the article.
    Failed(String),
    /// Worker panicked; the dispatcher recorded the failure instead.
    Crashed(String),
    /// The task could not be started at all.
    NotLaunched(String),
}

impl TaskOutcome {
    fn failure_message(&self) -> Option<&str> {
        match self {
            TaskOutcome::Completed | TaskOutcome::Skipped => None,
            TaskOutcome::Failed(msg) | TaskOutcome::Crashed(msg) | TaskOutcome::NotLaunched(msg) => {
                Some(msg)
            }
        }
    }
}

/// Published for every finished dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub article_id: i64,
    pub outcome: TaskOutcome,
}

type SuccessFn = Box<dyn FnOnce(i64) + Send + 'static>;
type FailureFn = Box<dyn FnOnce(i64, String) + Send + 'static>;

/// Optional best-effort notifications for one dispatch. The article row,
/// not these callbacks, is the record of what happened.
#[derive(Default)]
pub struct Callbacks {
    on_success: Option<SuccessFn>,
    on_failure: Option<FailureFn>,
}

impl Callbacks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce(i64) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(i64, String) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    fn fire(self, article_id: i64, outcome: &TaskOutcome) {
        let result = catch_unwind(AssertUnwindSafe(|| match outcome {
            TaskOutcome::Completed => {
                if let Some(f) = self.on_success {
                    f(article_id);
                }
            }
            TaskOutcome::Skipped => {}
            other => {
                if let (Some(f), Some(msg)) = (self.on_failure, other.failure_message()) {
                    f(article_id, msg.to_string());
                }
            }
        }));
        if let Err(panic) = result {
            error!(article_id, "Dispatch callback panicked: {}", panic_message(panic.as_ref()));
        }
    }
}

pub struct TaskHandle {
    article_id: i64,
    done: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn article_id(&self) -> i64 {
        self.article_id
    }

    /// Wait for the dispatch to finish. Dropping the handle instead leaves
    /// the task running.
    pub async fn wait(self) -> TaskOutcome {
        self.done
            .await
            .unwrap_or_else(|_| TaskOutcome::Crashed("dispatch task ended without reporting".into()))
    }
}

/// Launches one extraction worker per call without blocking the caller.
///
/// Each dispatch runs in its own task behind a concurrency cap. Duplicate
/// dispatches for the same article are not merged; the store's guarded
/// writes keep that safe. Callers that want to avoid them check
/// `is_in_flight` first.
#[derive(Clone)]
pub struct Dispatcher {
    worker: ExtractionWorker,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<TaskEvent>,
    /// Unfinished dispatches per article, queued or running.
    in_flight: Arc<Mutex<HashMap<i64, usize>>>,
}

impl Dispatcher {
    pub fn new(worker: ExtractionWorker, concurrency: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            worker,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            events,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// True while a dispatch for `article_id` is waiting for a permit or running.
    pub fn is_in_flight(&self, article_id: i64) -> bool {
        self.in_flight_ids().contains_key(&article_id)
    }

    fn in_flight_ids(&self) -> MutexGuard<'_, HashMap<i64, usize>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop launching workers; queued dispatches finish as `NotLaunched`.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn spawn(&self, article_id: i64, callbacks: Callbacks) -> TaskHandle {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = TaskHandle {
            article_id,
            done: done_rx,
        };
        *self.in_flight_ids().entry(article_id).or_insert(0) += 1;

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(article_id, "Cannot launch extraction worker: {}", e);
                self.finish(
                    article_id,
                    TaskOutcome::NotLaunched(format!("no async runtime: {e}")),
                    callbacks,
                    done_tx,
                );
                return handle;
            }
        };

        let dispatcher = self.clone();
        runtime.spawn(async move {
            let outcome = dispatcher.supervise(article_id).await;
            dispatcher.finish(article_id, outcome, callbacks, done_tx);
        });
        handle
    }

    async fn supervise(&self, article_id: i64) -> TaskOutcome {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return TaskOutcome::NotLaunched("dispatcher is closed".into()),
        };

        let worker = self.worker.clone();
        let run = tokio::spawn(async move { worker.process(article_id).await });
        match run.await {
            Ok(Ok(WorkerOutcome::Completed)) => TaskOutcome::Completed,
            Ok(Ok(WorkerOutcome::Skipped)) => TaskOutcome::Skipped,
            Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    panic_message(join_error.into_panic().as_ref())
                } else {
                    "worker task was cancelled".to_string()
                };
                error!(article_id, "Extraction worker crashed: {}", reason);
                let message = format!("Worker crashed: {reason}");
                if let Err(e) = self.worker.repository().mark_failed(article_id, &message).await {
                    error!(article_id, error = %e, "Failed to record worker crash");
                }
                TaskOutcome::Crashed(message)
            }
        }
    }

    fn finish(
        &self,
        article_id: i64,
        outcome: TaskOutcome,
        callbacks: Callbacks,
        done: oneshot::Sender<TaskOutcome>,
    ) {
        debug!(article_id, ?outcome, "Dispatch finished");
        {
            let mut in_flight = self.in_flight_ids();
            if let Some(count) = in_flight.get_mut(&article_id) {
                *count -= 1;
                if *count == 0 {
                    in_flight.remove(&article_id);
                }
            }
        }
        callbacks.fire(article_id, &outcome);
        // no subscribers is fine
        let _ = self.events.send(TaskEvent {
            article_id,
            outcome: outcome.clone(),
        });
        let _ = done.send(outcome);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
