mod dispatcher;
mod scheduler;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{Callbacks, Dispatcher, TaskEvent, TaskHandle, TaskOutcome};
pub use scheduler::{RetryPolicy, RetryScheduler, SweepReport};
pub use worker::{ExtractionWorker, WorkerOutcome};
