//! Sequential task loop.
//!
//! Every cycle runs the registered tasks in order, one at a time, then sleeps.
//! A failing task is reported under its name and never stops the tasks after
//! it or the loop itself.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::{OracleError, Result};

pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A task borrows the shared state mutably for the duration of one run.
pub type TaskFn<S> = for<'a> fn(&'a mut S) -> TaskFuture<'a>;

/// Outcome of one task in one cycle.
#[derive(Debug)]
pub struct TaskReport {
    pub name: &'static str,
    pub outcome: Result<()>,
}

pub struct Scheduler<S> {
    tasks: Vec<(&'static str, TaskFn<S>)>,
    delay: Duration,
    on_error: Box<dyn Fn(&str, &OracleError) + Send + Sync>,
}

impl<S: Send> Scheduler<S> {
    pub fn new(delay: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            delay,
            on_error: Box::new(|name, err| error!("Found error in {name}: {err}")),
        }
    }

    pub fn add(mut self, name: &'static str, task: TaskFn<S>) -> Self {
        self.tasks.push((name, task));
        self
    }

    /// Replace the default error reporter (a `tracing` error line).
    pub fn on_error(mut self, reporter: impl Fn(&str, &OracleError) + Send + Sync + 'static) -> Self {
        self.on_error = Box::new(reporter);
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Run every task once, in registration order.
    pub async fn run_cycle(&self, state: &mut S) -> Vec<TaskReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for (name, task) in &self.tasks {
            let outcome = task(state).await;
            if let Err(e) = &outcome {
                (self.on_error)(name, e);
            }
            reports.push(TaskReport { name, outcome });
        }
        reports
    }

    /// Loop until `cancel` fires. The task in flight is always allowed to finish.
    pub async fn run(self, mut state: S, cancel: CancellationToken) {
        info!("Scheduler started with tasks: {:?}", self.task_names());
        while !cancel.is_cancelled() {
            self.run_cycle(&mut state).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Trace {
        steps: Vec<&'static str>,
    }

    fn first(state: &mut Trace) -> TaskFuture<'_> {
        Box::pin(async move {
            state.steps.push("first");
            Ok(())
        })
    }

    fn failing(state: &mut Trace) -> TaskFuture<'_> {
        Box::pin(async move {
            state.steps.push("failing");
            Err(OracleError::Integrity("boom".to_string()))
        })
    }

    fn last(state: &mut Trace) -> TaskFuture<'_> {
        Box::pin(async move {
            state.steps.push("last");
            Ok(())
        })
    }

    #[tokio::test]
    async fn failure_is_isolated_and_reported_by_name() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let scheduler = Scheduler::new(Duration::from_millis(1))
            .add("first", first)
            .add("failing", failing)
            .add("last", last)
            .on_error(move |name, _| sink.lock().unwrap().push(name.to_string()));

        let mut trace = Trace::default();
        let reports = scheduler.run_cycle(&mut trace).await;

        assert_eq!(trace.steps, vec!["first", "failing", "last"]);
        assert_eq!(reports.len(), 3);
        assert!(reports[0].outcome.is_ok());
        assert_eq!(reports[1].name, "failing");
        assert!(reports[1].outcome.is_err());
        assert!(reports[2].outcome.is_ok());
        assert_eq!(*reported.lock().unwrap(), vec!["failing".to_string()]);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(Duration::from_millis(5)).add("first", first);
        let handle = tokio::spawn(scheduler.run(Trace::default(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
