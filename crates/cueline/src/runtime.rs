//! Timer primitives used by the conductor and the drivers.
//!
//! Both primitives return a [`TaskHandle`]; dropping or aborting the handle
//! cancels the timer independently of any other timer. They run on the tokio
//! runtime, so tests can pause and advance tokio time instead of sleeping.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Handle to a spawned timer task. The task is aborted when the handle is dropped.
#[derive(Debug)]
pub struct TaskHandle {
    inner: Option<tokio::task::JoinHandle<()>>,
}

impl TaskHandle {
    fn new(inner: tokio::task::JoinHandle<()>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Cancel the task. Calling this more than once is harmless.
    pub fn abort(&mut self) {
        if let Some(handle) = self.inner.take() {
            handle.abort();
        }
    }

    /// True once the task has completed or been aborted.
    pub fn is_finished(&self) -> bool {
        self.inner.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Let the task run to completion even after the handle is dropped.
    pub fn detach(mut self) {
        self.inner.take();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Spawn `task` on the tokio runtime, cancelled when the handle is dropped.
pub fn spawn<Fut>(task: Fut) -> TaskHandle
where
    Fut: Future<Output = ()> + Send + 'static,
{
    TaskHandle::new(tokio::spawn(task))
}

/// Run `f` every `period`, starting immediately.
///
/// A slow run delays the next one instead of causing a burst of catch-up runs.
pub fn every<F, Fut>(period: Duration, mut f: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    TaskHandle::new(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            f().await;
        }
    }))
}

/// Run `task` once at `deadline`.
pub fn once_at<Fut>(deadline: Instant, task: Fut) -> TaskHandle
where
    Fut: Future<Output = ()> + Send + 'static,
{
    TaskHandle::new(tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        trace!("One-shot timer fired");
        task.await;
    }))
}

/// Run `task` once after `delay`.
pub fn once_after<Fut>(delay: Duration, task: Fut) -> TaskHandle
where
    Fut: Future<Output = ()> + Send + 'static,
{
    once_at(Instant::now() + delay, task)
}
