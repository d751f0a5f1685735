use std::future::Future;

use tokio::task::JoinHandle;

/// Owned handle to a spawned periodic task; dropping it aborts the task.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F>(name: &'static str, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "background task started");
        Self {
            name,
            handle: Some(tokio::spawn(task)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!(task = self.name, "background task stopped");
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}
