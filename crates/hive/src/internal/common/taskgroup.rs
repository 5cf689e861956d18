use std::future::Future;
use tokio::task::LocalSet;

/// Group of fire-and-forget local tasks that stop being polled when the group is dropped.
#[derive(Default)]
pub struct TaskGroup {
    set: LocalSet,
}

impl TaskGroup {
    /// Drives `future` together with all tasks of the group until `future` finishes.
    pub async fn run_until<F: Future<Output = R>, R>(&self, future: F) -> R {
        self.set.run_until(future).await
    }

    pub fn add_task<F: Future + 'static>(&self, future: F) {
        self.set.spawn_local(future);
    }
}
