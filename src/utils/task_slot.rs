use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Holds at most one background task. Starting a new task aborts the previous one.
#[derive(Default)]
pub struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    /// Store `handle`, aborting whatever task was held before.
    pub fn replace(&self, handle: JoinHandle<()>) {
        let previous = self.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Abort the held task, if any. Calling this on a finished or empty slot is a no-op.
    pub fn cancel(&self) {
        if let Some(handle) = self.lock().take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        // A poisoned slot only ever holds a JoinHandle, which is still usable.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
