//! Deduplication of in-flight asynchronous tasks.
//!
//! Concurrent callers asking for the same task name share one future. The
//! entry is removed as soon as the task settles, so later callers start a
//! fresh task instead of reusing a stale result.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A task result shared by every caller that joined it.
pub type SharedTask<T> = Shared<BoxFuture<'static, T>>;

/// Registry of pending tasks by name.
pub struct TaskDeduplicator<T> {
    tasks: Arc<Mutex<HashMap<String, SharedTask<T>>>>,
}

impl<T> TaskDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a task with this name is in flight.
    pub fn has_pending(&self, name: &str) -> bool {
        self.tasks.lock().contains_key(name)
    }

    /// The in-flight task with this name, if any.
    pub fn pending(&self, name: &str) -> Option<SharedTask<T>> {
        self.tasks.lock().get(name).cloned()
    }

    /// Join the task called `name`, or register the one built by `start`.
    ///
    /// `start` only runs when no task is pending. The registered task removes
    /// itself from the registry once it has produced its result.
    pub fn join_or_capture<F, Fut>(&self, name: &str, start: F) -> SharedTask<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(name) {
            return task.clone();
        }

        let registry = Arc::clone(&self.tasks);
        let task_name = name.to_string();
        let operation = start();
        let task = async move {
            let result = operation.await;
            registry.lock().remove(&task_name);
            result
        }
        .boxed()
        .shared();

        tasks.insert(name.to_string(), task.clone());
        task
    }

    /// Number of tasks in flight.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for TaskDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
