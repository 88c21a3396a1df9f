//! Ids of the tasks this worker is currently executing.
//!
//! An engine can hand the same task out again (lock expired while the handler
//! was still busy); the second copy must not run concurrently with the first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::TaskId;

#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<TaskId>>>,
}

/// Holds a task id in the index; removes it on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<TaskId>>>,
    task_id: TaskId,
}

fn locked(ids: &Mutex<HashSet<TaskId>>) -> MutexGuard<'_, HashSet<TaskId>> {
    // the set stays consistent even if a holder panicked
    ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when `task_id` is already executing.
    pub fn try_acquire(&self, task_id: &TaskId) -> Option<InFlightGuard> {
        if !locked(&self.ids).insert(task_id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            ids: Arc::clone(&self.ids),
            task_id: task_id.clone(),
        })
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        locked(&self.ids).contains(task_id)
    }

    pub fn len(&self) -> usize {
        locked(&self.ids).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InFlightGuard {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        locked(&self.ids).remove(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let inflight = InFlight::new();
        let id = TaskId::new("t-1");

        let guard = inflight.try_acquire(&id).unwrap();
        assert!(inflight.try_acquire(&id).is_none());
        assert!(inflight.contains(&id));

        drop(guard);
        assert!(inflight.is_empty());
        assert!(inflight.try_acquire(&id).is_some());
    }
}
