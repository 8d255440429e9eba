use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Shared flag checked by a drive before each step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Entry {
    token: CancelToken,
    drives: usize,
}

/// Tokens of the drives currently running, keyed by task.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    active: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a drive for `task_id`. The entry lives as long as the guard.
    pub fn begin(&self, task_id: Uuid) -> DriveGuard {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = active.entry(task_id).or_insert_with(|| Entry {
            token: CancelToken::default(),
            drives: 0,
        });
        entry.drives += 1;

        DriveGuard {
            task_id,
            token: entry.token.clone(),
            registry: self.clone(),
            ended: false,
        }
    }

    /// Flag the running drive of `task_id`. Returns false if none is running.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(&task_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, task_id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&task_id)
    }

    fn end(&self, task_id: Uuid) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = active.get_mut(&task_id) {
            entry.drives -= 1;
            if entry.drives == 0 {
                active.remove(&task_id);
            }
        }
    }
}

pub struct DriveGuard {
    task_id: Uuid,
    token: CancelToken,
    registry: CancellationRegistry,
    ended: bool,
}

impl DriveGuard {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Deregister the drive and report whether it was cancelled.
    ///
    /// A cancel that lands after this call no longer sees the drive and
    /// finalizes the run itself; one that landed before is reported here.
    pub fn finish(mut self) -> bool {
        self.registry.end(self.task_id);
        self.ended = true;
        self.token.is_cancelled()
    }
}

impl Drop for DriveGuard {
    fn drop(&mut self) {
        if !self.ended {
            self.registry.end(self.task_id);
        }
    }
}
