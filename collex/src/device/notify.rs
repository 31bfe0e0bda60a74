use crate::error::{CollexError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// A one-shot-per-post signal between streams.
///
/// Each post releases exactly one wait. A stream that has already failed
/// still posts, but marks the notify as poisoned so the waiting stream
/// fails with the cause instead of timing out.
#[derive(Clone)]
pub struct Notify {
    id: u32,
    sem: Arc<Semaphore>,
    poison: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for Notify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notify")
            .field("id", &self.id)
            .field("pending", &self.sem.available_permits())
            .finish()
    }
}

impl Notify {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            sem: Arc::new(Semaphore::new(0)),
            poison: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Posts not yet consumed by a wait.
    pub fn pending(&self) -> usize {
        self.sem.available_permits()
    }

    pub(crate) fn post(&self) {
        self.sem.add_permits(1);
    }

    pub(crate) fn post_poisoned(&self, cause: String) {
        if let Ok(mut slot) = self.poison.lock() {
            slot.get_or_insert(cause);
        }
        self.sem.add_permits(1);
    }

    pub(crate) async fn wait(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.sem.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => {
                return Err(CollexError::device(format!("notify {} closed", self.id)));
            }
            Err(_) => {
                return Err(CollexError::device(format!(
                    "notify {} wait timed out after {}ms",
                    self.id,
                    timeout.as_millis()
                )));
            }
        }
        let cause = self
            .poison
            .lock()
            .map_err(|_| CollexError::LockPoisoned("notify"))?
            .take();
        match cause {
            Some(cause) => Err(CollexError::device(format!(
                "notify {}: posting stream failed: {cause}",
                self.id
            ))),
            None => Ok(()),
        }
    }
}
