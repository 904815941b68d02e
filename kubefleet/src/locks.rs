//! Cooperative class and object locks.
//!
//! Object locks are reentrant for the same holder id. Callers that need both
//! take the class lock first, then the object lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

struct Held {
    holder: String,
    depth: usize,
}

#[derive(Default)]
struct Inner {
    held: Mutex<HashMap<String, Held>>,
    released: Notify,
}

impl Inner {
    fn try_acquire(&self, key: &str, holder: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.get_mut(key) {
            Some(h) if h.holder == holder => {
                h.depth += 1;
                true
            }
            Some(_) => false,
            None => {
                held.insert(
                    key.to_string(),
                    Held {
                        holder: holder.to_string(),
                        depth: 1,
                    },
                );
                true
            }
        }
    }

    fn release(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let remove = match held.get_mut(key) {
            Some(h) => {
                h.depth -= 1;
                h.depth == 0
            }
            None => false,
        };
        if remove {
            held.remove(key);
            drop(held);
            self.released.notify_waiters();
        }
    }
}

#[derive(Clone, Default)]
pub struct LockManager {
    inner: Arc<Inner>,
}

/// Releases its lock when dropped.
#[must_use]
pub struct LockGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(&self, key: String, holder: &str) -> LockGuard {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.inner.try_acquire(&key, holder) {
                return LockGuard {
                    inner: self.inner.clone(),
                    key,
                };
            }
            released.await;
        }
    }

    /// Serializes creation of rows of `kind` within `scope`.
    pub async fn lock_class(&self, kind: &str, scope: &str, holder: &str) -> LockGuard {
        self.acquire(format!("class/{}/{}", kind, scope), holder)
            .await
    }

    pub async fn lock_object(&self, kind: &str, id: &str, holder: &str) -> LockGuard {
        self.acquire(format!("object/{}/{}", kind, id), holder)
            .await
    }

    pub fn try_lock_object(&self, kind: &str, id: &str, holder: &str) -> Option<LockGuard> {
        let key = format!("object/{}/{}", kind, id);
        if self.inner.try_acquire(&key, holder) {
            Some(LockGuard {
                inner: self.inner.clone(),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_object_locked(&self, kind: &str, id: &str) -> bool {
        let held = self.inner.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains_key(&format!("object/{}/{}", kind, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn reentrant_for_same_holder() {
        let locks = LockManager::new();
        let a = locks.lock_object("clusters", "c1", "task-1").await;
        let b = timeout(
            Duration::from_millis(100),
            locks.lock_object("clusters", "c1", "task-1"),
        )
        .await
        .expect("reentrant lock must not block");
        assert!(locks.try_lock_object("clusters", "c1", "task-2").is_none());
        drop(a);
        assert!(locks.is_object_locked("clusters", "c1"));
        drop(b);
        assert!(!locks.is_object_locked("clusters", "c1"));
        assert!(locks.try_lock_object("clusters", "c1", "task-2").is_some());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let locks = LockManager::new();
        let guard = locks.lock_object("machines", "m1", "a").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock_object("machines", "m1", "b").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn class_and_object_keys_are_distinct() {
        let locks = LockManager::new();
        let _class = locks.lock_class("cluster_resources", "c1", "a").await;
        assert!(locks.try_lock_object("cluster_resources", "c1", "b").is_some());
    }
}
