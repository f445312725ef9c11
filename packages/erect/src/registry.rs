//! Module name registry.
//!
//! A C++20 build discovers module dependencies as it goes: task A cannot
//! know that it needs `import B;`'s compiled interface until GCC tells the
//! module mapper so over the wire (see [`crate::mapper`]). The
//! [`ModuleRegistry`] is the rendezvous point between the task that
//! eventually provides a module and every task that is, or will be, waiting
//! on it.

use std::{collections::HashMap, sync::Mutex};

use tokio::sync::watch;

/// Tracks, for each module name, whether it has been provided yet and wakes
/// any task awaiting it.
///
/// Entries are created lazily on first reference (by either a requirer or a
/// provider), so requiring and providing can race in either order.
pub struct ModuleRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    tx: watch::Sender<bool>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, name: &str) -> watch::Receiver<bool> {
        let mut entries = self.entries.lock().expect("module registry mutex poisoned");
        entries
            .entry(name.to_owned())
            .or_insert_with(|| {
                let (tx, _rx) = watch::channel(false);
                Entry { tx }
            })
            .tx
            .subscribe()
    }

    /// Whether `name` has already been provided.
    pub fn module_exists(&self, name: &str) -> bool {
        self.entries
            .lock()
            .expect("module registry mutex poisoned")
            .get(name)
            .is_some_and(|entry| *entry.tx.borrow())
    }

    /// Block until `name` has been provided.
    ///
    /// Idempotent and safe to call from any number of tasks concurrently,
    /// including after the module has already been provided (in which case
    /// this returns immediately).
    pub async fn module_required(&self, name: &str) {
        let mut rx = self.entry(name);
        if *rx.borrow() {
            return;
        }
        // Wait for the value to flip; a sender is always held by the
        // registry itself via `entries`, so this channel never closes out
        // from under us.
        let _ = rx.wait_for(|provided| *provided).await;
    }

    /// Record that `name` is now available, waking every task awaiting it.
    ///
    /// Calling this more than once for the same name is a no-op: the
    /// watch channel is already at `true`, so `send` is simply redundant.
    pub fn module_provided(&self, name: &str) {
        let rx = self.entry(name);
        // `entry` always leaves an `Entry` behind; recover the sender by
        // reusing the same lock rather than holding it across the `entry`
        // call above.
        let entries = self.entries.lock().expect("module registry mutex poisoned");
        if let Some(entry) = entries.get(name) {
            let _ = entry.tx.send(true);
        }
        drop(rx);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn provide_before_require_does_not_block() {
        let registry = ModuleRegistry::new();
        registry.module_provided("a");
        assert!(registry.module_exists("a"));

        tokio::time::timeout(Duration::from_millis(100), registry.module_required("a"))
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn require_before_provide_wakes_on_provide() {
        let registry = Arc::new(ModuleRegistry::new());
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry.module_required("b").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.module_provided("b");
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter should finish shortly after provide")
            .unwrap();
    }

    #[tokio::test]
    async fn multiple_waiters_all_wake() {
        let registry = Arc::new(ModuleRegistry::new());
        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.module_required("c").await })
            })
            .collect();

        registry.module_provided("c");
        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(100), waiter)
                .await
                .expect("waiter should finish")
                .unwrap();
        }
    }
}
