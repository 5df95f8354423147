//! Ordered, isolated notification fan-out.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, trace};

use crate::notification::{Notification, Watcher};

/// Handle returned by [`NotificationBus::add_watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherHandle(u64);

type WatcherList = Vec<(WatcherHandle, Arc<dyn Watcher>)>;

/// Delivers notifications to every registered watcher in emission order.
///
/// Clones share the watcher list, so a [`DriverHandle`](crate::DriverHandle)
/// can register watchers while the driver thread publishes.
#[derive(Clone, Default)]
pub struct NotificationBus {
    watchers: Arc<Mutex<WatcherList>>,
    next_handle: Arc<AtomicU64>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watcher. It sees only notifications published from now on.
    pub fn add_watcher(&self, watcher: Arc<dyn Watcher>) -> WatcherHandle {
        let handle = WatcherHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.watchers().push((handle, watcher));
        handle
    }

    /// Returns false if the handle was not registered.
    pub fn remove_watcher(&self, handle: WatcherHandle) -> bool {
        let mut watchers = self.watchers();
        let before = watchers.len();
        watchers.retain(|(h, _)| *h != handle);
        watchers.len() != before
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers().len()
    }

    /// Deliver to every watcher, in registration order.
    ///
    /// The list is snapshotted first so watchers may add or remove watchers
    /// from inside the callback. A panicking watcher is logged and skipped.
    pub fn publish(&self, notification: &Notification) {
        let snapshot: Vec<_> = self
            .watchers()
            .iter()
            .map(|(handle, watcher)| (*handle, Arc::clone(watcher)))
            .collect();

        trace!(notification = %notification, watchers = snapshot.len(), "Publish");
        for (handle, watcher) in snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| watcher.on_notification(notification)));
            if delivered.is_err() {
                error!(watcher = handle.0, notification = %notification, "Watcher panicked");
            }
        }
    }

    fn watchers(&self) -> MutexGuard<'_, WatcherList> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
