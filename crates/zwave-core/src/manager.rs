//! Process-wide registry of running drivers, keyed by controller port.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::bus::WatcherHandle;
use crate::config::DriverConfig;
use crate::driver::{Driver, ShutdownReport};
use crate::error::DriverError;
use crate::handle::DriverHandle;
use crate::notification::Watcher;
use crate::transport::ControllerTransport;

/// Id of a watcher registered on every driver of a [`Manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerWatcherId(u64);

struct ManagedDriver {
    handle: DriverHandle,
    thread: JoinHandle<ShutdownReport>,
    watchers: BTreeMap<ManagerWatcherId, WatcherHandle>,
}

/// Owns the driver threads of every controller in the process.
///
/// Watchers added here see notifications from all current and future
/// drivers.
#[derive(Default)]
pub struct Manager {
    drivers: BTreeMap<String, ManagedDriver>,
    watchers: BTreeMap<ManagerWatcherId, Arc<dyn Watcher>>,
    next_watcher: u64,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the controller named by `config` and start its driver.
    pub fn open_driver(&mut self, config: DriverConfig) -> Result<DriverHandle, DriverError> {
        if self.drivers.contains_key(&config.port) {
            return Err(DriverError::DuplicateDriver(config.port));
        }
        self.add_driver(Driver::open(config)?)
    }

    /// Start a driver on its own thread.
    pub fn add_driver<T>(&mut self, driver: Driver<T>) -> Result<DriverHandle, DriverError>
    where
        T: ControllerTransport + 'static,
    {
        let port = driver.config().port.clone();
        if self.drivers.contains_key(&port) {
            return Err(DriverError::DuplicateDriver(port));
        }

        let watchers = self
            .watchers
            .iter()
            .map(|(id, watcher)| (*id, driver.add_watcher(Arc::clone(watcher))))
            .collect();
        let (handle, thread) = driver.spawn()?;
        info!(port = %port, "Driver added");
        self.drivers.insert(
            port,
            ManagedDriver {
                handle: handle.clone(),
                thread,
                watchers,
            },
        );
        Ok(handle)
    }

    /// Stop a driver and wait for its thread.
    pub fn remove_driver(&mut self, port: &str) -> Option<ShutdownReport> {
        let managed = self.drivers.remove(port)?;
        info!(port, "Removing driver");
        Some(stop(managed))
    }

    pub fn driver(&self, port: &str) -> Option<&DriverHandle> {
        self.drivers.get(port).map(|managed| &managed.handle)
    }

    /// Driver whose controller reported `home_id`.
    pub fn by_home_id(&self, home_id: u32) -> Option<&DriverHandle> {
        self.drivers
            .values()
            .map(|managed| &managed.handle)
            .find(|handle| handle.status().is_ok_and(|status| status.home_id == home_id))
    }

    pub fn ports(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn add_watcher(&mut self, watcher: Arc<dyn Watcher>) -> ManagerWatcherId {
        let id = ManagerWatcherId(self.next_watcher);
        self.next_watcher += 1;
        for managed in self.drivers.values_mut() {
            let handle = managed.handle.add_watcher(Arc::clone(&watcher));
            managed.watchers.insert(id, handle);
        }
        self.watchers.insert(id, watcher);
        id
    }

    pub fn remove_watcher(&mut self, id: ManagerWatcherId) -> bool {
        for managed in self.drivers.values_mut() {
            if let Some(handle) = managed.watchers.remove(&id) {
                managed.handle.remove_watcher(handle);
            }
        }
        self.watchers.remove(&id).is_some()
    }

    /// Stop every driver, returning their reports by port.
    pub fn shutdown_all(&mut self) -> BTreeMap<String, ShutdownReport> {
        std::mem::take(&mut self.drivers)
            .into_iter()
            .map(|(port, managed)| (port, stop(managed)))
            .collect()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

fn stop(managed: ManagedDriver) -> ShutdownReport {
    managed.handle.shutdown();
    match managed.thread.join() {
        Ok(report) => report,
        Err(_) => {
            warn!(port = %managed.handle.port(), "Driver thread panicked");
            ShutdownReport::default()
        }
    }
}
