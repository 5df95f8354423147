//! Thread-hosted driver and the cloneable handle callers use to reach it.
//!
//! [`Driver::spawn`] moves a driver onto its own thread. Every call on a
//! [`DriverHandle`] becomes a [`Request`] on an mpsc channel; the driver
//! thread serves requests in arrival order between polls, so submissions
//! from one caller keep their order on the wire.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::bus::{NotificationBus, WatcherHandle};
use crate::dispatcher::TransactionId;
use crate::driver::{Driver, DriverState, ShutdownReport};
use crate::error::DriverError;
use crate::node::Node;
use crate::notification::Watcher;
use crate::transport::{ControllerTransport, TransportError};
use crate::value::{Value, ValueId, ValuePayload};

/// How long an idle driver thread waits for a request before polling again.
const IDLE_WAIT: Duration = Duration::from_millis(5);

type Reply<R> = Sender<Result<R, DriverError>>;

/// Driver summary for callers outside the driver thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub state: DriverState,
    pub home_id: u32,
    pub controller_node_id: u8,
    pub nodes: usize,
    pub all_queried: bool,
}

/// A call waiting for the driver thread.
enum Request {
    SubmitCommand {
        node_id: u8,
        command_class: u8,
        payload: Vec<u8>,
        reply: Reply<TransactionId>,
    },
    GetValue {
        id: ValueId,
        reply: Reply<Value>,
    },
    SetValue {
        id: ValueId,
        payload: ValuePayload,
        reply: Reply<TransactionId>,
    },
    RefreshValue {
        id: ValueId,
        reply: Reply<TransactionId>,
    },
    EnablePoll {
        id: ValueId,
        reply: Reply<()>,
    },
    DisablePoll {
        id: ValueId,
        reply: Reply<bool>,
    },
    RequestConfigParam {
        node_id: u8,
        param: u8,
        reply: Reply<TransactionId>,
    },
    SetConfigParam {
        node_id: u8,
        param: u8,
        value: i32,
        size: u8,
        reply: Reply<TransactionId>,
    },
    TestNode {
        node_id: u8,
        reply: Reply<TransactionId>,
    },
    RemoveNode {
        node_id: u8,
        reply: Reply<()>,
    },
    NodeIds(Reply<Vec<u8>>),
    NodeInfo(u8, Reply<Option<Node>>),
    NodeValues(u8, Reply<Vec<Value>>),
    Status(Reply<DriverStatus>),
    Shutdown,
}

/// Cloneable, thread-safe access to a running driver.
#[derive(Clone)]
pub struct DriverHandle {
    port: String,
    requests: Sender<Request>,
    bus: NotificationBus,
}

impl DriverHandle {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn add_watcher(&self, watcher: Arc<dyn Watcher>) -> WatcherHandle {
        self.bus.add_watcher(watcher)
    }

    pub fn remove_watcher(&self, handle: WatcherHandle) -> bool {
        self.bus.remove_watcher(handle)
    }

    fn call<R>(&self, make: impl FnOnce(Reply<R>) -> Request) -> Result<R, DriverError> {
        let (reply, response) = mpsc::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| DriverError::ShuttingDown)?;
        // A dropped reply sender means the driver thread is gone.
        response.recv().map_err(|_| DriverError::ShuttingDown)?
    }

    pub fn submit_command(
        &self,
        node_id: u8,
        command_class: u8,
        payload: &[u8],
    ) -> Result<TransactionId, DriverError> {
        self.call(|reply| Request::SubmitCommand {
            node_id,
            command_class,
            payload: payload.to_vec(),
            reply,
        })
    }

    pub fn get_value(&self, id: ValueId) -> Result<Value, DriverError> {
        self.call(|reply| Request::GetValue { id, reply })
    }

    pub fn set_value(&self, id: ValueId, payload: ValuePayload) -> Result<TransactionId, DriverError> {
        self.call(|reply| Request::SetValue { id, payload, reply })
    }

    pub fn refresh_value(&self, id: ValueId) -> Result<TransactionId, DriverError> {
        self.call(|reply| Request::RefreshValue { id, reply })
    }

    pub fn enable_poll(&self, id: ValueId) -> Result<(), DriverError> {
        self.call(|reply| Request::EnablePoll { id, reply })
    }

    pub fn disable_poll(&self, id: ValueId) -> Result<bool, DriverError> {
        self.call(|reply| Request::DisablePoll { id, reply })
    }

    pub fn request_config_param(&self, node_id: u8, param: u8) -> Result<TransactionId, DriverError> {
        self.call(|reply| Request::RequestConfigParam { node_id, param, reply })
    }

    pub fn set_config_param(
        &self,
        node_id: u8,
        param: u8,
        value: i32,
        size: u8,
    ) -> Result<TransactionId, DriverError> {
        self.call(|reply| Request::SetConfigParam {
            node_id,
            param,
            value,
            size,
            reply,
        })
    }

    pub fn test_node(&self, node_id: u8) -> Result<TransactionId, DriverError> {
        self.call(|reply| Request::TestNode { node_id, reply })
    }

    pub fn remove_node(&self, node_id: u8) -> Result<(), DriverError> {
        self.call(|reply| Request::RemoveNode { node_id, reply })
    }

    pub fn node_ids(&self) -> Result<Vec<u8>, DriverError> {
        self.call(Request::NodeIds)
    }

    pub fn node_info(&self, node_id: u8) -> Result<Option<Node>, DriverError> {
        self.call(|reply| Request::NodeInfo(node_id, reply))
    }

    pub fn node_values(&self, node_id: u8) -> Result<Vec<Value>, DriverError> {
        self.call(|reply| Request::NodeValues(node_id, reply))
    }

    pub fn status(&self) -> Result<DriverStatus, DriverError> {
        self.call(Request::Status)
    }

    /// Ask the driver thread to shut down. Requests already sent are served
    /// first; the report comes back through the thread's join handle.
    pub fn shutdown(&self) {
        if self.requests.send(Request::Shutdown).is_err() {
            debug!(port = %self.port, "Driver thread already gone");
        }
    }
}

impl<T: ControllerTransport + 'static> Driver<T> {
    /// Initialize the driver and run it on a dedicated thread.
    pub fn spawn(mut self) -> Result<(DriverHandle, JoinHandle<ShutdownReport>), DriverError> {
        self.initialize()?;
        let (requests, inbox) = mpsc::channel();
        let port = self.config().port.clone();
        let handle = DriverHandle {
            port: port.clone(),
            requests,
            bus: self.bus().clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("zwave {}", port))
            .spawn(move || run(self, inbox))
            .map_err(TransportError::from)?;
        Ok((handle, thread))
    }
}

fn run<T: ControllerTransport>(mut driver: Driver<T>, inbox: Receiver<Request>) -> ShutdownReport {
    info!(port = %driver.config().port, "Driver thread started");
    loop {
        loop {
            match inbox.try_recv() {
                Ok(Request::Shutdown) | Err(TryRecvError::Disconnected) => {
                    return finish(driver, inbox);
                }
                Ok(request) => serve(&mut driver, request),
                Err(TryRecvError::Empty) => break,
            }
        }

        let worked = if driver.state() == DriverState::Failed {
            false
        } else {
            match driver.poll() {
                Ok(worked) => worked,
                Err(e) => {
                    error!(error = %e, "Driver stopped polling");
                    false
                }
            }
        };
        if worked {
            continue;
        }

        // A failed driver only answers requests, each with an error.
        let wait = if driver.state() == DriverState::Failed {
            inbox.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            inbox.recv_timeout(IDLE_WAIT)
        };
        match wait {
            Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                return finish(driver, inbox);
            }
            Ok(request) => serve(&mut driver, request),
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Shut the driver down and answer every request that arrived too late.
fn finish<T: ControllerTransport>(mut driver: Driver<T>, inbox: Receiver<Request>) -> ShutdownReport {
    let report = driver.shutdown();
    let refused = inbox.try_iter().map(refuse).count();
    if refused > 0 {
        debug!(refused, "Refused requests queued behind shutdown");
    }
    report
}

fn refuse(request: Request) {
    match request {
        Request::SubmitCommand { reply, .. }
        | Request::SetValue { reply, .. }
        | Request::RefreshValue { reply, .. }
        | Request::RequestConfigParam { reply, .. }
        | Request::SetConfigParam { reply, .. }
        | Request::TestNode { reply, .. } => {
            let _ = reply.send(Err(DriverError::ShuttingDown));
        }
        Request::GetValue { reply, .. } => {
            let _ = reply.send(Err(DriverError::ShuttingDown));
        }
        Request::EnablePoll { reply, .. } | Request::RemoveNode { reply, .. } => {
            let _ = reply.send(Err(DriverError::ShuttingDown));
        }
        Request::DisablePoll { reply, .. } => {
            let _ = reply.send(Err(DriverError::ShuttingDown));
        }
        Request::NodeIds(reply) => {
            let _ = reply.send(Err(DriverError::ShuttingDown));
        }
        Request::NodeInfo(_, reply) => {
            let _ = reply.send(Err(DriverError::ShuttingDown));
        }
        Request::NodeValues(_, reply) => {
            let _ = reply.send(Err(DriverError::ShuttingDown));
        }
        Request::Status(reply) => {
            let _ = reply.send(Err(DriverError::ShuttingDown));
        }
        Request::Shutdown => {}
    }
}

fn serve<T: ControllerTransport>(driver: &mut Driver<T>, request: Request) {
    // Send errors mean the caller stopped waiting.
    match request {
        Request::SubmitCommand {
            node_id,
            command_class,
            payload,
            reply,
        } => {
            let _ = reply.send(driver.submit_command(node_id, command_class, &payload));
        }
        Request::GetValue { id, reply } => {
            let _ = reply.send(driver.get_value(&id));
        }
        Request::SetValue { id, payload, reply } => {
            let _ = reply.send(driver.set_value(&id, payload));
        }
        Request::RefreshValue { id, reply } => {
            let _ = reply.send(driver.refresh_value(&id));
        }
        Request::EnablePoll { id, reply } => {
            let _ = reply.send(driver.enable_poll(&id));
        }
        Request::DisablePoll { id, reply } => {
            let _ = reply.send(Ok(driver.disable_poll(&id)));
        }
        Request::RequestConfigParam { node_id, param, reply } => {
            let _ = reply.send(driver.request_config_param(node_id, param));
        }
        Request::SetConfigParam {
            node_id,
            param,
            value,
            size,
            reply,
        } => {
            let _ = reply.send(driver.set_config_param(node_id, param, value, size));
        }
        Request::TestNode { node_id, reply } => {
            let _ = reply.send(driver.test_node(node_id));
        }
        Request::RemoveNode { node_id, reply } => {
            let _ = reply.send(driver.remove_node(node_id));
        }
        Request::NodeIds(reply) => {
            let _ = reply.send(Ok(driver.node_ids()));
        }
        Request::NodeInfo(node_id, reply) => {
            let _ = reply.send(Ok(driver.node_info(node_id)));
        }
        Request::NodeValues(node_id, reply) => {
            let _ = reply.send(Ok(driver.node_values(node_id)));
        }
        Request::Status(reply) => {
            let _ = reply.send(Ok(DriverStatus {
                state: driver.state(),
                home_id: driver.home_id(),
                controller_node_id: driver.controller_info().node_id,
                nodes: driver.node_ids().len(),
                all_queried: driver.all_queried(),
            }));
        }
        Request::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::notification::{Notification, NotificationCode, NotificationType};
    use crate::protocol::constants::COMMAND_CLASS_BASIC;
    use crate::transport::{SimNode, SimulatedController};
    use std::sync::Mutex;
    use std::time::Instant;

    fn fast_config() -> DriverConfig {
        DriverConfig {
            ack_timeout_ms: 50,
            reply_timeout_ms: 100,
            retry_initial_backoff_ms: 1,
            retry_max_backoff_ms: 5,
            save_configuration: false,
            ..DriverConfig::new("sim")
        }
    }

    fn wait_for(handle: &DriverHandle, timeout: Duration, done: impl Fn(&DriverStatus) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if handle.status().is_ok_and(|status| done(&status)) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_spawned_driver_serves_requests() {
        let sim = SimulatedController::new(0x0A0B_0C0D);
        sim.add_node(SimNode::switch(2));
        let driver = Driver::new(fast_config(), sim.transport());
        let (handle, thread) = driver.spawn().unwrap();

        assert!(wait_for(&handle, Duration::from_secs(5), |s| s.all_queried));
        let status = handle.status().unwrap();
        assert_eq!(status.home_id, 0x0A0B_0C0D);
        assert_eq!(handle.node_ids().unwrap(), vec![1, 2]);
        assert!(matches!(handle.node_info(9), Ok(None)));

        handle.shutdown();
        thread.join().unwrap();
        assert!(matches!(handle.status(), Err(DriverError::ShuttingDown)));
    }

    #[test]
    fn test_requests_behind_shutdown_are_refused() {
        let sim = SimulatedController::new(0x0A0B_0C0D);
        let driver = Driver::new(fast_config(), sim.transport());
        let (requests, inbox) = mpsc::channel();
        let (submit, submitted) = mpsc::channel();
        let (status, statused) = mpsc::channel();
        requests.send(Request::Shutdown).unwrap();
        requests
            .send(Request::SubmitCommand {
                node_id: 2,
                command_class: COMMAND_CLASS_BASIC,
                payload: vec![0x01, 0xFF],
                reply: submit,
            })
            .unwrap();
        requests.send(Request::Status(status)).unwrap();

        finish(driver, inbox);

        assert!(matches!(submitted.recv(), Ok(Err(DriverError::ShuttingDown))));
        assert!(matches!(statused.recv(), Ok(Err(DriverError::ShuttingDown))));
    }

    #[test]
    fn test_concurrent_submissions_keep_caller_order() {
        let sim = SimulatedController::new(0x0A0B_0C0D);
        sim.add_node(SimNode::switch(2));
        sim.add_node(SimNode::switch(3));
        let driver = Driver::new(fast_config(), sim.transport());
        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completed);
        driver.add_watcher(Arc::new(move |n: &Notification| {
            if n.kind == NotificationType::Notification && n.code == Some(NotificationCode::MsgComplete) {
                sink.lock().unwrap().extend(n.transaction());
            }
        }));
        let (handle, thread) = driver.spawn().unwrap();
        assert!(wait_for(&handle, Duration::from_secs(5), |s| s.all_queried));

        let callers: Vec<_> = [2u8, 3u8]
            .into_iter()
            .map(|node_id| {
                let handle = handle.clone();
                thread::spawn(move || {
                    (1..=5u8)
                        .map(|level| {
                            handle
                                .submit_command(node_id, COMMAND_CLASS_BASIC, &[0x01, level])
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let submitted: Vec<Vec<TransactionId>> =
            callers.into_iter().map(|c| c.join().unwrap()).collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        while completed.lock().unwrap().len() < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
        let report = thread.join().unwrap();

        let completed = completed.lock().unwrap().clone();
        for ids in &submitted {
            let order: Vec<_> = completed.iter().filter(|id| ids.contains(id)).copied().collect();
            assert_eq!(&order, ids);
        }
        assert_eq!(report.completed.len(), 10);
        assert_eq!(sim.overlap_violations(), 0);
        for node_id in [2u8, 3u8] {
            let levels: Vec<u8> = sim
                .delivered(node_id)
                .iter()
                .filter(|data| data.starts_with(&[COMMAND_CLASS_BASIC, 0x01]))
                .map(|data| data[2])
                .collect();
            assert_eq!(levels, vec![1, 2, 3, 4, 5]);
        }
    }
}
