//! Mock controller transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{ControllerInterface, ControllerTransport, TransportError};
use crate::protocol::Frame;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Mock transport for unit testing driver logic.
///
/// Clones share the same queues, so a test can keep one clone to script
/// reads and inspect writes while the driver owns another.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued chunks to return on read.
    read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Produces read chunks in reaction to each write.
    responder: Arc<Mutex<Option<Responder>>>,
    /// Whether the controller is "connected".
    connected: Arc<Mutex<bool>>,
    /// Whether `reopen` succeeds.
    reopen_ok: Arc<Mutex<bool>>,
    reopen_count: Arc<Mutex<u32>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(true)),
            reopen_ok: Arc::new(Mutex::new(true)),
            reopen_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue raw bytes to be returned on a later read.
    pub fn queue_read(&self, bytes: &[u8]) {
        lock(&self.read_queue).push_back(bytes.to_vec());
    }

    /// Queue an encoded frame.
    pub fn queue_frame(&self, frame: &Frame) {
        if let Ok(bytes) = frame.encode() {
            self.queue_read(&bytes);
        }
    }

    /// Install a responder called with every write.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
    }

    /// Simulate controller unplug.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    /// Simulate controller replug.
    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }

    /// Make subsequent `reopen` calls fail or succeed.
    pub fn set_reopen_ok(&self, ok: bool) {
        *lock(&self.reopen_ok) = ok;
    }

    pub fn reopen_count(&self) -> u32 {
        *lock(&self.reopen_count)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        lock(&self.write_log).push(data.to_vec());

        let replies = match lock(&self.responder).as_mut() {
            Some(responder) => responder(data),
            None => Vec::new(),
        };
        lock(&self.read_queue).extend(replies);
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        let mut queue = lock(&self.read_queue);
        let Some(mut chunk) = queue.pop_front() else {
            return Err(TransportError::Timeout { timeout_ms: 0 });
        };
        if chunk.len() > max_len {
            let rest = chunk.split_off(max_len);
            queue.push_front(rest);
        }
        Ok(chunk)
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    fn interface(&self) -> ControllerInterface {
        ControllerInterface::Unknown
    }

    fn reopen(&self) -> Result<(), TransportError> {
        *lock(&self.reopen_count) += 1;
        if *lock(&self.reopen_ok) {
            *lock(&self.connected) = true;
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}
