//! Outgoing transaction queue and reply correlation.
//!
//! The serial API allows one outstanding request per link. The dispatcher
//! owns that single in-flight slot, the priority tiers waiting behind it,
//! and the per-node hold queues used while battery devices sleep. It never
//! touches the transport itself: the driver feeds it received control bytes
//! and frames, writes whatever [`Dispatcher::poll_send`] returns, and drains
//! the resulting [`DispatchEvent`]s.

pub mod retry;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::node::QueryStage;
use crate::protocol::{ControlByte, Expectation, Frame, Message, ReplyMatch};
use crate::value::ValueId;

pub use retry::{ExponentialBackoff, RetryPolicy};

pub type TransactionId = u64;

/// Queue tiers, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Controller,
    Node,
    Poll,
}

impl Priority {
    fn index(self) -> usize {
        self as usize
    }
}

/// Why a transaction exists; decides what completion means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Controller handshake during initialization.
    Init,
    /// Interview step for a node.
    Query { node_id: u8, stage: QueryStage },
    /// Raw command or explicit refresh submitted by a caller.
    Command,
    /// Write of a value submitted by a caller.
    SetValue(ValueId),
    /// Read-back queued after a write.
    Refresh(ValueId),
    /// Periodic refresh of a polled value.
    Poll(ValueId),
    /// NoOperation sent by `test_node`.
    TestNode,
    /// WakeUp NoMoreInformation after a wake-up flush.
    NoMoreInformation,
}

impl Origin {
    /// Submitted from outside the driver; completion is announced.
    pub fn is_external(&self) -> bool {
        matches!(self, Origin::Command | Origin::SetValue(_) | Origin::TestNode)
    }
}

/// A queued or in-flight request.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub message: Message,
    pub priority: Priority,
    pub origin: Origin,
}

impl Transaction {
    pub fn target(&self) -> Option<u8> {
        self.message.target
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.message)
    }
}

/// Reason a transmission attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// Node did not acknowledge the radio frame.
    NoAck,
    /// Controller answered NAK/CAN or refused the request.
    Rejected,
    /// Nothing came back in time.
    Timeout,
    /// Node acknowledged the frame but never sent the report.
    NoReport,
}

impl FailReason {
    /// Whether the node itself failed to communicate.
    pub fn is_link_failure(&self) -> bool {
        !matches!(self, FailReason::NoReport)
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::NoAck => write!(f, "no ack from node"),
            FailReason::Rejected => write!(f, "rejected by controller"),
            FailReason::Timeout => write!(f, "timeout"),
            FailReason::NoReport => write!(f, "no report"),
        }
    }
}

/// Outcome produced by the dispatcher for the driver to act on.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Completed(Transaction),
    /// Dropped after its attempts ran out.
    Failed {
        transaction: Transaction,
        reason: FailReason,
    },
    /// A sleeping device stopped answering; its traffic is now held.
    NodeAsleep(u8),
}

/// Snapshot of the in-flight transaction for frame handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightInfo {
    pub id: TransactionId,
    pub target: Option<u8>,
    pub function: u8,
    pub origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitAck { deadline: Instant },
    AwaitReply { deadline: Instant },
    Backoff { until: Instant },
}

#[derive(Debug)]
struct InFlight {
    tx: Transaction,
    attempts: u32,
    callback_id: Option<u8>,
    met: Vec<bool>,
    phase: Phase,
}

impl InFlight {
    fn all_met(&self) -> bool {
        self.met.iter().all(|m| *m)
    }

    /// Every unmet expectation is a report and the node acknowledged at
    /// link level, so the node heard us but does not answer this command.
    fn only_reports_missing(&self) -> bool {
        let mut link_confirmed = false;
        for (exp, met) in self.tx.message.expect.iter().zip(&self.met) {
            match (exp, met) {
                (Expectation::Callback(_), true) => link_confirmed = true,
                (Expectation::Report { .. }, false) => {}
                (_, false) => return false,
                _ => {}
            }
        }
        link_confirmed
    }
}

/// Priority queue plus single-slot in-flight tracker.
#[derive(Debug)]
pub struct Dispatcher {
    policy: RetryPolicy,
    queues: [VecDeque<Transaction>; 3],
    /// Released hold queues, served before the node tier in original order.
    woken: VecDeque<Transaction>,
    held: BTreeMap<u8, Vec<Transaction>>,
    /// Nodes whose traffic is currently held.
    asleep: BTreeSet<u8>,
    /// Non-listening devices; a NoAck means "asleep" rather than "failed".
    sleepers: BTreeSet<u8>,
    in_flight: Option<InFlight>,
    next_id: TransactionId,
    next_callback: u8,
    events: Vec<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            queues: Default::default(),
            woken: VecDeque::new(),
            held: BTreeMap::new(),
            asleep: BTreeSet::new(),
            sleepers: BTreeSet::new(),
            in_flight: None,
            next_id: 1,
            next_callback: 1,
            events: Vec::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a message. Traffic for a held node goes straight to its hold queue.
    pub fn enqueue(&mut self, message: Message, priority: Priority, origin: Origin) -> TransactionId {
        let id = self.next_id;
        self.next_id += 1;
        let tx = Transaction {
            id,
            message,
            priority,
            origin,
        };

        match tx.target() {
            Some(node) if self.asleep.contains(&node) => {
                debug!(tx = %tx, node, "Holding transaction for sleeping node");
                self.held.entry(node).or_default().push(tx);
            }
            _ => {
                debug!(tx = %tx, priority = ?priority, "Queued");
                self.queues[priority.index()].push_back(tx);
            }
        }
        id
    }

    /// Next bytes to write, if the link is free or a retry is due.
    pub fn poll_send(&mut self, now: Instant) -> Option<Vec<u8>> {
        match self.in_flight.as_ref().map(|flight| flight.phase) {
            Some(Phase::Backoff { until }) if now >= until => self.transmit(now),
            Some(_) => None,
            None => {
                let tx = self.pop_next()?;
                self.in_flight = Some(InFlight {
                    met: vec![false; tx.message.expect.len()],
                    tx,
                    attempts: 0,
                    callback_id: None,
                    phase: Phase::Backoff { until: now },
                });
                self.transmit(now)
            }
        }
    }

    fn pop_next(&mut self) -> Option<Transaction> {
        if let Some(tx) = self.queues[Priority::Controller.index()].pop_front() {
            return Some(tx);
        }
        if let Some(tx) = self.woken.pop_front() {
            return Some(tx);
        }
        self.queues[Priority::Node.index()]
            .pop_front()
            .or_else(|| self.queues[Priority::Poll.index()].pop_front())
    }

    fn transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        let uses_callback = self.in_flight.as_ref()?.tx.message.uses_callback;
        let callback_id = uses_callback.then(|| self.fresh_callback_id());
        let flight = self.in_flight.as_mut()?;
        flight.attempts += 1;
        flight.callback_id = callback_id;
        flight.met.iter_mut().for_each(|m| *m = false);
        flight.phase = Phase::AwaitAck {
            deadline: now + self.policy.ack_timeout,
        };

        match flight.tx.message.to_frame(callback_id).encode() {
            Ok(bytes) => {
                debug!(tx = %flight.tx, attempt = flight.attempts, callback = ?callback_id, "Sending");
                Some(bytes)
            }
            Err(e) => {
                error!(tx = %flight.tx, error = %e, "Cannot encode message");
                self.finish_failed(FailReason::Rejected);
                None
            }
        }
    }

    fn fresh_callback_id(&mut self) -> u8 {
        let id = self.next_callback;
        self.next_callback = if id == u8::MAX { 1 } else { id + 1 };
        id
    }

    /// Feed a received ACK/NAK/CAN.
    pub fn on_control(&mut self, control: ControlByte, now: Instant) {
        let Some(flight) = self.in_flight.as_mut() else {
            trace!(control = %control, "Control byte with nothing in flight");
            return;
        };
        if !matches!(flight.phase, Phase::AwaitAck { .. }) {
            trace!(control = %control, "Unexpected control byte");
            return;
        }

        match control {
            ControlByte::Ack if flight.all_met() => self.finish_completed(),
            ControlByte::Ack => {
                flight.phase = Phase::AwaitReply {
                    deadline: now + self.policy.reply_timeout,
                };
            }
            ControlByte::Nak | ControlByte::Can => {
                warn!(tx = %flight.tx, control = %control, "Controller rejected frame");
                self.attempt_failed(FailReason::Rejected, now);
            }
        }
    }

    /// Feed a received data frame. Returns true if it answered the in-flight
    /// transaction.
    pub fn on_frame(&mut self, frame: &Frame, now: Instant) -> bool {
        let Some(flight) = self.in_flight.as_mut() else {
            return false;
        };
        if matches!(flight.phase, Phase::Backoff { .. }) {
            return false;
        }

        let callback_id = flight.callback_id;
        let hit = flight
            .tx
            .message
            .expect
            .iter()
            .enumerate()
            .filter(|(i, _)| !flight.met[*i])
            .find_map(|(i, exp)| match exp.check(frame, callback_id) {
                ReplyMatch::NoMatch => None,
                outcome => Some((i, *exp, outcome)),
            });

        let Some((index, expectation, outcome)) = hit else {
            return false;
        };

        if outcome == ReplyMatch::Failed {
            let reason = match expectation {
                Expectation::Response(_) => FailReason::Rejected,
                _ => FailReason::NoAck,
            };
            warn!(tx = %flight.tx, reason = %reason, "Transmission failed");
            self.attempt_failed(reason, now);
            return true;
        }

        // A reply implies the ACK we may have missed.
        flight.met[index] = true;
        if flight.all_met() {
            self.finish_completed();
        } else {
            flight.phase = Phase::AwaitReply {
                deadline: now + self.policy.reply_timeout,
            };
        }
        true
    }

    /// Expire ACK and reply deadlines.
    pub fn check_timeouts(&mut self, now: Instant) {
        let Some(flight) = self.in_flight.as_ref() else {
            return;
        };
        match flight.phase {
            Phase::AwaitAck { deadline } if now >= deadline => {
                warn!(tx = %flight.tx, "No ACK from controller");
                self.attempt_failed(FailReason::Timeout, now);
            }
            Phase::AwaitReply { deadline } if now >= deadline => {
                if flight.only_reports_missing() {
                    debug!(tx = %flight.tx, "Node acknowledged but sent no report");
                    self.finish_failed(FailReason::NoReport);
                } else {
                    warn!(tx = %flight.tx, "Reply timeout");
                    self.attempt_failed(FailReason::Timeout, now);
                }
            }
            _ => {}
        }
    }

    fn attempt_failed(&mut self, reason: FailReason, now: Instant) {
        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };

        if reason == FailReason::NoAck
            && let Some(node) = flight.tx.target()
            && self.sleepers.contains(&node)
        {
            if let Some(flight) = self.in_flight.take() {
                debug!(tx = %flight.tx, node, "Sleeping device did not answer; holding");
                self.held.entry(node).or_default().push(flight.tx);
            }
            self.hold_node(node);
            self.events.push(DispatchEvent::NodeAsleep(node));
            return;
        }

        if self.policy.should_retry(flight.attempts) {
            let delay = self.policy.delay_after(flight.attempts);
            warn!(tx = %flight.tx, attempt = flight.attempts, reason = %reason, delay_ms = delay.as_millis() as u64, "Retrying");
            flight.phase = Phase::Backoff { until: now + delay };
        } else {
            warn!(tx = %flight.tx, attempts = flight.attempts, reason = %reason, "Giving up");
            self.finish_failed(reason);
        }
    }

    fn finish_completed(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            debug!(tx = %flight.tx, attempts = flight.attempts, "Completed");
            self.events.push(DispatchEvent::Completed(flight.tx));
        }
    }

    fn finish_failed(&mut self, reason: FailReason) {
        if let Some(flight) = self.in_flight.take() {
            self.events.push(DispatchEvent::Failed {
                transaction: flight.tx,
                reason,
            });
        }
    }

    /// Resend the in-flight transaction at once (after a reconnect).
    pub fn restart_in_flight(&mut self, now: Instant) {
        if let Some(flight) = self.in_flight.as_mut() {
            flight.phase = Phase::Backoff { until: now };
        }
    }

    /// Give up on the in-flight transaction without waiting (shutdown, link loss).
    pub fn abort_in_flight(&mut self) -> Option<Transaction> {
        let flight = self.in_flight.take()?;
        warn!(tx = %flight.tx, attempts = flight.attempts, "Abandoned in flight");
        Some(flight.tx)
    }

    /// Withdraw a queued transaction. In-flight transactions cannot be
    /// cancelled.
    pub fn cancel(&mut self, id: TransactionId) -> Option<Transaction> {
        self.cancel_where(|tx| tx.id == id).pop()
    }

    /// Withdraw every queued or held transaction matching `pred`, in id order.
    pub fn cancel_where<F>(&mut self, pred: F) -> Vec<Transaction>
    where
        F: Fn(&Transaction) -> bool,
    {
        let removed = self.take_where(pred);
        for tx in &removed {
            debug!(tx = %tx, "Cancelled");
        }
        removed
    }

    fn take_where<F>(&mut self, pred: F) -> Vec<Transaction>
    where
        F: Fn(&Transaction) -> bool,
    {
        let mut removed = Vec::new();
        let mut take = |queue: &mut VecDeque<Transaction>| {
            let (hit, keep): (VecDeque<_>, VecDeque<_>) = queue.drain(..).partition(|tx| pred(tx));
            *queue = keep;
            removed.extend(hit);
        };
        for queue in self.queues.iter_mut() {
            take(queue);
        }
        take(&mut self.woken);
        for held in self.held.values_mut() {
            let (hit, keep): (Vec<_>, Vec<_>) = held.drain(..).partition(|tx| pred(tx));
            *held = keep;
            removed.extend(hit);
        }
        self.held.retain(|_, held| !held.is_empty());

        removed.sort_by_key(|tx| tx.id);
        removed
    }

    /// Withdraw everything not yet sent.
    pub fn cancel_all(&mut self) -> Vec<Transaction> {
        self.cancel_where(|_| true)
    }

    /// Record whether `node_id` is a non-listening (battery) device.
    pub fn set_sleeping_device(&mut self, node_id: u8, sleeping: bool) {
        if sleeping {
            self.sleepers.insert(node_id);
        } else {
            self.sleepers.remove(&node_id);
        }
    }

    /// Divert all queued and future traffic for `node_id` into its hold queue.
    pub fn hold_node(&mut self, node_id: u8) {
        self.asleep.insert(node_id);
        let moved = self.take_where(|tx| tx.target() == Some(node_id));
        self.held.entry(node_id).or_default().extend(moved);
    }

    /// Release a node's hold queue for sending, oldest first.
    pub fn release_node(&mut self, node_id: u8) -> usize {
        self.asleep.remove(&node_id);
        let mut held = self.held.remove(&node_id).unwrap_or_default();
        held.sort_by_key(|tx| tx.id);
        let count = held.len();
        if count > 0 {
            debug!(node = node_id, count, "Releasing held transactions");
        }
        self.woken.extend(held);
        count
    }

    pub fn is_held(&self, node_id: u8) -> bool {
        self.asleep.contains(&node_id)
    }

    pub fn held_count(&self, node_id: u8) -> usize {
        self.held.get(&node_id).map_or(0, Vec::len)
    }

    fn all_pending(&self) -> impl Iterator<Item = &Transaction> {
        self.in_flight
            .iter()
            .map(|flight| &flight.tx)
            .chain(self.queues.iter().flatten())
            .chain(self.woken.iter())
            .chain(self.held.values().flatten())
    }

    /// Number of unfinished transactions matching `pred`, in flight included.
    pub fn count_pending<F>(&self, pred: F) -> usize
    where
        F: Fn(&Transaction) -> bool,
    {
        self.all_pending().filter(|tx| pred(tx)).count()
    }

    pub fn pending_for_node(&self, node_id: u8) -> usize {
        self.count_pending(|tx| tx.target() == Some(node_id))
    }

    pub fn pending_for_stage(&self, node_id: u8, stage: QueryStage) -> usize {
        self.count_pending(|tx| tx.origin == Origin::Query { node_id, stage })
    }

    pub fn in_flight_info(&self) -> Option<InFlightInfo> {
        self.in_flight.as_ref().map(|flight| InFlightInfo {
            id: flight.tx.id,
            target: flight.tx.target(),
            function: flight.tx.message.function,
            origin: flight.tx.origin,
        })
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Transactions waiting to be sent, held ones excluded.
    pub fn queued_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum::<usize>() + self.woken.len()
    }

    pub fn queued_in(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queued_len() == 0
    }

    pub fn drain_events(&mut self) -> Vec<DispatchEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
