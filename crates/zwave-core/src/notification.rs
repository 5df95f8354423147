//! Notification types and watchers.
//!
//! Notifications are the only asynchronous interface the driver exposes.
//! CLI, bindings and other consumers register a [`Watcher`] on the
//! [`NotificationBus`](crate::bus::NotificationBus) instead of reaching into
//! driver state.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::value::ValueId;

/// Protocol log levels, most to least severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    None,
    Always,
    Fatal,
    Error,
    Warning,
    Alert,
    #[default]
    Info,
    Detail,
    Debug,
    StreamDetail,
    Internal,
}

impl LogLevel {
    pub const ALL: [LogLevel; 11] = [
        LogLevel::None,
        LogLevel::Always,
        LogLevel::Fatal,
        LogLevel::Error,
        LogLevel::Warning,
        LogLevel::Alert,
        LogLevel::Info,
        LogLevel::Detail,
        LogLevel::Debug,
        LogLevel::StreamDetail,
        LogLevel::Internal,
    ];

    /// Equivalent `tracing` filter.
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::None => LevelFilter::OFF,
            LogLevel::Always | LogLevel::Fatal | LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warning | LogLevel::Alert => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Detail | LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::StreamDetail | LogLevel::Internal => LevelFilter::TRACE,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| level.to_string().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::None => "None",
            LogLevel::Always => "Always",
            LogLevel::Fatal => "Fatal",
            LogLevel::Error => "Error",
            LogLevel::Warning => "Warning",
            LogLevel::Alert => "Alert",
            LogLevel::Info => "Info",
            LogLevel::Detail => "Detail",
            LogLevel::Debug => "Debug",
            LogLevel::StreamDetail => "StreamDetail",
            LogLevel::Internal => "Internal",
        };
        write!(f, "{}", name)
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    ValueAdded,
    ValueRemoved,
    ValueChanged,
    ValueRefreshed,
    Group,
    NodeNew,
    NodeAdded,
    NodeRemoved,
    NodeProtocolInfo,
    NodeNaming,
    NodeEvent,
    PollingDisabled,
    PollingEnabled,
    SceneEvent,
    CreateButton,
    DeleteButton,
    ButtonOn,
    ButtonOff,
    DriverReady,
    DriverFailed,
    DriverReset,
    EssentialNodeQueriesComplete,
    NodeQueriesComplete,
    AwakeNodesQueried,
    AllNodesQueriedSomeDead,
    AllNodesQueried,
    Notification,
    DriverRemoved,
    ControllerCommand,
    NodeReset,
    UserAlerts,
    ManufacturerSpecificDBReady,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Detail code carried by [`NotificationType::Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationCode {
    /// An externally submitted transaction completed.
    MsgComplete,
    /// A transaction was dropped after its retries ran out.
    Timeout,
    /// A NoOperation test frame reached the node.
    NoOperation,
    Awake,
    Sleep,
    Dead,
    Alive,
}

impl fmt::Display for NotificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Extra data attached to some notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationPayload {
    /// Event byte of a `NodeEvent` (Basic Set value).
    Event(u8),
    /// Human-readable message of a `UserAlerts`.
    Alert(String),
    /// Reason carried by `DriverFailed`.
    Failure(String),
    /// Transaction a `MsgComplete` / `Timeout` refers to.
    Transaction(u64),
}

/// Immutable event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationType,
    pub code: Option<NotificationCode>,
    pub home_id: u32,
    pub node_id: u8,
    pub value_id: Option<ValueId>,
    pub payload: Option<NotificationPayload>,
}

impl Notification {
    pub fn new(kind: NotificationType, home_id: u32, node_id: u8) -> Self {
        Self {
            kind,
            code: None,
            home_id,
            node_id,
            value_id: None,
            payload: None,
        }
    }

    /// A `Notification`-type event with a code.
    pub fn with_code(code: NotificationCode, home_id: u32, node_id: u8) -> Self {
        Self {
            code: Some(code),
            ..Self::new(NotificationType::Notification, home_id, node_id)
        }
    }

    pub fn for_value(kind: NotificationType, home_id: u32, value_id: ValueId) -> Self {
        Self {
            value_id: Some(value_id),
            ..Self::new(kind, home_id, value_id.node_id)
        }
    }

    pub fn payload(mut self, payload: NotificationPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Transaction id of a `MsgComplete` / `Timeout`.
    pub fn transaction(&self) -> Option<u64> {
        match self.payload {
            Some(NotificationPayload::Transaction(id)) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(code) = self.code {
            write!(f, "({})", code)?;
        }
        write!(f, " home=0x{:08X} node={}", self.home_id, self.node_id)?;
        if let Some(value_id) = self.value_id {
            write!(f, " value={}", value_id)?;
        }
        Ok(())
    }
}

/// Receives notifications on the driver thread.
///
/// Implementations must return quickly: delivery is synchronous and a slow
/// watcher stalls network I/O for its driver.
pub trait Watcher: Send + Sync {
    fn on_notification(&self, notification: &Notification);
}

impl<F> Watcher for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn on_notification(&self, notification: &Notification) {
        self(notification)
    }
}

/// Watcher that logs notifications using tracing.
pub struct TracingWatcher;

impl Watcher for TracingWatcher {
    fn on_notification(&self, n: &Notification) {
        let home_id = format!("{:08X}", n.home_id);
        let value = n.value_id.map(|v| v.to_string()).unwrap_or_default();
        match n.kind {
            NotificationType::DriverFailed => {
                let reason = match &n.payload {
                    Some(NotificationPayload::Failure(reason)) => reason.as_str(),
                    _ => "",
                };
                tracing::error!(home_id = %home_id, reason, "Driver failed");
            }
            NotificationType::UserAlerts => {
                let message = match &n.payload {
                    Some(NotificationPayload::Alert(message)) => message.as_str(),
                    _ => "",
                };
                tracing::warn!(home_id = %home_id, "{}", message);
            }
            NotificationType::Notification => match n.code {
                Some(NotificationCode::Timeout) | Some(NotificationCode::Dead) => {
                    tracing::warn!(home_id = %home_id, node = n.node_id, code = ?n.code, "Notification");
                }
                _ => {
                    tracing::debug!(home_id = %home_id, node = n.node_id, code = ?n.code, "Notification");
                }
            },
            NotificationType::ValueAdded
            | NotificationType::ValueRemoved
            | NotificationType::ValueChanged
            | NotificationType::ValueRefreshed => {
                tracing::debug!(home_id = %home_id, node = n.node_id, value = %value, "{}", n.kind);
            }
            NotificationType::DriverReady
            | NotificationType::DriverRemoved
            | NotificationType::AwakeNodesQueried
            | NotificationType::AllNodesQueried
            | NotificationType::AllNodesQueriedSomeDead
            | NotificationType::NodeQueriesComplete => {
                tracing::info!(home_id = %home_id, node = n.node_id, "{}", n.kind);
            }
            _ => {
                tracing::debug!(home_id = %home_id, node = n.node_id, "{}", n.kind);
            }
        }
    }
}
