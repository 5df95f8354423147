//! Typed values exposed by command classes.

pub mod store;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::{StoreUpdate, ValueStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("Invalid type for {id}: expected {expected}, got {actual}")]
    InvalidType {
        id: ValueId,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("Invalid {value_type} payload for {id}: {reason}")]
    InvalidPayload {
        id: ValueId,
        value_type: ValueType,
        reason: String,
    },

    #[error("Value {0} is read-only")]
    ReadOnly(ValueId),

    #[error("Unknown value {0}")]
    UnknownValue(ValueId),

    #[error("Value {0} already exists")]
    AlreadyExists(ValueId),
}

/// Who a value is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueGenre {
    /// The level controlled by basic commands.
    Basic,
    /// What an ordinary user would be interested in.
    User,
    /// Device-specific configuration parameters.
    Config,
    /// Protocol-level detail.
    System,
}

impl fmt::Display for ValueGenre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueGenre::Basic => write!(f, "Basic"),
            ValueGenre::User => write!(f, "User"),
            ValueGenre::Config => write!(f, "Config"),
            ValueGenre::System => write!(f, "System"),
        }
    }
}

/// Type tag of a value. Fixed for the value's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Byte,
    /// Non-integer number kept as text to avoid rounding loss.
    Decimal,
    Int,
    List,
    Schedule,
    Short,
    String,
    /// Write-only trigger.
    Button,
    Raw,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "Bool",
            ValueType::Byte => "Byte",
            ValueType::Decimal => "Decimal",
            ValueType::Int => "Int",
            ValueType::List => "List",
            ValueType::Schedule => "Schedule",
            ValueType::Short => "Short",
            ValueType::String => "String",
            ValueType::Button => "Button",
            ValueType::Raw => "Raw",
        };
        write!(f, "{}", name)
    }
}

/// Identity of a value on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId {
    pub node_id: u8,
    pub command_class: u8,
    pub instance: u8,
    pub index: u8,
}

impl ValueId {
    pub fn new(node_id: u8, command_class: u8, instance: u8, index: u8) -> Self {
        Self {
            node_id,
            command_class,
            instance,
            index,
        }
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/0x{:02X}/{}/{}",
            self.node_id, self.command_class, self.instance, self.index
        )
    }
}

/// One entry of a list value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub label: String,
    pub value: i32,
}

/// A list value: the choices and the selected item's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueList {
    pub items: Vec<ListItem>,
    pub selected: i32,
}

impl ValueList {
    pub fn selected_label(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.value == self.selected)
            .map(|item| item.label.as_str())
    }
}

/// A climate control schedule switch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switchpoint {
    pub hours: u8,
    pub minutes: u8,
    /// Setback in tenths of a degree.
    pub setback: i8,
}

/// Maximum switch points per schedule day.
pub const MAX_SWITCHPOINTS: usize = 9;

/// Type-tagged payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValuePayload {
    Bool(bool),
    Byte(u8),
    Decimal(String),
    Int(i32),
    List(ValueList),
    Schedule(Vec<Switchpoint>),
    Short(i16),
    String(String),
    Button(bool),
    Raw(Vec<u8>),
}

impl ValuePayload {
    pub fn value_type(&self) -> ValueType {
        match self {
            ValuePayload::Bool(_) => ValueType::Bool,
            ValuePayload::Byte(_) => ValueType::Byte,
            ValuePayload::Decimal(_) => ValueType::Decimal,
            ValuePayload::Int(_) => ValueType::Int,
            ValuePayload::List(_) => ValueType::List,
            ValuePayload::Schedule(_) => ValueType::Schedule,
            ValuePayload::Short(_) => ValueType::Short,
            ValuePayload::String(_) => ValueType::String,
            ValuePayload::Button(_) => ValueType::Button,
            ValuePayload::Raw(_) => ValueType::Raw,
        }
    }

    /// Zero value for a type.
    pub fn default_for(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Bool => ValuePayload::Bool(false),
            ValueType::Byte => ValuePayload::Byte(0),
            ValueType::Decimal => ValuePayload::Decimal("0".to_string()),
            ValueType::Int => ValuePayload::Int(0),
            ValueType::List => ValuePayload::List(ValueList {
                items: Vec::new(),
                selected: 0,
            }),
            ValueType::Schedule => ValuePayload::Schedule(Vec::new()),
            ValueType::Short => ValuePayload::Short(0),
            ValueType::String => ValuePayload::String(String::new()),
            ValueType::Button => ValuePayload::Button(false),
            ValueType::Raw => ValuePayload::Raw(Vec::new()),
        }
    }

    /// Parse user text (CLI, config overrides) as a payload of `value_type`.
    pub fn parse(value_type: ValueType, text: &str) -> Option<Self> {
        let text = text.trim();
        match value_type {
            ValueType::Bool => match text.to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(ValuePayload::Bool(true)),
                "false" | "off" | "0" => Some(ValuePayload::Bool(false)),
                _ => None,
            },
            ValueType::Byte => text.parse().ok().map(ValuePayload::Byte),
            ValueType::Decimal => {
                is_decimal(text).then(|| ValuePayload::Decimal(text.to_string()))
            }
            ValueType::Int => text.parse().ok().map(ValuePayload::Int),
            ValueType::Short => text.parse().ok().map(ValuePayload::Short),
            ValueType::String => Some(ValuePayload::String(text.to_string())),
            ValueType::Button => match text {
                "press" | "1" | "true" => Some(ValuePayload::Button(true)),
                "release" | "0" | "false" => Some(ValuePayload::Button(false)),
                _ => None,
            },
            ValueType::Raw => parse_hex(text).map(ValuePayload::Raw),
            ValueType::List => text.parse().ok().map(|selected| {
                ValuePayload::List(ValueList {
                    items: Vec::new(),
                    selected,
                })
            }),
            ValueType::Schedule => None,
        }
    }
}

impl fmt::Display for ValuePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValuePayload::Bool(v) | ValuePayload::Button(v) => write!(f, "{}", v),
            ValuePayload::Byte(v) => write!(f, "{}", v),
            ValuePayload::Decimal(v) | ValuePayload::String(v) => write!(f, "{}", v),
            ValuePayload::Int(v) => write!(f, "{}", v),
            ValuePayload::Short(v) => write!(f, "{}", v),
            ValuePayload::List(list) => match list.selected_label() {
                Some(label) => write!(f, "{}", label),
                None => write!(f, "{}", list.selected),
            },
            ValuePayload::Schedule(points) => write!(f, "{} switchpoints", points.len()),
            ValuePayload::Raw(bytes) => write!(f, "{}", crate::protocol::frame::hex_dump(bytes)),
        }
    }
}

/// `-?digits(.digits)?`
pub fn is_decimal(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(int_part) && frac_part.is_none_or(all_digits)
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return None;
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).ok())
        .collect()
}

/// A value held in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    pub genre: ValueGenre,
    value_type: ValueType,
    pub label: String,
    pub units: String,
    pub read_only: bool,
    pub write_only: bool,
    payload: ValuePayload,
    /// Wire width in bytes, when the device dictates one.
    #[serde(default)]
    size: Option<u8>,
    /// Last payload written and not yet confirmed by the device.
    #[serde(skip)]
    pending: Option<ValuePayload>,
}

impl Value {
    /// Create a value holding the zero payload for `value_type`.
    pub fn new(id: ValueId, genre: ValueGenre, value_type: ValueType, label: &str) -> Self {
        Self {
            id,
            genre,
            value_type,
            label: label.to_string(),
            units: String::new(),
            read_only: false,
            write_only: false,
            payload: ValuePayload::default_for(value_type),
            size: None,
            pending: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.write_only = true;
        self
    }

    /// Initial payload; must carry the value's own type.
    pub fn with_payload(mut self, payload: ValuePayload) -> Self {
        if payload.value_type() == self.value_type {
            self.payload = payload;
        }
        self
    }

    pub fn with_size(mut self, size: u8) -> Self {
        self.size = Some(size);
        self
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn size(&self) -> Option<u8> {
        self.size
    }

    pub fn payload(&self) -> &ValuePayload {
        &self.payload
    }

    pub fn pending(&self) -> Option<&ValuePayload> {
        self.pending.as_ref()
    }

    /// Check a payload against this value's type and constraints.
    pub fn validate(&self, payload: &ValuePayload) -> Result<(), ValueError> {
        if payload.value_type() != self.value_type {
            return Err(ValueError::InvalidType {
                id: self.id,
                expected: self.value_type,
                actual: payload.value_type(),
            });
        }

        let invalid = |reason: &str| ValueError::InvalidPayload {
            id: self.id,
            value_type: self.value_type,
            reason: reason.to_string(),
        };

        match payload {
            ValuePayload::Decimal(text) if !is_decimal(text) => Err(invalid("not a decimal number")),
            ValuePayload::List(list) => {
                let known = match &self.payload {
                    ValuePayload::List(current) => &current.items,
                    _ => return Err(invalid("value holds no list")),
                };
                if known.iter().any(|item| item.value == list.selected) {
                    Ok(())
                } else {
                    Err(invalid("selection is not one of the list items"))
                }
            }
            ValuePayload::Schedule(points) => {
                if points.len() > MAX_SWITCHPOINTS {
                    return Err(invalid("too many switchpoints"));
                }
                if points.iter().any(|p| p.hours > 23 || p.minutes > 59) {
                    return Err(invalid("switchpoint time out of range"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Replace the payload; only the store calls this after validation.
    pub(crate) fn replace_payload(&mut self, payload: ValuePayload) {
        debug_assert_eq!(payload.value_type(), self.value_type);
        self.payload = payload;
    }

    pub(crate) fn set_pending(&mut self, payload: Option<ValuePayload>) {
        self.pending = payload;
    }
}
