//! Value store keyed by (node, command class, instance, index).

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::{Value, ValueError, ValueId, ValuePayload};

/// Result of applying a device report to a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreUpdate {
    Changed,
    Refreshed,
}

/// All values known to one driver.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: BTreeMap<ValueId, Value>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new value. Existing values are never replaced.
    pub fn add(&mut self, value: Value) -> Result<(), ValueError> {
        if self.values.contains_key(&value.id) {
            return Err(ValueError::AlreadyExists(value.id));
        }
        self.values.insert(value.id, value);
        Ok(())
    }

    pub fn contains(&self, id: &ValueId) -> bool {
        self.values.contains_key(id)
    }

    pub fn get(&self, id: &ValueId) -> Option<&Value> {
        self.values.get(id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.values()
    }

    pub fn node_values(&self, node_id: u8) -> impl Iterator<Item = &Value> {
        self.values
            .range(ValueId::new(node_id, 0, 0, 0)..=ValueId::new(node_id, u8::MAX, u8::MAX, u8::MAX))
            .map(|(_, value)| value)
    }

    /// Remove every value owned by `node_id`, returning the removed ids.
    pub fn remove_node(&mut self, node_id: u8) -> Vec<ValueId> {
        let ids: Vec<ValueId> = self.node_values(node_id).map(|v| v.id).collect();
        for id in &ids {
            self.values.remove(id);
        }
        ids
    }

    /// Check a write without touching the stored value.
    pub fn validate_set(&self, id: &ValueId, payload: &ValuePayload) -> Result<&Value, ValueError> {
        let value = self.values.get(id).ok_or(ValueError::UnknownValue(*id))?;
        if value.read_only {
            return Err(ValueError::ReadOnly(*id));
        }
        value.validate(payload)?;
        Ok(value)
    }

    /// Remember a write that has been sent but not confirmed.
    pub fn mark_pending(&mut self, id: &ValueId, payload: ValuePayload) {
        if let Some(value) = self.values.get_mut(id) {
            value.set_pending(Some(payload));
        }
    }

    /// Record the wire width the device reported.
    pub fn set_size(&mut self, id: &ValueId, size: u8) {
        if let Some(value) = self.values.get_mut(id) {
            value.size = Some(size);
        }
    }

    /// Forget a write the device never confirmed.
    pub fn clear_pending(&mut self, id: &ValueId) {
        if let Some(value) = self.values.get_mut(id) {
            value.set_pending(None);
        }
    }

    /// Confirm a pending write for values the device never reports
    /// (buttons, write-only values).
    pub fn confirm_pending(&mut self, id: &ValueId) -> Option<StoreUpdate> {
        let pending = self.values.get_mut(id)?.pending.take()?;
        self.apply_report(id, pending)
    }

    /// Apply a payload reported by the device.
    ///
    /// A payload of the wrong type is dropped: type tags never change.
    pub fn apply_report(&mut self, id: &ValueId, payload: ValuePayload) -> Option<StoreUpdate> {
        let value = self.values.get_mut(id)?;
        if payload.value_type() != value.value_type() {
            warn!(value = %id, expected = %value.value_type(), actual = %payload.value_type(), "Report type mismatch");
            return None;
        }

        // Reports carry only the selection; keep the known items.
        let payload = match (payload, value.payload()) {
            (ValuePayload::List(mut reported), ValuePayload::List(current)) if reported.items.is_empty() => {
                reported.items = current.items.clone();
                ValuePayload::List(reported)
            }
            (payload, _) => payload,
        };

        value.set_pending(None);
        if value.payload() == &payload {
            debug!(value = %id, "Value refreshed");
            Some(StoreUpdate::Refreshed)
        } else {
            debug!(value = %id, payload = %payload, "Value changed");
            value.replace_payload(payload);
            Some(StoreUpdate::Changed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ListItem, ValueGenre, ValueList, ValueType};

    fn switch_value(node: u8) -> Value {
        Value::new(ValueId::new(node, 0x25, 1, 0), ValueGenre::User, ValueType::Bool, "Switch")
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let mut store = ValueStore::new();
        store.add(switch_value(2)).unwrap();
        assert!(matches!(store.add(switch_value(2)), Err(ValueError::AlreadyExists(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalid_type_never_mutates() {
        let mut store = ValueStore::new();
        store.add(switch_value(2)).unwrap();
        let id = ValueId::new(2, 0x25, 1, 0);

        let err = store.validate_set(&id, &ValuePayload::Int(1)).unwrap_err();
        assert!(matches!(err, ValueError::InvalidType { .. }));
        assert_eq!(store.apply_report(&id, ValuePayload::Int(1)), None);

        let value = store.get(&id).unwrap();
        assert_eq!(value.payload(), &ValuePayload::Bool(false));
        assert_eq!(value.value_type(), ValueType::Bool);
    }

    #[test]
    fn test_changed_then_refreshed() {
        let mut store = ValueStore::new();
        store.add(switch_value(2)).unwrap();
        let id = ValueId::new(2, 0x25, 1, 0);
        assert_eq!(store.apply_report(&id, ValuePayload::Bool(true)), Some(StoreUpdate::Changed));
        assert_eq!(store.apply_report(&id, ValuePayload::Bool(true)), Some(StoreUpdate::Refreshed));
    }

    #[test]
    fn test_read_only_rejected() {
        let mut store = ValueStore::new();
        let id = ValueId::new(3, 0x80, 1, 0);
        store
            .add(Value::new(id, ValueGenre::User, ValueType::Byte, "Battery").read_only())
            .unwrap();
        assert!(matches!(
            store.validate_set(&id, &ValuePayload::Byte(5)),
            Err(ValueError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_pending_confirmation() {
        let mut store = ValueStore::new();
        let id = ValueId::new(3, 0x20, 1, 9);
        store
            .add(Value::new(id, ValueGenre::User, ValueType::Button, "Press").write_only())
            .unwrap();
        store.mark_pending(&id, ValuePayload::Button(true));
        assert_eq!(store.get(&id).unwrap().payload(), &ValuePayload::Button(false));
        assert_eq!(store.confirm_pending(&id), Some(StoreUpdate::Changed));
        assert_eq!(store.get(&id).unwrap().payload(), &ValuePayload::Button(true));
        assert_eq!(store.confirm_pending(&id), None);
    }

    #[test]
    fn test_list_report_keeps_items() {
        let mut store = ValueStore::new();
        let id = ValueId::new(4, 0x40, 1, 0);
        let items = vec![
            ListItem { label: "Off".into(), value: 0 },
            ListItem { label: "Heat".into(), value: 1 },
        ];
        store
            .add(
                Value::new(id, ValueGenre::User, ValueType::List, "Mode")
                    .with_payload(ValuePayload::List(ValueList { items: items.clone(), selected: 0 })),
            )
            .unwrap();
        let reported = ValuePayload::List(ValueList { items: vec![], selected: 1 });
        assert_eq!(store.apply_report(&id, reported), Some(StoreUpdate::Changed));
        assert_eq!(store.get(&id).unwrap().payload().to_string(), "Heat");
    }

    #[test]
    fn test_remove_node_only_touches_that_node() {
        let mut store = ValueStore::new();
        store.add(switch_value(2)).unwrap();
        store.add(switch_value(3)).unwrap();
        assert_eq!(store.remove_node(2), vec![ValueId::new(2, 0x25, 1, 0)]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.node_values(3).count(), 1);
    }
}
