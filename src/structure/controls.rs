//! Control materialization
//!
//! The structure description names a type for every control. A registry maps
//! those type strings to constructors; unknown types fall back to a generic
//! control that just records its latest states. This keeps the device model
//! extensible without any reflection.

use std::any::Any;
use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::client::message::{TextState, ValueState};
use crate::structure::{ControlRecord, StructureFile};
use crate::uuid::Uuid;

/// Behavior of one control kind, fed by decoded state updates.
pub trait ControlBehavior: Send + Sync {
    /// A value state arrived for the named state channel.
    fn on_value_state(&mut self, state_name: &str, state: &ValueState) {
        let _ = (state_name, state);
    }

    /// A text state arrived for the named state channel.
    fn on_text_state(&mut self, state_name: &str, state: &TextState) {
        let _ = (state_name, state);
    }

    /// Downcast hook for callers that know the concrete kind.
    fn as_any(&self) -> &dyn Any;
}

type Constructor = fn() -> Box<dyn ControlBehavior>;

fn make_switch() -> Box<dyn ControlBehavior> {
    Box::<Switch>::default()
}

fn make_generic() -> Box<dyn ControlBehavior> {
    Box::<GenericControl>::default()
}

static REGISTRY: Lazy<HashMap<&'static str, Constructor>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, Constructor> = HashMap::new();
    registry.insert("Switch", make_switch);
    registry
});

/// A control materialized from the structure description.
pub struct Control {
    uuid: Uuid,
    record: ControlRecord,
    room_name: Option<String>,
    category_name: Option<String>,
    behavior: Box<dyn ControlBehavior>,
}

impl Control {
    pub(crate) fn from_structure(uuid: Uuid, record: ControlRecord, file: &StructureFile) -> Self {
        let constructor = REGISTRY
            .get(record.control_type.as_str())
            .copied()
            .unwrap_or(make_generic);
        let room_name = record
            .room
            .and_then(|room| file.room_name(room))
            .map(str::to_string);
        let category_name = record
            .cat
            .and_then(|cat| file.category_name(cat))
            .map(str::to_string);

        Self {
            uuid,
            record,
            room_name,
            category_name,
            behavior: constructor(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn control_type(&self) -> &str {
        &self.record.control_type
    }

    pub fn is_secured(&self) -> bool {
        self.record.is_secured
    }

    pub fn room_name(&self) -> Option<&str> {
        self.room_name.as_deref()
    }

    pub fn category_name(&self) -> Option<&str> {
        self.category_name.as_deref()
    }

    /// Identifier of the named state channel.
    pub fn state_uuid(&self, name: &str) -> Option<Uuid> {
        self.record.states.get(name).copied()
    }

    /// All state identifiers this control listens on.
    pub fn state_uuids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.record.states.values().copied()
    }

    /// The control's behavior, for kind-specific downcasts.
    pub fn behavior(&self) -> &dyn ControlBehavior {
        self.behavior.as_ref()
    }

    /// Convenience downcast to [`Switch`].
    pub fn as_switch(&self) -> Option<&Switch> {
        self.behavior.as_any().downcast_ref()
    }

    /// Route a value state to the behavior. Returns false when the
    /// identifier belongs to no state channel of this control.
    pub(crate) fn apply_value_state(&mut self, state: &ValueState) -> bool {
        let name = self
            .record
            .states
            .iter()
            .find(|(_, uuid)| **uuid == state.control)
            .map(|(name, _)| name.clone());
        match name {
            Some(name) => {
                self.behavior.on_value_state(&name, state);
                true
            }
            None => false,
        }
    }

    /// Route a text state to the behavior.
    pub(crate) fn apply_text_state(&mut self, state: &TextState) -> bool {
        let name = self
            .record
            .states
            .iter()
            .find(|(_, uuid)| **uuid == state.control)
            .map(|(name, _)| name.clone());
        match name {
            Some(name) => {
                self.behavior.on_text_state(&name, state);
                true
            }
            None => false,
        }
    }
}

/// An on/off control.
#[derive(Debug, Default)]
pub struct Switch {
    active: Option<bool>,
}

impl Switch {
    /// Command turning the switch on.
    pub const CMD_ON: &'static str = "on";
    /// Command turning the switch off.
    pub const CMD_OFF: &'static str = "off";

    /// Current state; `None` until the first update arrives.
    pub fn active(&self) -> Option<bool> {
        self.active
    }
}

impl ControlBehavior for Switch {
    fn on_value_state(&mut self, state_name: &str, state: &ValueState) {
        if state_name == "active" {
            self.active = Some(state.value != 0.0);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Fallback for control types without a dedicated implementation; keeps the
/// latest value and text per state channel.
#[derive(Debug, Default)]
pub struct GenericControl {
    values: HashMap<String, f64>,
    texts: HashMap<String, String>,
}

impl GenericControl {
    pub fn last_value(&self, state_name: &str) -> Option<f64> {
        self.values.get(state_name).copied()
    }

    pub fn last_text(&self, state_name: &str) -> Option<&str> {
        self.texts.get(state_name).map(String::as_str)
    }
}

impl ControlBehavior for GenericControl {
    fn on_value_state(&mut self, state_name: &str, state: &ValueState) {
        self.values.insert(state_name.to_string(), state.value);
    }

    fn on_text_state(&mut self, state_name: &str, state: &TextState) {
        self.texts.insert(state_name.to_string(), state.text.clone());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
