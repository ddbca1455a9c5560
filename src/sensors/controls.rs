//! Per-sensor control registry with dirty-change tracking.
//!
//! Values change only through [`ControlRegistry::set`], which marks the
//! control's group key dirty when the value differs. Pseudo-controls (no id)
//! are never published; they share a sibling's group key so a change to them
//! re-publishes the sibling. A duplicate id replaces the earlier control in
//! the id index and group list; writes through the stale handle are stored
//! but never mark a group dirty.

use crate::ndsi::{ControlChanges, ControlEnumOption, ControlValue, ValueType};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

pub type Getter<C> = Box<dyn Fn(&C, &ControlValue) -> ControlChanges + Send + Sync>;
pub type Setter<C> = Box<dyn Fn(&C, ControlValue) + Send + Sync>;
pub type IntSetter<C> = Box<dyn Fn(&C, i64) + Send + Sync>;
pub type BoolSetter<C> = Box<dyn Fn(&C, bool) + Send + Sync>;

/// Index of a registered control, used for typed reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlHandle(usize);

/// A control's current state, ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlUpdate {
    pub control_id: String,
    pub changes: ControlChanges,
}

/// Limits advertised by an integer control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub min: i64,
    pub max: i64,
    pub res: i64,
}

impl IntRange {
    pub const fn new(min: i64, max: i64, res: i64) -> Self {
        Self { min, max, res }
    }
}

impl Default for IntRange {
    fn default() -> Self {
        Self::new(0, 0, 1)
    }
}

struct Control<C> {
    id: Option<String>,
    value_type: ValueType,
    group_key: String,
    getter: Option<Getter<C>>,
    setter: Option<Setter<C>>,
    replaced: bool,
}

pub struct ControlRegistry<C> {
    controls: Vec<Control<C>>,
    values: Mutex<Vec<ControlValue>>,
    by_id: HashMap<String, ControlHandle>,
    by_group: HashMap<String, Vec<ControlHandle>>,
    dirty: Mutex<BTreeSet<String>>,
}

impl<C: 'static> Default for ControlRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> ControlRegistry<C> {
    pub fn new() -> Self {
        Self {
            controls: Vec::new(),
            values: Mutex::new(Vec::new()),
            by_id: HashMap::new(),
            by_group: HashMap::new(),
            dirty: Mutex::new(BTreeSet::new()),
        }
    }

    /// Register a control. `group_key` defaults to `id`; a pseudo-control
    /// (`id == None`) must name the group of the control it refreshes.
    pub fn register_control(
        &mut self,
        id: Option<&str>,
        getter: Option<Getter<C>>,
        setter: Option<Setter<C>>,
        initial: impl Into<ControlValue>,
        group_key: Option<&str>,
    ) -> ControlHandle {
        let handle = ControlHandle(self.controls.len());
        let initial = initial.into();

        let group_key = match (group_key, id) {
            (Some(key), _) | (None, Some(key)) => key.to_string(),
            (None, None) => {
                warn!(
                    "Pseudo-control #{} registered without a group key; it will never publish",
                    handle.0
                );
                format!("#{}", handle.0)
            }
        };

        if let Some(id) = id {
            if let Some(previous) = self.by_id.insert(id.to_string(), handle) {
                warn!("There's already a control registered with id={}!", id);
                let replaced = &mut self.controls[previous.0];
                replaced.replaced = true;
                let previous_group = replaced.group_key.clone();
                if let Some(list) = self.by_group.get_mut(&previous_group) {
                    list.retain(|h| *h != previous);
                }
            }
            self.by_group
                .entry(group_key.clone())
                .or_default()
                .push(handle);
        }

        self.controls.push(Control {
            id: id.map(str::to_string),
            value_type: initial.value_type(),
            group_key,
            getter,
            setter,
            replaced: false,
        });
        self.values.get_mut().push(initial);

        handle
    }

    /// Register a value-only control that re-publishes `group_key` when it changes.
    pub fn register_pseudo_control(
        &mut self,
        group_key: &str,
        initial: impl Into<ControlValue>,
    ) -> ControlHandle {
        self.register_control(None, None, None, initial, Some(group_key))
    }

    /// Integer control; without a setter it is advertised read-only.
    pub fn register_int_control(
        &mut self,
        id: &str,
        caption: &str,
        default: i64,
        range: IntRange,
        setter: Option<IntSetter<C>>,
    ) -> ControlHandle {
        let caption = caption.to_string();
        let readonly = setter.is_none();
        let getter: Getter<C> = Box::new(move |_, value| ControlChanges {
            value: Some(value.clone()),
            min: Some(range.min),
            max: Some(range.max),
            resolution: Some(range.res),
            default: Some(ControlValue::Int(default)),
            dtype: Some(ValueType::Integer.to_string()),
            caption: Some(caption.clone()),
            readonly: readonly.then_some(true),
            map: None,
        });
        let setter = setter.map(|setter| -> Setter<C> {
            Box::new(move |ctx, value| {
                if let Some(v) = value.as_int() {
                    setter(ctx, v);
                }
            })
        });

        self.register_control(Some(id), Some(getter), setter, default, None)
    }

    pub fn register_bool_control(
        &mut self,
        id: &str,
        caption: &str,
        default: bool,
        setter: BoolSetter<C>,
    ) -> ControlHandle {
        let caption = caption.to_string();
        let getter: Getter<C> = Box::new(move |_, value| ControlChanges {
            value: Some(value.clone()),
            default: Some(ControlValue::Bool(default)),
            dtype: Some(ValueType::Boolean.to_string()),
            caption: Some(caption.clone()),
            ..Default::default()
        });
        let setter: Setter<C> = Box::new(move |ctx, value| {
            if let Some(v) = value.as_bool() {
                setter(ctx, v);
            }
        });

        self.register_control(Some(id), Some(getter), Some(setter), default, None)
    }

    /// Enumerated choice over `values`; the control value is the selected index.
    /// Out-of-range indices are rejected before `setter` runs.
    pub fn register_string_map_control(
        &mut self,
        id: &str,
        caption: &str,
        default: i64,
        values: Vec<String>,
        setter: IntSetter<C>,
    ) -> ControlHandle {
        let caption = caption.to_string();
        let options: Vec<ControlEnumOption> = values
            .iter()
            .enumerate()
            .map(|(idx, label)| ControlEnumOption {
                idx: idx as i64,
                label: label.clone(),
            })
            .collect();
        let count = values.len() as i64;
        let control_id = id.to_string();

        let getter: Getter<C> = Box::new(move |_, value| ControlChanges {
            value: Some(value.clone()),
            default: Some(ControlValue::Int(default)),
            caption: Some(caption.clone()),
            map: Some(options.clone()),
            ..Default::default()
        });
        let setter: Setter<C> = Box::new(move |ctx, value| {
            let Some(index) = value.as_int() else {
                return;
            };
            if index < 0 || index >= count {
                warn!(
                    "Attempted to set an invalid index '{}' on control {}",
                    index, control_id
                );
                return;
            }
            setter(ctx, index);
        });

        self.register_control(Some(id), Some(getter), Some(setter), default, None)
    }

    pub fn handle(&self, id: &str) -> Option<ControlHandle> {
        self.by_id.get(id).copied()
    }

    pub fn get(&self, handle: ControlHandle) -> ControlValue {
        self.values.lock()[handle.0].clone()
    }

    pub fn get_int(&self, handle: ControlHandle) -> i64 {
        self.values.lock()[handle.0].as_int().unwrap_or_default()
    }

    pub fn get_bool(&self, handle: ControlHandle) -> bool {
        self.values.lock()[handle.0].as_bool().unwrap_or_default()
    }

    /// Store a new value, marking the control's group dirty if it changed.
    /// Returns whether the value changed.
    pub fn set(&self, handle: ControlHandle, value: impl Into<ControlValue>) -> bool {
        let value = value.into();
        let control = &self.controls[handle.0];
        if value.value_type() != control.value_type {
            warn!(
                "Ignoring {} value for {} control {:?}",
                value.value_type(),
                control.value_type,
                control.id.as_deref().unwrap_or(&control.group_key)
            );
            return false;
        }

        let changed = {
            let mut values = self.values.lock();
            if values[handle.0] == value {
                false
            } else {
                values[handle.0] = value;
                true
            }
        };
        if changed && !control.replaced {
            self.dirty.lock().insert(control.group_key.clone());
        }
        changed
    }

    /// Store several values as one refresh, then mark every changed group.
    pub fn set_all<I, V>(&self, updates: I)
    where
        I: IntoIterator<Item = (ControlHandle, V)>,
        V: Into<ControlValue>,
    {
        let mut changed_groups = Vec::new();
        {
            let mut values = self.values.lock();
            for (handle, value) in updates {
                let value = value.into();
                let control = &self.controls[handle.0];
                if value.value_type() != control.value_type {
                    warn!(
                        "Ignoring {} value for {} control in refresh",
                        value.value_type(),
                        control.value_type
                    );
                    continue;
                }
                if values[handle.0] != value {
                    values[handle.0] = value;
                    if !control.replaced {
                        changed_groups.push(control.group_key.clone());
                    }
                }
            }
        }
        if !changed_groups.is_empty() {
            self.dirty.lock().extend(changed_groups);
        }
    }

    /// Force a group to be published next cycle even if no value changed.
    pub fn mark_dirty(&self, group_key: &str) {
        self.dirty.lock().insert(group_key.to_string());
    }

    pub fn is_dirty(&self, group_key: &str) -> bool {
        self.dirty.lock().contains(group_key)
    }

    /// Current state of one control, `None` for pseudo-controls and controls
    /// without a getter.
    pub fn control_state(&self, ctx: &C, handle: ControlHandle) -> Option<ControlUpdate> {
        let control = &self.controls[handle.0];
        let id = control.id.as_ref()?;
        let Some(getter) = control.getter.as_ref() else {
            debug!("Control {} has no getter, nothing to publish", id);
            return None;
        };
        let value = self.get(handle);
        Some(ControlUpdate {
            control_id: id.clone(),
            changes: getter(ctx, &value),
        })
    }

    /// Apply a client write. Unknown ids, mismatched types and read-only
    /// controls are logged and ignored. On success the setter runs and the
    /// control's fresh state is returned for immediate publication.
    pub fn set_control_value(
        &self,
        ctx: &C,
        control_id: &str,
        value: ControlValue,
    ) -> Option<ControlUpdate> {
        let Some(handle) = self.handle(control_id) else {
            warn!(
                "Tried to set value on unknown control! control={} value={:?}",
                control_id, value
            );
            return None;
        };
        let control = &self.controls[handle.0];

        if value.value_type() != control.value_type {
            warn!(
                "Control {} expects {} but got {:?}",
                control_id, control.value_type, value
            );
            return None;
        }
        let Some(setter) = control.setter.as_ref() else {
            warn!("Control {} is read-only, ignoring {:?}", control_id, value);
            return None;
        };

        setter(ctx, value);

        // The state published below already reflects the setter's changes.
        let group = &control.group_key;
        if self.by_group.get(group).is_some_and(|list| list.len() == 1) {
            self.dirty.lock().remove(group);
        }
        self.control_state(ctx, handle)
    }

    /// State of every addressable control, in registration order.
    pub fn refresh_controls(&self, ctx: &C) -> Vec<ControlUpdate> {
        self.controls
            .iter()
            .enumerate()
            .filter(|(index, control)| {
                control
                    .id
                    .as_ref()
                    .is_some_and(|id| self.by_id.get(id) == Some(&ControlHandle(*index)))
            })
            .filter_map(|(index, _)| self.control_state(ctx, ControlHandle(index)))
            .collect()
    }

    /// Drain the dirty set and return the state of every control in each
    /// drained group. Marks made after the drain stay for the next call.
    pub fn take_updated_controls(&self, ctx: &C) -> Vec<ControlUpdate> {
        let drained = std::mem::take(&mut *self.dirty.lock());

        drained
            .iter()
            .filter_map(|key| self.by_group.get(key))
            .flatten()
            .filter_map(|handle| self.control_state(ctx, *handle))
            .collect()
    }
}
