//! Scene adapter: the engine's only view of the host's objects

use std::collections::BTreeMap;

use crate::state::{attribute, ObjectDeclaration, ObjectState};

/// Host-side object model as seen by the sync engine
pub trait SceneAdapter {
    /// Ids of every object currently taking part in synchronization
    fn list_synced_objects(&self) -> Vec<String>;

    /// Current attributes of one object, `None` if it no longer exists
    fn read_attributes(&self, id: &str) -> Option<ObjectState>;

    /// Overwrite the listed attributes of one object, leaving others untouched
    fn write_attributes(&mut self, id: &str, state: &ObjectState);
}

/// Plain in-memory scene, used by the CLI demo and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryScene {
    objects: BTreeMap<String, ObjectState>,
    writes: usize,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scene holding every declared object, attributes at their defaults
    pub fn from_declarations<'a>(declarations: impl IntoIterator<Item = &'a ObjectDeclaration>) -> Self {
        let mut scene = Self::new();
        for declaration in declarations {
            let object = scene
                .objects
                .entry(declaration.id.clone())
                .or_insert_with(|| ObjectState::new(declaration.id.clone(), declaration.kind));
            for name in &declaration.attributes {
                if object.get(name).is_none() {
                    object.set(name.clone(), attribute::default_value(name));
                }
            }
        }
        scene
    }

    /// Add or replace an object
    pub fn spawn(&mut self, state: ObjectState) {
        self.objects.insert(state.id.clone(), state);
    }

    pub fn despawn(&mut self, id: &str) -> Option<ObjectState> {
        self.objects.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&ObjectState> {
        self.objects.get(id)
    }

    /// Host-side mutation of one attribute. No-op for unknown objects.
    pub fn set(
        &mut self,
        id: &str,
        attribute: impl Into<String>,
        value: impl Into<crate::state::AttributeValue>,
    ) {
        if let Some(object) = self.objects.get_mut(id) {
            object.set(attribute, value);
        }
    }

    /// Number of `write_attributes` calls received from the engine
    pub fn write_count(&self) -> usize {
        self.writes
    }
}

impl SceneAdapter for MemoryScene {
    fn list_synced_objects(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    fn read_attributes(&self, id: &str) -> Option<ObjectState> {
        self.objects.get(id).cloned()
    }

    fn write_attributes(&mut self, id: &str, state: &ObjectState) {
        self.writes += 1;
        let object = self
            .objects
            .entry(id.to_string())
            .or_insert_with(|| ObjectState::new(id, state.kind));
        for (name, value) in &state.attributes {
            object.set(name.clone(), value.clone());
        }
    }
}
