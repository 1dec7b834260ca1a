//! Per-object attribute cache with local/remote provenance.
//!
//! Conflict rule: an attribute written locally since the last successful
//! exchange (i.e. present in the dirty set) is never overwritten by a remote
//! value. Remote values that lose are still recorded as `last_remote`.

use std::collections::{BTreeMap, BTreeSet};

use super::object::{AttributeValue, ObjectKind, ObjectState};
use crate::error::CacheError;

/// Where the effective value of an attribute came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
struct AttributeEntry {
    value: AttributeValue,
    origin: Origin,
    last_remote: Option<AttributeValue>,
}

#[derive(Debug, Clone)]
struct CachedObject {
    kind: ObjectKind,
    attributes: BTreeMap<String, AttributeEntry>,
}

/// One (object, attribute, value) triple received from the server
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUpdate {
    pub object: String,
    pub attribute: String,
    pub value: AttributeValue,
}

/// Ordered set of remote updates received in one exchange
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteBatch {
    updates: Vec<RemoteUpdate>,
}

impl RemoteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten decoded object states into triples, preserving wire order
    pub fn from_states(states: Vec<ObjectState>) -> Self {
        let mut batch = Self::new();
        for state in states {
            for (attribute, value) in state.attributes {
                batch.push(state.id.clone(), attribute, value);
            }
        }
        batch
    }

    pub fn push(
        &mut self,
        object: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) {
        self.updates.push(RemoteUpdate {
            object: object.into(),
            attribute: attribute.into(),
            value: value.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteUpdate> {
        self.updates.iter()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Latest known attribute values of every synchronized object
#[derive(Debug, Default)]
pub struct StateCache {
    objects: BTreeMap<String, CachedObject>,
    dirty: BTreeMap<String, BTreeSet<String>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an object. Returns false if it was already registered.
    pub fn register(&mut self, id: impl Into<String>, kind: ObjectKind) -> bool {
        let id = id.into();
        if self.objects.contains_key(&id) {
            return false;
        }
        self.objects.insert(
            id,
            CachedObject {
                kind,
                attributes: BTreeMap::new(),
            },
        );
        true
    }

    /// Stop tracking an object, dropping its pending local writes
    pub fn unregister(&mut self, id: &str) -> Option<ObjectState> {
        self.dirty.remove(id);
        let object = self.objects.remove(id)?;
        Some(to_state(id, &object))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Record a local write and mark the attribute dirty
    pub fn set_local(
        &mut self,
        id: &str,
        attribute: impl Into<String>,
        value: AttributeValue,
    ) -> Result<(), CacheError> {
        let object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| CacheError::UnknownObject(id.to_string()))?;
        let attribute = attribute.into();

        match object.attributes.get_mut(&attribute) {
            Some(entry) => {
                entry.value = value;
                entry.origin = Origin::Local;
            }
            None => {
                object.attributes.insert(
                    attribute.clone(),
                    AttributeEntry {
                        value,
                        origin: Origin::Local,
                        last_remote: None,
                    },
                );
            }
        }

        self.dirty.entry(id.to_string()).or_default().insert(attribute);
        Ok(())
    }

    /// Diff a scene read against the cache; changed attributes become local writes.
    /// Returns the number of attributes marked dirty.
    pub fn observe_local(&mut self, state: &ObjectState) -> Result<usize, CacheError> {
        let object = self
            .objects
            .get(&state.id)
            .ok_or_else(|| CacheError::UnknownObject(state.id.clone()))?;

        let changed: Vec<(String, AttributeValue)> = state
            .attributes
            .iter()
            .filter(|(name, value)| {
                object
                    .attributes
                    .get(name.as_str())
                    .map_or(true, |entry| &entry.value != *value)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let count = changed.len();
        for (name, value) in changed {
            self.set_local(&state.id, name, value)?;
        }
        Ok(count)
    }

    /// Apply a remote batch as a whole. Nothing is applied if any update names an
    /// unregistered object. Returns the values that took effect, grouped per object.
    pub fn apply_remote(&mut self, batch: &RemoteBatch) -> Result<Vec<ObjectState>, CacheError> {
        if let Some(unknown) = batch.iter().find(|u| !self.objects.contains_key(&u.object)) {
            return Err(CacheError::UnknownObject(unknown.object.clone()));
        }

        let mut applied: BTreeMap<String, ObjectState> = BTreeMap::new();

        for update in batch.iter() {
            let shadowed = self.is_dirty(&update.object, &update.attribute);
            let Some(object) = self.objects.get_mut(&update.object) else {
                continue;
            };

            let entry = object
                .attributes
                .entry(update.attribute.clone())
                .or_insert_with(|| AttributeEntry {
                    value: update.value.clone(),
                    origin: Origin::Remote,
                    last_remote: None,
                });
            entry.last_remote = Some(update.value.clone());

            if shadowed {
                continue;
            }

            entry.value = update.value.clone();
            entry.origin = Origin::Remote;

            applied
                .entry(update.object.clone())
                .or_insert_with(|| ObjectState::new(update.object.clone(), object.kind))
                .set(update.attribute.clone(), update.value.clone());
        }

        Ok(applied.into_values().collect())
    }

    /// Pending local writes, one state per dirty object. Does not clear the set.
    pub fn snapshot_dirty(&self) -> Vec<ObjectState> {
        self.dirty
            .iter()
            .filter_map(|(id, names)| {
                let object = self.objects.get(id)?;
                let mut state = ObjectState::new(id.clone(), object.kind);
                for name in names {
                    if let Some(entry) = object.attributes.get(name) {
                        state.set(name.clone(), entry.value.clone());
                    }
                }
                (!state.is_empty()).then_some(state)
            })
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub fn is_dirty(&self, id: &str, attribute: &str) -> bool {
        self.dirty
            .get(id)
            .is_some_and(|names| names.contains(attribute))
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.values().map(BTreeSet::len).sum()
    }

    pub fn get(&self, id: &str, attribute: &str) -> Option<&AttributeValue> {
        self.objects
            .get(id)?
            .attributes
            .get(attribute)
            .map(|entry| &entry.value)
    }

    pub fn origin(&self, id: &str, attribute: &str) -> Option<Origin> {
        self.objects
            .get(id)?
            .attributes
            .get(attribute)
            .map(|entry| entry.origin)
    }

    /// Last value the server sent for this attribute, even if a local write won
    pub fn last_remote(&self, id: &str, attribute: &str) -> Option<&AttributeValue> {
        self.objects
            .get(id)?
            .attributes
            .get(attribute)?
            .last_remote
            .as_ref()
    }

    /// Effective values of one object
    pub fn object(&self, id: &str) -> Option<ObjectState> {
        self.objects.get(id).map(|object| to_state(id, object))
    }
}

fn to_state(id: &str, object: &CachedObject) -> ObjectState {
    let mut state = ObjectState::new(id, object.kind);
    for (name, entry) in &object.attributes {
        state.set(name.clone(), entry.value.clone());
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(ids: &[&str]) -> StateCache {
        let mut cache = StateCache::new();
        for id in ids {
            cache.register(*id, ObjectKind::RigidBody);
        }
        cache
    }

    #[test]
    fn test_set_local_marks_dirty() {
        let mut cache = cache_with(&["robot1"]);
        cache
            .set_local("robot1", "position", AttributeValue::Vector3([1.0, 0.0, 0.0]))
            .unwrap();

        assert!(cache.is_dirty("robot1", "position"));
        let snapshot = cache.snapshot_dirty();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot[0].get("position"),
            Some(&AttributeValue::Vector3([1.0, 0.0, 0.0]))
        );

        // Snapshot does not clear
        assert_eq!(cache.dirty_count(), 1);
        cache.clear_dirty();
        assert!(cache.snapshot_dirty().is_empty());
    }

    #[test]
    fn test_set_local_unknown_object() {
        let mut cache = StateCache::new();
        let err = cache
            .set_local("ghost", "position", AttributeValue::Vector3([0.0; 3]))
            .unwrap_err();
        assert_eq!(err, CacheError::UnknownObject("ghost".into()));
    }

    #[test]
    fn test_observe_local_only_marks_changes() {
        let mut cache = cache_with(&["cup"]);
        let state = ObjectState::new("cup", ObjectKind::RigidBody)
            .with("position", [0.0, 0.0, 0.0])
            .with("quaternion", [1.0, 0.0, 0.0, 0.0]);

        assert_eq!(cache.observe_local(&state).unwrap(), 2);
        cache.clear_dirty();
        assert_eq!(cache.observe_local(&state).unwrap(), 0);

        let moved = state.clone().with("position", [0.5, 0.0, 0.0]);
        assert_eq!(cache.observe_local(&moved).unwrap(), 1);
        assert!(cache.is_dirty("cup", "position"));
        assert!(!cache.is_dirty("cup", "quaternion"));
    }

    #[test]
    fn test_local_write_wins_within_tick() {
        let mut batch = RemoteBatch::new();
        batch.push("robot1", "position", [9.0, 9.0, 9.0]);

        // Local first, then remote
        let mut a = cache_with(&["robot1"]);
        a.set_local("robot1", "position", [1.0, 0.0, 0.0].into()).unwrap();
        let applied = a.apply_remote(&batch).unwrap();
        assert!(applied.is_empty());

        // Remote first, then local
        let mut b = cache_with(&["robot1"]);
        b.apply_remote(&batch).unwrap();
        b.set_local("robot1", "position", [1.0, 0.0, 0.0].into()).unwrap();

        for cache in [&a, &b] {
            assert_eq!(
                cache.get("robot1", "position"),
                Some(&AttributeValue::Vector3([1.0, 0.0, 0.0]))
            );
            assert_eq!(cache.origin("robot1", "position"), Some(Origin::Local));
        }
        assert_eq!(
            a.last_remote("robot1", "position"),
            Some(&AttributeValue::Vector3([9.0, 9.0, 9.0]))
        );
    }

    #[test]
    fn test_remote_wins_after_dirty_cleared() {
        let mut cache = cache_with(&["robot1"]);
        cache.set_local("robot1", "position", [1.0, 0.0, 0.0].into()).unwrap();
        cache.clear_dirty();

        let mut batch = RemoteBatch::new();
        batch.push("robot1", "position", [2.0, 0.0, 0.0]);
        let applied = cache.apply_remote(&batch).unwrap();

        assert_eq!(applied.len(), 1);
        assert_eq!(cache.origin("robot1", "position"), Some(Origin::Remote));
    }

    #[test]
    fn test_apply_remote_is_all_or_nothing() {
        let mut cache = cache_with(&["robot1"]);
        let mut batch = RemoteBatch::new();
        batch.push("robot1", "joint1", 0.5);
        batch.push("unknown", "joint2", 0.7);

        let err = cache.apply_remote(&batch).unwrap_err();
        assert_eq!(err, CacheError::UnknownObject("unknown".into()));
        assert_eq!(cache.get("robot1", "joint1"), None);
    }

    #[test]
    fn test_batch_order_is_respected() {
        let mut cache = cache_with(&["arm"]);
        let mut batch = RemoteBatch::new();
        batch.push("arm", "joint_rvalue", 0.1);
        batch.push("arm", "joint_rvalue", 0.2);

        let applied = cache.apply_remote(&batch).unwrap();
        assert_eq!(applied[0].get("joint_rvalue"), Some(&AttributeValue::Scalar(0.2)));
    }

    #[test]
    fn test_unregister_drops_dirty_entries() {
        let mut cache = cache_with(&["robot1"]);
        cache.set_local("robot1", "position", [1.0, 0.0, 0.0].into()).unwrap();

        let removed = cache.unregister("robot1").unwrap();
        assert_eq!(removed.attributes.len(), 1);
        assert_eq!(cache.dirty_count(), 0);
        assert!(!cache.contains("robot1"));
    }
}
