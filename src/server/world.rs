//! Shared world of the reference server.
//!
//! Holds the authoritative value of every attribute any client published, and
//! remembers which client owns each published (object, attribute) pair. A pair
//! has at most one publisher at a time.
//!
//! Ownership is also tagged with the connection that claimed it, so a client
//! that reconnects before its old socket is torn down keeps what the new
//! connection claimed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::codec::ApiCall;
use crate::state::{attribute, AttributeValue, ObjectDeclaration, ObjectKind, ObjectState};

/// Token identifying one client connection
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Publisher {
    client: Uuid,
    connection: ConnectionId,
}

pub struct World {
    objects: DashMap<String, ObjectState>,
    publishers: DashMap<(String, String), Publisher>,
    next_connection: AtomicU64,
    started: Instant,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            publishers: DashMap::new(),
            next_connection: AtomicU64::new(1),
            started: Instant::now(),
        }
    }

    /// Seconds since the world was created
    pub fn sim_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Fresh token for a newly accepted connection
    pub fn open_connection(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Take ownership of the declared pairs on behalf of `connection`. Pairs
    /// owned by another client are left out of the returned declarations;
    /// pairs the same client holds through an older connection move over.
    pub fn claim(
        &self,
        client: Uuid,
        connection: ConnectionId,
        declarations: &[ObjectDeclaration],
    ) -> Vec<ObjectDeclaration> {
        let publisher = Publisher { client, connection };
        let mut accepted = Vec::with_capacity(declarations.len());

        for declaration in declarations {
            let mut granted = Vec::new();
            for name in &declaration.attributes {
                match self.publishers.entry((declaration.id.clone(), name.clone())) {
                    Entry::Occupied(owner) if owner.get().client != client => {
                        debug!(
                            object = %declaration.id,
                            attribute = %name,
                            owner = %owner.get().client,
                            "Refusing already published attribute"
                        );
                    }
                    Entry::Occupied(mut owner) => {
                        owner.insert(publisher);
                        granted.push(name.clone());
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(publisher);
                        granted.push(name.clone());
                    }
                }
            }

            if !granted.is_empty() {
                accepted.push(ObjectDeclaration::new(
                    declaration.id.clone(),
                    declaration.kind,
                    granted,
                ));
            }
        }

        accepted
    }

    /// Drop every pair claimed through `connection`. Pairs its client has
    /// since claimed again on a newer connection are kept. Values stay in the
    /// world.
    pub fn release(&self, connection: ConnectionId) {
        self.publishers.retain(|_, owner| owner.connection != connection);
    }

    /// Drop every pair `client` publishes, whichever connection claimed it
    pub fn release_client(&self, client: Uuid) {
        self.publishers.retain(|_, owner| owner.client != client);
    }

    /// Store values `client` is allowed to publish. Returns how many were stored.
    pub fn apply(&self, client: Uuid, states: &[ObjectState]) -> usize {
        let mut stored = 0;

        for state in states {
            for (name, value) in &state.attributes {
                let owned = self
                    .publishers
                    .get(&(state.id.clone(), name.clone()))
                    .is_some_and(|owner| owner.client == client);
                if !owned || attribute::check(name, value).is_err() {
                    debug!(object = %state.id, attribute = %name, "Ignoring attribute");
                    continue;
                }
                self.set(&state.id, state.kind, name.clone(), value.clone());
                stored += 1;
            }
        }

        stored
    }

    /// Server-side write, bypassing publisher ownership
    pub fn set(
        &self,
        id: &str,
        kind: ObjectKind,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) {
        self.objects
            .entry(id.to_string())
            .or_insert_with(|| ObjectState::new(id, kind))
            .set(name, value);
    }

    pub fn get(&self, id: &str) -> Option<ObjectState> {
        self.objects.get(id).map(|state| state.value().clone())
    }

    /// Current values of the declared pairs; pairs nobody wrote yet are omitted
    pub fn read(&self, declarations: &[ObjectDeclaration]) -> Vec<ObjectState> {
        declarations
            .iter()
            .filter_map(|declaration| {
                let object = self.objects.get(&declaration.id)?;
                let mut state = ObjectState::new(declaration.id.clone(), declaration.kind);
                for name in &declaration.attributes {
                    if let Some(value) = object.get(name) {
                        state.set(name.clone(), value.clone());
                    }
                }
                (!state.is_empty()).then_some(state)
            })
            .collect()
    }

    pub fn owner(&self, id: &str, attribute: &str) -> Option<Uuid> {
        self.publishers
            .get(&(id.to_string(), attribute.to_string()))
            .map(|owner| owner.client)
    }

    /// Built-in simulation API. Unknown calls answer `not_found`.
    pub fn call(&self, call: &ApiCall) -> ApiCall {
        let result = match call.name.as_str() {
            "echo" => call.arguments.clone(),
            "get_sim_time" => vec![self.sim_time().to_string()],
            _ => vec!["not_found".to_string()],
        };
        ApiCall {
            simulation: call.simulation.clone(),
            name: call.name.clone(),
            arguments: result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(id: &str, attributes: &[&str]) -> ObjectDeclaration {
        ObjectDeclaration::new(id, ObjectKind::RigidBody, attributes.iter().copied())
    }

    #[test]
    fn test_one_publisher_per_attribute() {
        let world = World::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (conn_a, conn_b) = (world.open_connection(), world.open_connection());

        assert_eq!(world.claim(a, conn_a, &[decl("cup", &["position"])]).len(), 1);
        let granted = world.claim(b, conn_b, &[decl("cup", &["position", "quaternion"])]);
        assert_eq!(granted, vec![decl("cup", &["quaternion"])]);

        world.release(conn_a);
        assert_eq!(world.owner("cup", "position"), None);
        assert_eq!(world.owner("cup", "quaternion"), Some(b));
    }

    #[test]
    fn test_stale_connection_release_keeps_reclaimed_pairs() {
        let world = World::new();
        let (client, other) = (Uuid::new_v4(), Uuid::new_v4());
        let (old, new) = (world.open_connection(), world.open_connection());
        assert_ne!(old, new);

        world.claim(client, old, &[decl("cup", &["position", "quaternion"])]);
        world.release_client(client);
        world.claim(client, new, &[decl("cup", &["position"])]);

        // The old socket is only torn down now
        world.release(old);
        assert_eq!(world.owner("cup", "position"), Some(client));
        assert!(world.claim(other, world.open_connection(), &[decl("cup", &["position"])]).is_empty());

        world.release(new);
        assert_eq!(world.owner("cup", "position"), None);
    }

    #[test]
    fn test_reclaim_moves_pairs_to_the_newer_connection() {
        let world = World::new();
        let client = Uuid::new_v4();
        let (old, new) = (world.open_connection(), world.open_connection());

        world.claim(client, old, &[decl("cup", &["position"])]);
        assert_eq!(world.claim(client, new, &[decl("cup", &["position"])]).len(), 1);

        world.release(old);
        assert_eq!(world.owner("cup", "position"), Some(client));
    }

    #[test]
    fn test_apply_only_owned_and_typed_values() {
        let world = World::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        world.claim(a, world.open_connection(), &[decl("cup", &["position"])]);

        let states =
            [ObjectState::new("cup", ObjectKind::RigidBody).with("position", [1.0, 2.0, 3.0])];
        assert_eq!(world.apply(b, &states), 0);
        assert_eq!(world.apply(a, &states), 1);

        let wrong = [ObjectState::new("cup", ObjectKind::RigidBody).with("position", 1.0)];
        assert_eq!(world.apply(a, &wrong), 0);

        let read = world.read(&[decl("cup", &["position", "quaternion"])]);
        assert_eq!(read, states.to_vec());
        assert!(world.read(&[decl("ghost", &["position"])]).is_empty());
    }

    #[test]
    fn test_builtin_calls() {
        let world = World::new();
        let echo = world.call(&ApiCall::new("sim", "echo", ["a", "b"]));
        assert_eq!(echo.arguments, vec!["a", "b"]);

        let unknown = world.call(&ApiCall::new("sim", "warp", Vec::<String>::new()));
        assert_eq!(unknown.arguments, vec!["not_found"]);
    }
}
