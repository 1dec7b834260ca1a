pub mod attribute;
pub mod cache;
pub mod object;

pub use cache::{Origin, RemoteBatch, RemoteUpdate, StateCache};
pub use object::{AttributeKind, AttributeValue, ObjectDeclaration, ObjectKind, ObjectState};
