//! Well-known attribute names shared with the simulation server.
//!
//! Names outside this table are custom attributes and may carry any value
//! type; names inside it have a fixed type that both ends rely on.

use super::object::{AttributeKind, AttributeValue};

pub const POSITION: &str = "position";
pub const QUATERNION: &str = "quaternion";
pub const JOINT_POSITION: &str = "joint_position";
pub const JOINT_QUATERNION: &str = "joint_quaternion";
pub const JOINT_RVALUE: &str = "joint_rvalue";
pub const JOINT_TVALUE: &str = "joint_tvalue";
pub const JOINT_ANGULAR_VELOCITY: &str = "joint_angular_velocity";
pub const JOINT_LINEAR_VELOCITY: &str = "joint_linear_velocity";
pub const JOINT_ANGULAR_ACCELERATION: &str = "joint_angular_acceleration";
pub const JOINT_LINEAR_ACCELERATION: &str = "joint_linear_acceleration";
pub const CMD_JOINT_RVALUE: &str = "cmd_joint_rvalue";
pub const CMD_JOINT_TVALUE: &str = "cmd_joint_tvalue";
pub const CMD_JOINT_ANGULAR_VELOCITY: &str = "cmd_joint_angular_velocity";
pub const CMD_JOINT_LINEAR_VELOCITY: &str = "cmd_joint_linear_velocity";
pub const CMD_JOINT_ANGULAR_ACCELERATION: &str = "cmd_joint_angular_acceleration";
pub const CMD_JOINT_LINEAR_ACCELERATION: &str = "cmd_joint_linear_acceleration";
pub const CMD_JOINT_TORQUE: &str = "cmd_joint_torque";
pub const CMD_JOINT_FORCE: &str = "cmd_joint_force";

const WELL_KNOWN: &[(&str, AttributeKind)] = &[
    (POSITION, AttributeKind::Vector3),
    (QUATERNION, AttributeKind::Quaternion),
    (JOINT_POSITION, AttributeKind::Vector3),
    (JOINT_QUATERNION, AttributeKind::Quaternion),
    (JOINT_RVALUE, AttributeKind::Scalar),
    (JOINT_TVALUE, AttributeKind::Scalar),
    (JOINT_ANGULAR_VELOCITY, AttributeKind::Scalar),
    (JOINT_LINEAR_VELOCITY, AttributeKind::Scalar),
    (JOINT_ANGULAR_ACCELERATION, AttributeKind::Scalar),
    (JOINT_LINEAR_ACCELERATION, AttributeKind::Scalar),
    (CMD_JOINT_RVALUE, AttributeKind::Scalar),
    (CMD_JOINT_TVALUE, AttributeKind::Scalar),
    (CMD_JOINT_ANGULAR_VELOCITY, AttributeKind::Scalar),
    (CMD_JOINT_LINEAR_VELOCITY, AttributeKind::Scalar),
    (CMD_JOINT_ANGULAR_ACCELERATION, AttributeKind::Scalar),
    (CMD_JOINT_LINEAR_ACCELERATION, AttributeKind::Scalar),
    (CMD_JOINT_TORQUE, AttributeKind::Scalar),
    (CMD_JOINT_FORCE, AttributeKind::Scalar),
];

/// Expected value type of a well-known attribute, `None` for custom ones
pub fn expected_kind(name: &str) -> Option<AttributeKind> {
    WELL_KNOWN
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, kind)| *kind)
}

pub fn is_well_known(name: &str) -> bool {
    expected_kind(name).is_some()
}

/// Value a freshly declared attribute starts with before any exchange
pub fn default_value(name: &str) -> AttributeValue {
    match expected_kind(name) {
        Some(AttributeKind::Vector3) => AttributeValue::Vector3([0.0; 3]),
        Some(AttributeKind::Quaternion) => AttributeValue::Quaternion([1.0, 0.0, 0.0, 0.0]),
        Some(AttributeKind::List) => AttributeValue::List(Vec::new()),
        Some(AttributeKind::Scalar) | None => AttributeValue::Scalar(0.0),
    }
}

/// Checks a value against the well-known table. Custom names accept anything.
pub fn check(name: &str, value: &AttributeValue) -> Result<(), (AttributeKind, AttributeKind)> {
    match expected_kind(name) {
        Some(expected) if expected != value.kind() => Err((expected, value.kind())),
        _ => Ok(()),
    }
}
