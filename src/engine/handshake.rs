//! Declaration bookkeeping and handshake acknowledgement checks.
//!
//! The client declares what it publishes (`send`) and what it subscribes to
//! (`receive`). The server echoes the entries it accepted; anything it left out
//! was refused, typically because another client already publishes it.

use std::collections::BTreeSet;

use crate::codec::HandshakeAck;
use crate::error::SyncError;
use crate::state::ObjectDeclaration;

type Pair = (String, String);

fn pairs(declarations: &[ObjectDeclaration]) -> BTreeSet<Pair> {
    declarations
        .iter()
        .flat_map(|d| d.attributes.iter().map(|a| (d.id.clone(), a.clone())))
        .collect()
}

fn describe(pairs: impl IntoIterator<Item = Pair>) -> String {
    pairs
        .into_iter()
        .map(|(id, attribute)| format!("{id}.{attribute}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn compare(role: &str, declared: &[ObjectDeclaration], acked: &[ObjectDeclaration]) -> Option<String> {
    let declared = pairs(declared);
    let acked = pairs(acked);
    if declared == acked {
        return None;
    }

    let refused: Vec<Pair> = declared.difference(&acked).cloned().collect();
    let extra: Vec<Pair> = acked.difference(&declared).cloned().collect();

    let mut parts = Vec::new();
    if !refused.is_empty() {
        parts.push(format!("{role} refused: {}", describe(refused)));
    }
    if !extra.is_empty() {
        parts.push(format!("{role} not declared: {}", describe(extra)));
    }
    Some(parts.join("; "))
}

/// The acknowledged sets must match the declared ones exactly
pub fn verify_ack(
    send: &[ObjectDeclaration],
    receive: &[ObjectDeclaration],
    ack: &HandshakeAck,
) -> Result<(), SyncError> {
    let problems: Vec<String> = [
        compare("send", send, &ack.send),
        compare("receive", receive, &ack.receive),
    ]
    .into_iter()
    .flatten()
    .collect();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(SyncError::HandshakeMismatch(problems.join("; ")))
    }
}

/// Add `declaration` to `list`, merging attributes into an existing entry.
/// Returns true if anything new was declared.
pub fn merge(list: &mut Vec<ObjectDeclaration>, declaration: ObjectDeclaration) -> bool {
    match list.iter_mut().find(|d| d.id == declaration.id) {
        Some(existing) => {
            let mut changed = false;
            for attribute in declaration.attributes {
                if !existing.declares(&attribute) {
                    existing.attributes.push(attribute);
                    changed = true;
                }
            }
            changed
        }
        None => {
            list.push(declaration);
            true
        }
    }
}

/// Remove every declaration of `id`. Returns true if one existed.
pub fn remove(list: &mut Vec<ObjectDeclaration>, id: &str) -> bool {
    let before = list.len();
    list.retain(|d| d.id != id);
    list.len() != before
}

/// First (id, attribute) of `declaration` already present in `other`
pub fn overlap(declaration: &ObjectDeclaration, other: &[ObjectDeclaration]) -> Option<String> {
    let existing = other.iter().find(|d| d.id == declaration.id)?;
    declaration
        .attributes
        .iter()
        .find(|a| existing.declares(a))
        .map(|a| format!("{}.{a}", declaration.id))
}

pub fn find<'a>(list: &'a [ObjectDeclaration], id: &str) -> Option<&'a ObjectDeclaration> {
    list.iter().find(|d| d.id == id)
}
