//! Strict parser for the port register naming convention
//!
//! `<prefix>.<role>.<name>.id`   -> numeric port ID
//! `<prefix>.<role>.<name>.type` -> data type descriptor (read-only)
//!
//! Registers outside `<prefix>.<role>.` are not port registers and come back
//! as `RegisterName::Other`. Registers inside it that do not parse are errors,
//! never silently coerced.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{AddressSpace, PortId, PortRole, SpaceBounds};
use crate::register::Value;

static SEMANTIC_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+(\.[A-Za-z0-9_]+)*$").expect("static regex"));

/// Classification of one register name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterName {
    PortId { role: PortRole, name: String },
    PortType { role: PortRole, name: String },
    Other,
}

pub fn id_register(prefix: &str, role: PortRole, name: &str) -> String {
    format!("{}.{}.{}.id", prefix, role.token(), name)
}

pub fn type_register(prefix: &str, role: PortRole, name: &str) -> String {
    format!("{}.{}.{}.type", prefix, role.token(), name)
}

/// Classify a register name
///
/// # Errors
/// Returns the reason when the name claims a port role but its semantic
/// name or suffix is invalid.
pub fn parse_register_name(prefix: &str, register: &str) -> Result<RegisterName, String> {
    let Some(rest) = register
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix('.'))
    else {
        return Ok(RegisterName::Other);
    };

    let Some((token, tail)) = rest.split_once('.') else {
        return Ok(RegisterName::Other);
    };
    let Some(role) = PortRole::from_token(token) else {
        return Ok(RegisterName::Other);
    };

    let (name, is_id) = if let Some(name) = tail.strip_suffix(".id") {
        (name, true)
    } else if let Some(name) = tail.strip_suffix(".type") {
        (name, false)
    } else {
        // Other per-port registers (priority, count, ...) are not ours
        return Ok(RegisterName::Other);
    };

    if name.is_empty() {
        return Err("empty port name".to_string());
    }
    if !SEMANTIC_NAME.is_match(name) {
        return Err(format!("invalid port name {:?}", name));
    }

    let name = name.to_string();
    Ok(if is_id {
        RegisterName::PortId { role, name }
    } else {
        RegisterName::PortType { role, name }
    })
}

/// Interpret a port ID register value
///
/// Any single integral numeric value is accepted, not only `natural16`.
/// Returns `Ok(None)` for the unconfigured sentinel.
pub fn parse_port_id(
    value: &Value,
    space: AddressSpace,
    bounds: &SpaceBounds,
) -> Result<Option<PortId>, String> {
    let raw = value
        .as_integer()
        .ok_or_else(|| format!("expected a single integer, got {}", value))?;

    if raw == i64::from(bounds.sentinel) {
        return Ok(None);
    }
    if raw < 0 || raw > i64::from(space.protocol_max()) {
        return Err(format!(
            "value {} outside {} space [0, {}]",
            raw,
            space,
            space.protocol_max()
        ));
    }

    Ok(Some(raw as PortId))
}
