//! Node name validation
//!
//! Node names appear as the first segment of `<node>.outputs.<key>`:
//! - Start with an ASCII letter or underscore
//! - Contain only ASCII letters, digits, underscores, dashes
//! - No dots (dots are path separators)
//! - Not `param` or `token` (reserved expression roots)
//!
//! Manual single-pass check, no allocations on the happy path.

use crate::error::PlanError;

const RESERVED: &[&str] = &["param", "token"];

/// Validate a node name
pub fn validate_node_name(name: &str) -> Result<(), PlanError> {
    let invalid = |reason: &str| PlanError::InvalidNodeName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let Some(&first) = name.as_bytes().first() else {
        return Err(invalid("cannot be empty"));
    };

    if !first.is_ascii_alphabetic() && first != b'_' {
        return Err(invalid("must start with a letter or underscore"));
    }

    for &byte in &name.as_bytes()[1..] {
        if !byte.is_ascii_alphanumeric() && byte != b'_' && byte != b'-' {
            return Err(invalid(
                "may only contain letters, digits, underscores and dashes",
            ));
        }
    }

    if RESERVED.contains(&name) {
        return Err(invalid("is a reserved expression root"));
    }

    Ok(())
}
