//! Safety guards run on every member name and dereferenced value.
//!
//! There are no ambient host globals here, so "dangerous" is a fixed list of
//! structural signatures: a window-like object, a DOM-node-like object, a
//! constructor, or one of the `call` / `apply` / `bind` primitives.

use crate::error::SecurityError;
use crate::value::{FunctionKind, Value};

/// Member names that would expose prototype or accessor machinery.
const FORBIDDEN_MEMBERS: &[&str] = &[
    "constructor",
    "__proto__",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

/// Members that together identify the global object.
const WINDOW_SIGNATURE: &[&str] = &["document", "location", "alert", "setInterval"];

/// Reject a forbidden member name.
pub fn ensure_safe_member_name(name: &str) -> Result<(), SecurityError> {
    if FORBIDDEN_MEMBERS.contains(&name) {
        return Err(SecurityError::Member { name: name.into() });
    }
    Ok(())
}

/// Reject a value that must never be returned to, or invoked from, an
/// expression.
pub fn ensure_safe_object(value: &Value) -> Result<(), SecurityError> {
    match value {
        Value::Object(_) | Value::Scope(_) => {
            if is_window_like(value) {
                Err(SecurityError::Window)
            } else if is_dom_node_like(value) {
                Err(SecurityError::DomNode)
            } else {
                Ok(())
            }
        }
        Value::Function(f) => match f.kind() {
            FunctionKind::Native => Ok(()),
            FunctionKind::Constructor => Err(SecurityError::Constructor),
            FunctionKind::Call => Err(SecurityError::Invoker { name: "call" }),
            FunctionKind::Apply => Err(SecurityError::Invoker { name: "apply" }),
            FunctionKind::Bind => Err(SecurityError::Invoker { name: "bind" }),
        },
        _ => Ok(()),
    }
}

fn is_window_like(value: &Value) -> bool {
    WINDOW_SIGNATURE
        .iter()
        .all(|member| value.get_member(member).truthy())
}

fn is_dom_node_like(value: &Value) -> bool {
    let has = |member: &str| value.get_member(member).truthy();
    has("children") && (has("nodeName") || (has("prop") && has("attr") && has("find")))
}
