use crate::errors::{Error, ErrorKind, Result};
use crate::node::core::{children_of, same_shape, Node, NodeKind};
use crate::node::path::is_valid_element_name;
use std::sync::Arc;

fn violation(context: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvarianceViolation, context)
}

impl Node {
    /// Checks the externally visible invariants of this node, optionally
    /// recursing into its children.
    ///
    /// # Errors
    /// `InvarianceViolation` naming the violated predicate. Returns `Ok`
    /// without checking anything when the container is closed or gone.
    pub fn check_invariant(&self, do_recurse: bool) -> Result<()> {
        let Some(file) = self.body.read().file.upgrade() else {
            return Ok(());
        };
        if !file.is_open() {
            return Ok(());
        }
        let children = {
            let body = self.body.read();
            if let Some(parent) = body.parent.upgrade() {
                let indexed = !body.element_name.is_empty()
                    && body.element_name.bytes().all(|b| b.is_ascii_digit());
                if !is_valid_element_name(&body.element_name) && !indexed {
                    return Err(violation(format!(
                        "bad element name {:?} on a parented node",
                        body.element_name
                    )));
                }
                let parent_body = parent.read();
                let listed =
                    children_of(&parent_body.kind).iter().any(|c| Arc::ptr_eq(c, &self.body));
                if !listed {
                    return Err(violation(format!(
                        "parent of {:?} does not list it as a child",
                        body.element_name
                    )));
                }
                if body.attached && !parent_body.attached {
                    return Err(violation(format!(
                        "attached node {:?} under a detached parent",
                        body.element_name
                    )));
                }
            } else if body.attached && !file.is_container_root(&self.body) {
                return Err(violation("attached node with no parent is not the container root"));
            }
            match &body.kind {
                NodeKind::Integer { value, min, max } => {
                    if value < min || value > max {
                        return Err(violation(format!(
                            "integer value {value} outside [{min}, {max}]"
                        )));
                    }
                }
                NodeKind::ScaledInteger { raw, min, max, scale, .. } => {
                    if raw < min || raw > max {
                        return Err(violation(format!("raw value {raw} outside [{min}, {max}]")));
                    }
                    if *scale == 0.0 || !scale.is_finite() {
                        return Err(violation(format!("bad scale {scale}")));
                    }
                }
                NodeKind::Float { value, min, max, .. } => {
                    if !(*value >= *min && *value <= *max) {
                        return Err(violation(format!(
                            "float value {value} outside [{min}, {max}]"
                        )));
                    }
                }
                NodeKind::Vector { children, allow_hetero } => {
                    if !*allow_hetero
                        && let Some(first) = children.first()
                        && !children.iter().all(|c| same_shape(first, c))
                    {
                        return Err(violation("homogeneous vector has mixed-shape children"));
                    }
                }
                NodeKind::CompressedVector { prototype, codecs, .. } => {
                    for (role, part) in [("prototype", prototype), ("codecs", codecs)] {
                        let parent = part.read().parent.upgrade();
                        if !parent.is_some_and(|p| Arc::ptr_eq(&p, &self.body)) {
                            return Err(violation(format!(
                                "{role} does not point back at its compressed vector"
                            )));
                        }
                    }
                }
                _ => {}
            }
            children_of(&body.kind)
        };
        if do_recurse {
            for child in children {
                Node::from_ref(child).check_invariant(true)?;
            }
        }
        Ok(())
    }
}
