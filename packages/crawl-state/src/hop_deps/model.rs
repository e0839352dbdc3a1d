use serde::{Deserialize, Serialize};

/// One graph edge folded into an owner's cached hop count.
///
/// A missing link type or child marks the edge as "any link" / "the parent itself".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeleteDependency {
    pub link_type: Option<String>,
    pub parent_hash: String,
    pub child_hash: Option<String>,
}

impl DeleteDependency {
    pub fn new(
        link_type: Option<&str>,
        parent_hash: impl Into<String>,
        child_hash: Option<&str>,
    ) -> Self {
        Self {
            link_type: link_type.filter(|l| !l.is_empty()).map(str::to_string),
            parent_hash: parent_hash.into(),
            child_hash: child_hash.filter(|c| !c.is_empty()).map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_optional_parts_are_absent() {
        let dep = DeleteDependency::new(Some(""), "p", Some(""));
        assert_eq!(dep.link_type, None);
        assert_eq!(dep.child_hash, None);

        let dep = DeleteDependency::new(Some("link"), "p", Some("c"));
        assert_eq!(dep.link_type.as_deref(), Some("link"));
        assert_eq!(dep.child_hash.as_deref(), Some("c"));
    }
}
