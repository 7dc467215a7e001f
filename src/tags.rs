//! Tag sets shared across resource definitions
//!
//! The base set is created once per evaluation and shared through `Arc`.
//! `extend` layers node-specific entries on top without touching the base.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, Serializer};

/// Base tags plus an optional per-node overlay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    base: Arc<BTreeMap<String, String>>,
    overlay: BTreeMap<String, String>,
}

impl TagSet {
    pub fn new(base: BTreeMap<String, String>) -> Self {
        Self {
            base: Arc::new(base),
            overlay: BTreeMap::new(),
        }
    }

    /// New view sharing this base, with `extra` entries layered on top
    pub fn extend<I, K, V>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut overlay = self.overlay.clone();
        overlay.extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            base: Arc::clone(&self.base),
            overlay,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.overlay
            .get(key)
            .or_else(|| self.base.get(key))
            .map(String::as_str)
    }

    /// Merged view; overlay wins on key conflicts
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut merged = (*self.base).clone();
        merged.extend(self.overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// True when both views share the same base allocation
    pub fn shares_base_with(&self, other: &TagSet) -> bool {
        Arc::ptr_eq(&self.base, &other.base)
    }

    pub fn len(&self) -> usize {
        self.base.len() + self.overlay.keys().filter(|k| !self.base.contains_key(*k)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for TagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TagSet {
        let mut map = BTreeMap::new();
        map.insert("azd-env-name".to_string(), "dev".to_string());
        map.insert("repo".to_string(), "https://example.com/repo".to_string());
        TagSet::new(map)
    }

    #[test]
    fn extend_does_not_mutate_base() {
        let base = base();
        let app = base.extend([("azd-service-name", "web")]);

        assert_eq!(app.get("azd-service-name"), Some("web"));
        assert_eq!(base.get("azd-service-name"), None);
        assert_eq!(base.len(), 2);
        assert_eq!(app.len(), 3);
        assert!(app.shares_base_with(&base));
    }

    #[test]
    fn overlay_wins_on_conflict() {
        let tags = base().extend([("azd-env-name", "override")]);
        assert_eq!(tags.get("azd-env-name"), Some("override"));
        assert_eq!(tags.to_map()["azd-env-name"], "override");
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn serializes_as_flat_map() {
        let json = serde_json::to_value(base().extend([("x", "y")])).unwrap();
        assert_eq!(json["x"], "y");
        assert_eq!(json["azd-env-name"], "dev");
    }
}
