//! Plugin-provided members of the action, component and store contexts.
//!
//! Plugins extend the contextual interfaces by adding named values at
//! construction time instead of subclassing them. Values are shared behind
//! `Arc`, so copying a member set into a sub-action frame is cheap.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A name-keyed record of values added by plugins.
#[derive(Clone, Default)]
pub struct Members {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Members {
    /// Create an empty member set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. A later insert under the same name replaces the earlier one.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.entries.insert(name.into(), Arc::new(value));
    }

    /// Get a member by name, if present and of type `T`.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.entries.get(name)?.downcast_ref()
    }

    /// Returns true if a member with this name exists (of any type).
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Names of all members, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no plugin added anything.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Members {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Members").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookup() {
        let mut members = Members::new();
        members.insert("locale", String::from("en-US"));
        members.insert("retries", 3u32);

        assert_eq!(members.get::<String>("locale").map(String::as_str), Some("en-US"));
        assert_eq!(members.get::<u32>("retries"), Some(&3));
        // Wrong type is a miss, not a panic
        assert_eq!(members.get::<u64>("retries"), None);
        assert_eq!(members.get::<u32>("missing"), None);
    }

    #[test]
    fn test_clone_shares_values() {
        let mut members = Members::new();
        members.insert("config", vec![1, 2, 3]);
        let copy = members.clone();

        let a = members.get::<Vec<i32>>("config").unwrap();
        let b = copy.get::<Vec<i32>>("config").unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_debug_lists_sorted_names() {
        let mut members = Members::new();
        members.insert("b", 1u8);
        members.insert("a", 2u8);
        assert_eq!(format!("{members:?}"), r#"Members { names: ["a", "b"] }"#);
    }
}
