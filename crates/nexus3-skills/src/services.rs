//! The Agent's `services` bag — a key→value store threaded through to
//! every skill factory so a skill can reach shared state (permissions, api
//! key, working directory, pool connection info, …) without every skill
//! constructor growing a bespoke parameter list.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ServicesBag {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServicesBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key).and_then(|v| v.clone().downcast::<T>().ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get::<String>(key).map(|s| (*s).clone())
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get::<u16>(key).map(|v| *v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_typed_values() {
        let mut bag = ServicesBag::new();
        bag.insert("port", 8765u16);
        bag.insert("workspace_root", "/tmp/work".to_string());

        assert_eq!(bag.get_u16("port"), Some(8765));
        assert_eq!(bag.get_string("workspace_root"), Some("/tmp/work".to_string()));
        assert!(bag.get_string("missing").is_none());
    }

    #[test]
    fn wrong_type_lookup_returns_none() {
        let mut bag = ServicesBag::new();
        bag.insert("port", 8765u16);
        assert!(bag.get::<String>("port").is_none());
    }
}
