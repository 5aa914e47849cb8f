use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::MutationDefinition;

/// Mutation definitions by operation id (`"volumes.attach"`, ...).
#[derive(Debug, Default, Clone)]
pub struct MutationCatalog {
    definitions: BTreeMap<&'static str, Arc<MutationDefinition>>,
}

impl MutationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `definition`, replacing one with the same id.
    pub fn insert(&mut self, definition: MutationDefinition) -> Option<Arc<MutationDefinition>> {
        self.definitions.insert(definition.id, Arc::new(definition))
    }

    pub fn get(&self, id: &str) -> Option<Arc<MutationDefinition>> {
        self.definitions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }

    /// Operation ids in lexical order.
    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.definitions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Extend<MutationDefinition> for MutationCatalog {
    fn extend<T: IntoIterator<Item = MutationDefinition>>(&mut self, iter: T) {
        for definition in iter {
            self.insert(definition);
        }
    }
}
