use std::collections::HashSet;
use std::sync::Arc;

/// Deduplicating pool for process names, debug names and snapshot point names.
///
/// Identical strings share one allocation; lookups hash the content. Clones
/// share the set until one of them interns a new string.
#[derive(Debug, Clone, Default)]
pub struct StringPool {
    entries: Arc<HashSet<Arc<str>>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.entries.get(value) {
            return Arc::clone(existing);
        }
        let interned: Arc<str> = Arc::from(value);
        Arc::make_mut(&mut self.entries).insert(Arc::clone(&interned));
        interned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
