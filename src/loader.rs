use std::collections::HashMap;

/// Source of template text by name. Called synchronously by the
/// environment before compilation; `None` means "not found" and becomes
/// `TemplateNotFound` unless the calling construct opts out.
pub trait Loader: Send + Sync {
    fn get_source(&self, name: &str) -> Option<String>;

    fn exists(&self, name: &str) -> bool {
        self.get_source(name).is_some()
    }
}

/// A plain name-to-source map, mostly useful for tests and embedded
/// template sets.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    sources: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(name.into(), source.into());
    }
}

impl Loader for MemoryLoader {
    fn get_source(&self, name: &str) -> Option<String> {
        self.sources.get(name).cloned()
    }

    fn exists(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MemoryLoader {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut loader = MemoryLoader::new();
        for (name, source) in iter {
            loader.insert(name, source);
        }
        loader
    }
}
