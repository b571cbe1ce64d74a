use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use super::ResolverBuilder;

/// A registry to store and retrieve name resolvers. Resolvers are indexed by
/// the URI scheme they are intended to handle.
pub struct ResolverRegistry {
    m: Arc<Mutex<HashMap<&'static str, Arc<dyn ResolverBuilder>>>>,
}

impl ResolverRegistry {
    fn new() -> Self {
        Self {
            m: Arc::default(),
        }
    }

    /// Add a resolver into the registry.
    pub fn add_builder(&self, builder: Box<dyn ResolverBuilder>) {
        self.m
            .lock()
            .unwrap()
            .insert(builder.scheme(), Arc::from(builder));
    }

    /// Retrieve a resolver from the registry, or None if not found.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.m.lock().unwrap().get(scheme).cloned()
    }
}

/// The registry used when a channel is not given a local one.
pub fn global_registry() -> &'static ResolverRegistry {
    &GLOBAL_RESOLVER_REGISTRY
}

static GLOBAL_RESOLVER_REGISTRY: LazyLock<ResolverRegistry> = LazyLock::new(|| {
    let r = ResolverRegistry::new();
    super::register_builtins_into(&r);
    r
});
