use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use super::LbPolicyBuilder;

/// A registry to store and retrieve LB policies. LB policies are indexed by
/// their names.
pub struct LbPolicyRegistry {
    m: Arc<Mutex<HashMap<String, Arc<dyn LbPolicyBuilder>>>>,
}

impl LbPolicyRegistry {
    fn new() -> Self {
        Self { m: Arc::default() }
    }

    /// Add a LB policy into the registry.
    pub fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        self.m
            .lock()
            .unwrap()
            .insert(builder.name().to_string(), Arc::new(builder));
    }

    /// Retrieve a LB policy from the registry, or None if not found.
    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.m.lock().unwrap().get(name).cloned()
    }
}

/// The registry used if a local registry is not provided to a channel.
pub(crate) static GLOBAL_LB_REGISTRY: LazyLock<LbPolicyRegistry> = LazyLock::new(|| {
    let r = LbPolicyRegistry::new();
    super::register_builtins_into(&r);
    r
});
