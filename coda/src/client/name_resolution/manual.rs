//! A resolver whose updates are pushed programmatically. Used by tests and
//! by applications that learn addresses out-of-band.

use std::sync::{Arc, Mutex};

use crate::client::WorkScheduler;

use super::{
    global_registry, Resolver, ResolverBuilder, ResolverController, ResolverOptions,
    ResolverUpdate, Target,
};

/// Registers a manual resolver under `scheme` in the global registry and
/// returns the handle used to push updates.
pub fn register(scheme: &'static str) -> Arc<Handle> {
    let handle = Arc::new(Handle {
        state: Mutex::new(HandleState {
            latest: None,
            scheduler: None,
        }),
    });
    global_registry().add_builder(Box::new(ManualResolverBuilder {
        scheme,
        handle: handle.clone(),
    }));
    handle
}

/// Pushes resolver updates into the channel that built the resolver.
pub struct Handle {
    state: Mutex<HandleState>,
}

struct HandleState {
    latest: Option<ResolverUpdate>,
    scheduler: Option<Arc<dyn WorkScheduler>>,
}

impl Handle {
    /// Publishes `update` as the current resolution result. If a channel has
    /// built the resolver, it is notified; otherwise the update is delivered
    /// once one does.
    pub fn update(&self, update: ResolverUpdate) {
        let mut state = self.state.lock().unwrap();
        state.latest = Some(update);
        if let Some(scheduler) = &state.scheduler {
            scheduler.schedule_work();
        }
    }

    fn attach(&self, scheduler: Arc<dyn WorkScheduler>) {
        let mut state = self.state.lock().unwrap();
        let has_update = state.latest.is_some();
        state.scheduler = Some(scheduler.clone());
        if has_update {
            scheduler.schedule_work();
        }
    }

    fn take(&self) -> Option<ResolverUpdate> {
        self.state.lock().unwrap().latest.take()
    }
}

struct ManualResolverBuilder {
    scheme: &'static str,
    handle: Arc<Handle>,
}

impl ResolverBuilder for ManualResolverBuilder {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn build(&self, _target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        self.handle.attach(options.work_scheduler);
        Box::new(ManualResolver {
            handle: self.handle.clone(),
        })
    }
}

struct ManualResolver {
    handle: Arc<Handle>,
}

impl Resolver for ManualResolver {
    fn work(&mut self, controller: &mut dyn ResolverController) {
        if let Some(update) = self.handle.take() {
            let _ = controller.update(update);
        }
    }

    fn resolve_now(&mut self) {
        // The application decides when new data exists; nothing to do.
    }
}
