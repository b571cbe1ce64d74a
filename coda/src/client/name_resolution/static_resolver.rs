//! The `static` scheme: a fixed, comma-separated address list carried in the
//! target itself, e.g. `static:///127.0.0.1:5000,127.0.0.1:5001`.

use super::{
    Address, Endpoint, Resolver, ResolverBuilder, ResolverController, ResolverOptions,
    ResolverUpdate, Target, TCP_NETWORK_TYPE,
};

pub(super) struct StaticResolverBuilder;

impl ResolverBuilder for StaticResolverBuilder {
    fn scheme(&self) -> &'static str {
        "static"
    }

    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let path = target.path();
        let addresses: Vec<Address> = path
            .strip_prefix('/')
            .unwrap_or(path)
            .split(',')
            .filter(|a| !a.is_empty())
            .map(|a| Address {
                network_type: TCP_NETWORK_TYPE,
                address: a.to_string(),
                ..Default::default()
            })
            .collect();
        // A static list never changes, so the single update is produced on
        // the first scheduled work call.
        options.work_scheduler.schedule_work();
        Box::new(StaticResolver {
            addresses,
            published: false,
        })
    }

    fn default_authority(&self, target: &Target) -> String {
        let path = target.path();
        let path = path.strip_prefix('/').unwrap_or(path);
        // The first address stands in as the authority.
        path.split(',').next().unwrap_or(path).to_string()
    }
}

struct StaticResolver {
    addresses: Vec<Address>,
    published: bool,
}

impl Resolver for StaticResolver {
    fn work(&mut self, controller: &mut dyn ResolverController) {
        if self.published {
            return;
        }
        self.published = true;
        let update = if self.addresses.is_empty() {
            ResolverUpdate {
                endpoints: Err("static resolver target contains no addresses".to_string()),
                ..Default::default()
            }
        } else {
            ResolverUpdate {
                endpoints: Ok(self
                    .addresses
                    .iter()
                    .cloned()
                    .map(Endpoint::from_address)
                    .collect()),
                ..Default::default()
            }
        };
        let _ = controller.update(update);
    }

    fn resolve_now(&mut self) {
        // Nothing to refresh.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::service_config::ServiceConfig;
    use crate::client::WorkScheduler;
    use std::str::FromStr;
    use std::sync::Arc;

    struct NopScheduler;
    impl WorkScheduler for NopScheduler {
        fn schedule_work(&self) {}
    }

    #[derive(Default)]
    struct CaptureController {
        updates: Vec<ResolverUpdate>,
    }

    impl ResolverController for CaptureController {
        fn parse_service_config(&self, _config: &str) -> Result<ServiceConfig, crate::Error> {
            Err("unused".into())
        }
        fn update(&mut self, update: ResolverUpdate) -> Result<(), crate::Error> {
            self.updates.push(update);
            Ok(())
        }
    }

    #[test]
    fn splits_addresses() {
        let target = Target::from_str("static:///127.0.0.1:1,127.0.0.1:2").unwrap();
        let mut resolver = StaticResolverBuilder.build(
            &target,
            ResolverOptions {
                authority: String::new(),
                work_scheduler: Arc::new(NopScheduler),
            },
        );
        let mut controller = CaptureController::default();
        resolver.work(&mut controller);
        // The update is one-shot.
        resolver.work(&mut controller);

        assert_eq!(controller.updates.len(), 1);
        let endpoints = controller.updates[0].endpoints.as_ref().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].addresses[0].address, "127.0.0.1:1");
        assert_eq!(endpoints[1].addresses[0].address, "127.0.0.1:2");
    }

    #[test]
    fn empty_target_is_an_error() {
        let target = Target::from_str("static:///").unwrap();
        let mut resolver = StaticResolverBuilder.build(
            &target,
            ResolverOptions {
                authority: String::new(),
                work_scheduler: Arc::new(NopScheduler),
            },
        );
        let mut controller = CaptureController::default();
        resolver.work(&mut controller);
        assert!(controller.updates[0].endpoints.is_err());
    }

    #[test]
    fn default_authority_is_first_address() {
        let target = Target::from_str("static:///a:1,b:2").unwrap();
        assert_eq!(StaticResolverBuilder.default_authority(&target), "a:1");
    }
}
