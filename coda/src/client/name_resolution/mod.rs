//! Name resolution.
//!
//! Name resolution is the process by which a channel's target is converted
//! into network addresses used by the channel to connect to a service.
//! Resolvers are registered by URI scheme and produce a stream of
//! [`ResolverUpdate`]s: an address list, an optional service config and
//! optional attributes.

use core::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use crate::attributes::Attributes;
use crate::client::service_config::ServiceConfig;
use crate::client::WorkScheduler;

mod registry;
pub use registry::global_registry;
pub(crate) use registry::ResolverRegistry;

pub mod manual;
mod static_resolver;

fn register_builtins_into(registry: &ResolverRegistry) {
    registry.add_builder(Box::new(static_resolver::StaticResolverBuilder));
}

/// A channel target: a parsed URI whose scheme selects the resolver.
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
}

impl Target {
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The path portion, e.g. `/svc.example.com` for `dns:///svc.example.com`.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn host_and_port(&self) -> Option<String> {
        let host = self.url.host_str()?;
        match self.url.port() {
            Some(port) => Some(format!("{host}:{port}")),
            None => Some(host.to_string()),
        }
    }
}

impl FromStr for Target {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Target {
            url: Url::from_str(s)?,
        })
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A name resolver factory that produces [`Resolver`] instances used by the
/// channel to resolve network addresses for the target URI.
pub trait ResolverBuilder: Send + Sync {
    /// Builds and returns a new name resolver instance.
    ///
    /// Note that build must not fail. Instead, an erroring resolver may be
    /// returned that reports an `Err` update.
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &'static str;

    /// Returns the default authority for a channel using this name resolver
    /// and target. This is typically the same as the service's name. By
    /// default, this returns the path portion of the target URI with the
    /// leading slash removed.
    fn default_authority(&self, target: &Target) -> String {
        let path = target.path();
        path.strip_prefix('/').unwrap_or(path).to_string()
    }
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
pub struct ResolverOptions {
    /// The authority that will be used for the channel by default.
    pub authority: String,
    /// A hook into the channel's work scheduler, used to request a call into
    /// the resolver's `work` method.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// A name resolver instance.
pub trait Resolver: Send {
    /// Called serially by the channel, initially once scheduled via the work
    /// scheduler, to let the resolver produce an update.
    fn work(&mut self, controller: &mut dyn ResolverController);

    /// Asks the resolver to re-resolve, typically after connections fail.
    /// Resolvers are responsible for their own re-resolution backoff.
    fn resolve_now(&mut self);
}

/// A collection of operations a resolver may perform on the channel which
/// constructed it.
pub trait ResolverController {
    /// Parses the provided JSON service config.
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, crate::Error>;

    /// Notifies the channel about the current state of the name resolver. If
    /// an error value is returned, the resolver should attempt to re-resolve
    /// after applying an appropriate backoff.
    fn update(&mut self, update: ResolverUpdate) -> Result<(), crate::Error>;
}

/// A name resolver update expressing the current state of the resolver.
#[derive(Clone)]
pub struct ResolverUpdate {
    /// The endpoints resolved for the target, or an error description if
    /// resolution failed.
    pub endpoints: Result<Vec<Endpoint>, String>,
    /// The service config the client should use, if the resolver carries one,
    /// or the error encountered parsing it.
    pub service_config: Result<Option<ServiceConfig>, String>,
    /// Optional data which may be used by the LB policy or channel.
    pub attributes: Attributes,
    /// A human-readable note attached to this resolution, surfaced in RPC
    /// failure messages while this update is current.
    pub resolution_note: Option<String>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate {
            endpoints: Ok(Vec::new()),
            service_config: Ok(None),
            attributes: Attributes::new(),
            resolution_note: None,
        }
    }
}

/// An `Endpoint` is an address or a collection of addresses which reference
/// one logical server. Multiple addresses may be used if there are multiple
/// ways the server can be reached.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
pub struct Endpoint {
    /// The list of addresses used to connect to the server.
    pub addresses: Vec<Address>,
    /// Optional data which may be used by the LB policy or channel.
    pub attributes: Attributes,
}

impl Endpoint {
    pub fn from_address(address: Address) -> Self {
        Endpoint {
            addresses: vec![address],
            attributes: Attributes::new(),
        }
    }
}

/// An `Address` is an identifier that indicates how to connect to a server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
pub struct Address {
    /// Identifies what kind of transport to create when connecting to this
    /// address. Typically [`TCP_NETWORK_TYPE`].
    pub network_type: &'static str,
    /// The address itself, passed to the transport to create a connection.
    pub address: String,
    /// Optional data which the transport or LB policy may use.
    pub attributes: Attributes,
}

impl Address {
    pub fn new(network_type: &'static str, address: impl Into<String>) -> Self {
        Address {
            network_type,
            address: address.into(),
            attributes: Attributes::new(),
        }
    }

    /// Returns a copy of this address with `attributes` attached.
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl Default for Address {
    fn default() -> Self {
        Address {
            network_type: TCP_NETWORK_TYPE,
            address: String::new(),
            attributes: Attributes::new(),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address to be connected via
/// TCP/IP.
pub static TCP_NETWORK_TYPE: &str = "tcp";

/// Per-address authority override, attached by resolvers as an address
/// attribute. An empty value is treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuthorityOverride(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() {
        let t: Target = "static:///127.0.0.1:5000".parse().unwrap();
        assert_eq!(t.scheme(), "static");
        assert_eq!(t.path(), "/127.0.0.1:5000");
    }

    #[test]
    fn default_authority_strips_slash() {
        struct B;
        impl ResolverBuilder for B {
            fn build(&self, _: &Target, _: ResolverOptions) -> Box<dyn Resolver> {
                unreachable!()
            }
            fn scheme(&self) -> &'static str {
                "test"
            }
        }
        let t: Target = "test:///svc.example.com:443".parse().unwrap();
        assert_eq!(B.default_authority(&t), "svc.example.com:443");
    }
}
