//! Load-balancing policies.
//!
//! An LB policy consumes resolver updates, owns a set of subchannels, and
//! publishes [`Picker`] snapshots that route each new call to a subchannel.
//! Policies are registered by name; the channel instantiates the one named
//! by the service config, defaulting to `pick_first`.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::{ConnectivityState, WorkScheduler};

pub use crate::client::subchannel::Subchannel;
use crate::metadata::Metadata;
use crate::rt::SharedRuntime;
use crate::Status;

mod registry;
pub(crate) use registry::GLOBAL_LB_REGISTRY;
pub use registry::LbPolicyRegistry;

pub mod pick_first;
pub mod round_robin;

fn register_builtins_into(registry: &LbPolicyRegistry) {
    registry.add_builder(pick_first::Builder {});
    registry.add_builder(round_robin::Builder {});
}

/// A collection of data configured on the channel that is constructing this
/// LB policy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LB policy to
    /// request a call into its `work` method.
    pub work_scheduler: Arc<dyn WorkScheduler>,
    pub(crate) runtime: SharedRuntime,
}

/// An LB policy factory that produces [`LbPolicy`] instances used by the
/// channel to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Build must not fail. Any optional configuration is delivered via the
    /// policy's `resolver_update` method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal
    /// representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// A JSON LB configuration as found in the service config, before the policy
/// has interpreted it.
#[derive(Clone, Debug)]
pub struct ParsedJsonLbConfig {
    value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Deserializes the configuration into the policy's own type.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, Box<dyn Error + Send + Sync>> {
        serde_json::from_value(self.value.clone()).map_err(|e| e.into())
    }
}

/// A convenience wrapper for an LB policy's parsed configuration object.
#[derive(Clone)]
pub struct LbConfig {
    config: Arc<dyn std::any::Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl std::any::Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// subchannels) and producing [`Picker`] instances for routing RPCs.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// work scheduler.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel when it leaves idle with this policy installed.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);
}

/// Channel behaviors exposed to LB policies.
pub trait ChannelController: Send {
    /// Creates a new subchannel in IDLE state for `address`.
    fn new_subchannel(&mut self, address: &Address) -> Subchannel;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.
    /// Typically used when connections fail, indicating a possible change in
    /// the overall network configuration.
    fn request_resolution(&mut self);
}

/// Represents the current state of a subchannel as seen by LB policies.
#[derive(Clone)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.
    pub connectivity_state: ConnectivityState,
    /// Set if the connectivity state is TransientFailure, describing the most
    /// recent connection error.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl Default for SubchannelState {
    fn default() -> Self {
        SubchannelState {
            connectivity_state: ConnectivityState::Idle,
            last_connection_error: None,
        }
    }
}

impl fmt::Display for SubchannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{} ({err})", self.connectivity_state),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

/// The arguments of one pick: the RPC path and the caller's metadata.
pub struct PickArgs<'a> {
    pub path: &'a str,
    pub metadata: &'a Metadata,
}

/// A `Picker` decides what subchannel to use for a request.
///
/// A picker is consulted exactly once per pick attempt; if it returns
/// [`PickResult::Queue`], the channel parks the RPC until a new picker is
/// published and consults that one.
///
/// Implementations must be pure and wait-free: no blocking, no locks shared
/// with subchannel state notifications.
pub trait Picker: Send + Sync {
    fn pick(&self, args: &PickArgs<'_>) -> PickResult;
}

pub enum PickResult {
    /// Use the subchannel in the pick for the request.
    Pick(Pick),
    /// The policy is still working on a usable connection; park the RPC until
    /// a new picker is produced.
    Queue,
    /// Fail the request with this status (code surfaced as `Unavailable`).
    /// Wait-for-ready RPCs are parked instead of failed.
    Fail(Status),
    /// Fail the request with this status immediately, even if the RPC is
    /// wait-for-ready. The channel re-codes invalid control-plane codes to
    /// `Internal`.
    Drop(Status),
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The subchannel for the request.
    pub subchannel: Subchannel,
    /// Metadata to be added to the existing outgoing metadata.
    pub metadata: Metadata,
}

/// Data provided by the LB policy to the channel: one immutable snapshot.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// A generic initial LbState which is Connecting with a picker that
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// Always returns `Queue`. LB policies that are not actively connecting
/// should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with the wrapped error.
pub struct FailingPicker {
    pub error: Status,
}

impl Picker for FailingPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.error.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_utils;
