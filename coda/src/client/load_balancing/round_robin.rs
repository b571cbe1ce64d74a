//! The `round_robin` load-balancing policy: one subchannel per resolved
//! address, connections requested on all of them, and a picker that cycles
//! through the READY ones starting at a random index. When the READY set is
//! empty and every subchannel has failed, a failing picker derived from the
//! most recent error is published; that TRANSIENT_FAILURE report is sticky
//! until some subchannel becomes READY again.

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::client::load_balancing::{
    ChannelController, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, Pick, PickArgs, PickResult, Picker, QueuingPicker, SubchannelState,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::subchannel::Subchannel;
use crate::client::{ConnectivityState, WorkScheduler};
use crate::metadata::Metadata;
use crate::Status;

pub static POLICY_NAME: &str = "round_robin";

pub(super) struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            work_scheduler: options.work_scheduler,
            entries: Vec::new(),
            sticky_transient_failure: false,
            last_connection_error: None,
            last_resolver_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct Entry {
    address: Address,
    subchannel: Subchannel,
    state: SubchannelState,
}

struct RoundRobinPolicy {
    #[allow(dead_code)]
    work_scheduler: Arc<dyn WorkScheduler>,
    /// One entry per resolved address, in resolver order.
    entries: Vec<Entry>,
    /// Set when TRANSIENT_FAILURE was reported; cleared only by a READY
    /// subchannel, so the channel does not oscillate back through CONNECTING
    /// on every reconnect attempt.
    sticky_transient_failure: bool,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
    last_resolver_error: Option<String>,
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.endpoints {
            Ok(endpoints) => {
                let addresses = flatten(&endpoints);
                if addresses.is_empty() {
                    self.entries.clear();
                    self.last_resolver_error =
                        Some("received empty address list from the name resolver".to_string());
                    self.publish_transient_failure(channel_controller);
                    return Err("received empty address list from the name resolver".into());
                }

                // Reuse subchannels for addresses that survived the update,
                // preserving their observed state; drop the removed ones and
                // create the added ones.
                let mut old: Vec<Entry> = std::mem::take(&mut self.entries);
                for address in addresses {
                    let existing = old.iter().position(|e| e.address == address);
                    match existing {
                        Some(i) => self.entries.push(old.swap_remove(i)),
                        None => {
                            let subchannel = channel_controller.new_subchannel(&address);
                            self.entries.push(Entry {
                                address,
                                subchannel,
                                state: SubchannelState::default(),
                            });
                        }
                    }
                }
                trace!("round_robin: tracking {} subchannel(s)", self.entries.len());
                self.connect_idle();
                self.publish_aggregate(channel_controller);
                Ok(())
            }
            Err(error) => {
                self.last_resolver_error = Some(error.clone());
                if self.entries.is_empty() {
                    self.publish_transient_failure(channel_controller);
                    return Err(error.into());
                }
                // Keep using the previous good update.
                Ok(())
            }
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| &e.subchannel == subchannel)
        else {
            return;
        };
        trace!("round_robin: update for {subchannel}: {state}");
        entry.state = state.clone();
        match state.connectivity_state {
            ConnectivityState::Idle => entry.subchannel.connect(),
            ConnectivityState::TransientFailure => {
                if let Some(err) = &state.last_connection_error {
                    self.last_connection_error = Some(err.clone());
                }
            }
            _ => {}
        }
        self.publish_aggregate(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connect_idle();
        self.publish_aggregate(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.work(channel_controller);
    }
}

impl RoundRobinPolicy {
    fn connect_idle(&self) {
        for entry in &self.entries {
            if entry.state.connectivity_state == ConnectivityState::Idle {
                entry.subchannel.connect();
            }
        }
    }

    fn publish_aggregate(&mut self, channel_controller: &mut dyn ChannelController) {
        let ready: Vec<Subchannel> = self
            .entries
            .iter()
            .filter(|e| e.state.connectivity_state == ConnectivityState::Ready)
            .map(|e| e.subchannel.clone())
            .collect();

        if !ready.is_empty() {
            self.sticky_transient_failure = false;
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RoundRobinPicker::new(ready)),
            });
            return;
        }

        let all_failed = !self.entries.is_empty()
            && self
                .entries
                .iter()
                .all(|e| e.state.connectivity_state == ConnectivityState::TransientFailure);

        if all_failed || self.sticky_transient_failure {
            self.publish_transient_failure(channel_controller);
            return;
        }

        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
    }

    fn publish_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.sticky_transient_failure = true;
        let error = Status::unavailable(format!(
            "no ready subchannels; last seen connection error: {:?}, \
             last seen resolver error: {:?}",
            self.last_connection_error.as_ref().map(|e| e.to_string()),
            self.last_resolver_error,
        ));
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker { error }),
        });
        channel_controller.request_resolution();
    }
}

fn flatten(endpoints: &[Endpoint]) -> Vec<Address> {
    let mut addresses: Vec<Address> = endpoints
        .iter()
        .flat_map(|ep| ep.addresses.clone())
        .collect();
    let mut seen = std::collections::HashSet::new();
    addresses.retain(|a| seen.insert((a.network_type, a.address.clone())));
    addresses
}

struct RoundRobinPicker {
    subchannels: Vec<Subchannel>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Subchannel>) -> Self {
        // Start at a random index so a fleet of channels does not converge on
        // the first backend in every new picker.
        let start = rand::random_range(..subchannels.len());
        Self {
            subchannels,
            next: AtomicUsize::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick {
            subchannel: self.subchannels[idx].clone(),
            metadata: Metadata::new(),
        })
    }
}
