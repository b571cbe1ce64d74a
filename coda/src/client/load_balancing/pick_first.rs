//! The `pick_first` load-balancing policy: attempt each resolved address in
//! order until one becomes READY, then stick with it. On disconnection the
//! policy resumes from the top of the current list. TRANSIENT_FAILURE is
//! reported only after a full pass over the list has failed, and is sticky:
//! the policy keeps connecting but does not report CONNECTING again until it
//! actually produces a READY subchannel.

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::client::load_balancing::{
    ChannelController, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, ParsedJsonLbConfig, Pick, PickArgs, PickResult, Picker, QueuingPicker,
    SubchannelState,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::subchannel::Subchannel;
use crate::client::{ConnectivityState, WorkScheduler};
use crate::metadata::Metadata;
use crate::Status;

pub static POLICY_NAME: &str = "pick_first";

pub(super) struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            subchannel_list: None,
            selected_subchannel: None,
            addresses: vec![],
            last_resolver_error: None,
            last_connection_error: None,
            connectivity_state: ConnectivityState::Connecting,
            sent_connecting_state: false,
            num_transient_failures: 0,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = config
            .convert_to()
            .map_err(|e| format!("failed to parse pick_first config: {e}"))?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(super) struct PickFirstConfig {
    #[serde(default)]
    shuffle_address_list: Option<bool>,
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    /// The subchannels we are currently connecting through, in order.
    subchannel_list: Option<SubchannelList>,
    /// The currently connected subchannel, once one is selected.
    selected_subchannel: Option<Subchannel>,
    /// Most recent addresses from the name resolver.
    addresses: Vec<Address>,
    last_resolver_error: Option<String>,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
    connectivity_state: ConnectivityState,
    /// Whether CONNECTING was already reported for the current attempt round.
    sent_connecting_state: bool,
    /// Failures observed after the end of the first pass, used to refresh the
    /// failing picker once per full cycle.
    num_transient_failures: usize,
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.endpoints {
            Ok(mut endpoints) => {
                trace!("pick_first: received {} endpoint(s)", endpoints.len());
                self.maybe_shuffle_endpoints(config, &mut endpoints)?;

                let new_addresses = flatten_endpoints(&endpoints);
                if new_addresses.is_empty() {
                    // Treat empty resolver updates identically to resolver
                    // errors that occur before any valid update was received.
                    self.handle_empty_endpoints(channel_controller);
                    return Err("received empty address list from the name resolver".into());
                }

                // Start using the new address list unless in IDLE, in which
                // case exit_idle covers the same ground.
                if self.connectivity_state != ConnectivityState::Idle {
                    self.subchannel_list =
                        Some(SubchannelList::new(&new_addresses, channel_controller));
                }
                self.addresses = new_addresses;
                Ok(())
            }
            Err(error) => {
                debug!("pick_first: resolver error: {error}");
                self.last_resolver_error = Some(error.clone());

                // Enter or stay in TRANSIENT_FAILURE if there is no good
                // previous update, or if already there; either way refresh
                // the failing picker with the new error information. A
                // previous good update keeps being used otherwise.
                if self.addresses.is_empty()
                    || self.connectivity_state == ConnectivityState::TransientFailure
                {
                    self.move_to_transient_failure(channel_controller);
                }
                Err(error.into())
            }
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        trace!("pick_first: update for {subchannel}: {state}");

        if let Some(list) = &self.subchannel_list {
            if list.contains(subchannel) {
                if state.connectivity_state == ConnectivityState::Ready {
                    self.move_to_ready(subchannel.clone(), channel_controller);
                } else {
                    self.update_tracked_subchannel(subchannel, state, channel_controller);
                }
                return;
            }
        }

        // Any state change for the currently selected subchannel means we
        // are no longer connected.
        if self.selected_subchannel.as_ref() == Some(subchannel)
            && state.connectivity_state != ConnectivityState::Ready
        {
            self.move_to_idle(channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        // Build a new subchannel list from the most recent addresses; this
        // starts connecting from the first address in the list.
        if !self.addresses.is_empty() {
            self.connectivity_state = ConnectivityState::Connecting;
            self.subchannel_list = Some(SubchannelList::new(&self.addresses, channel_controller));
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.connectivity_state == ConnectivityState::Idle {
            self.work(channel_controller);
        }
    }
}

impl PickFirstPolicy {
    fn maybe_shuffle_endpoints(
        &self,
        config: Option<&LbConfig>,
        endpoints: &mut [Endpoint],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(config) = config else { return Ok(()) };
        let Some(cfg) = config.convert_to::<PickFirstConfig>() else {
            return Err("unexpected config type for pick_first".into());
        };
        // The optional shuffle reorders endpoints only; the order of the
        // addresses within each endpoint is preserved.
        if cfg.shuffle_address_list.unwrap_or(false) {
            endpoints.shuffle(&mut rand::rng());
        }
        Ok(())
    }

    fn handle_empty_endpoints(&mut self, channel_controller: &mut dyn ChannelController) {
        self.subchannel_list = None;
        self.selected_subchannel = None;
        self.addresses = vec![];
        self.last_resolver_error =
            Some("received empty address list from the name resolver".to_string());
        self.move_to_transient_failure(channel_controller);
    }

    /// Handles updates for subchannels in the current subchannel list, other
    /// than transitions to READY which are handled by the caller.
    fn update_tracked_subchannel(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let list = self.subchannel_list.as_mut().unwrap();

        let old_state = list.update_subchannel_state(subchannel, state);
        if !list.all_subchannels_seen_initial_state() {
            return;
        }

        // Handle the last subchannel to report its initial state.
        if old_state.is_none() {
            if self.selected_subchannel.is_some() {
                // The selected subchannel is no longer part of the most
                // recent update from the resolver; drop it and go IDLE.
                self.move_to_idle(channel_controller);
            } else if !list.connect_to_next_subchannel() {
                debug_assert!(false, "failed to initiate connection to first subchannel");
            }
            return;
        }

        match state.connectivity_state {
            ConnectivityState::Idle => {
                // Immediately reconnect subchannels that report IDLE once the
                // first pass is complete.
                if list.first_pass_complete {
                    subchannel.connect();
                }
            }
            ConnectivityState::Connecting => {
                if self.connectivity_state == ConnectivityState::Connecting
                    && self.sent_connecting_state
                {
                    return;
                }
                // Sticky TRANSIENT_FAILURE: do not report CONNECTING again
                // until a subchannel actually becomes READY.
                if self.connectivity_state != ConnectivityState::TransientFailure {
                    self.move_to_connecting(channel_controller);
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();

                if !list.first_pass_complete {
                    if !list.connect_to_next_subchannel() {
                        // End of the first pass: report TRANSIENT_FAILURE and
                        // keep attempting every subchannel.
                        list.first_pass_complete = true;
                        self.move_to_transient_failure(channel_controller);
                        let list = self.subchannel_list.as_mut().unwrap();
                        list.connect_to_all_subchannels();
                    }
                } else {
                    self.num_transient_failures += 1;
                    if self.num_transient_failures == list.len() {
                        self.move_to_transient_failure(channel_controller);
                        self.num_transient_failures = 0;
                    }
                }
            }
            _ => {}
        }
    }

    fn move_to_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Idle;
        self.subchannel_list = None;
        self.selected_subchannel = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(IdlePicker {
                work_scheduler: self.work_scheduler.clone(),
            }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Connecting;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
        self.sent_connecting_state = true;
    }

    fn move_to_ready(
        &mut self,
        subchannel: Subchannel,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.connectivity_state = ConnectivityState::Ready;
        self.selected_subchannel = Some(subchannel.clone());
        self.subchannel_list = None;
        self.last_connection_error = None;
        self.last_resolver_error = None;
        self.num_transient_failures = 0;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { sc: subchannel }),
        });
        self.sent_connecting_state = false;
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let error = Status::unavailable(format!(
            "last seen resolver error: {:?}, last seen connection error: {:?}",
            self.last_resolver_error,
            self.last_connection_error.as_ref().map(|e| e.to_string()),
        ));
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker { error }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }
}

/// Flattens the ordered endpoint list into an ordered, deduplicated address
/// list.
fn flatten_endpoints(endpoints: &[Endpoint]) -> Vec<Address> {
    let mut addresses: Vec<Address> = endpoints
        .iter()
        .flat_map(|ep| ep.addresses.clone())
        .collect();
    let mut uniques = HashSet::new();
    addresses.retain(|a| uniques.insert((a.network_type, a.address.clone())));
    addresses
}

struct SubchannelEntry {
    subchannel: Subchannel,
    state: Option<SubchannelState>,
}

/// The ordered list of subchannels the policy is attempting, with the index
/// of the attempt front.
struct SubchannelList {
    entries: Vec<SubchannelEntry>,
    attempting: usize,
    first_pass_complete: bool,
}

impl SubchannelList {
    fn new(addresses: &[Address], channel_controller: &mut dyn ChannelController) -> Self {
        let entries = addresses
            .iter()
            .map(|address| SubchannelEntry {
                subchannel: channel_controller.new_subchannel(address),
                state: None,
            })
            .collect();
        Self {
            entries,
            attempting: 0,
            first_pass_complete: false,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, subchannel: &Subchannel) -> bool {
        self.entries.iter().any(|e| &e.subchannel == subchannel)
    }

    fn update_subchannel_state(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
    ) -> Option<SubchannelState> {
        for entry in &mut self.entries {
            if &entry.subchannel == subchannel {
                return entry.state.replace(state.clone());
            }
        }
        None
    }

    fn all_subchannels_seen_initial_state(&self) -> bool {
        self.entries.iter().all(|e| e.state.is_some())
    }

    /// Connects to the next idle subchannel in order. Returns false when the
    /// list is exhausted.
    fn connect_to_next_subchannel(&mut self) -> bool {
        while self.attempting < self.entries.len() {
            let entry = &self.entries[self.attempting];
            self.attempting += 1;
            let connectable = entry
                .state
                .as_ref()
                .is_some_and(|s| s.connectivity_state == ConnectivityState::Idle);
            if connectable {
                entry.subchannel.connect();
                return true;
            }
        }
        false
    }

    fn connect_to_all_subchannels(&self) {
        for entry in &self.entries {
            entry.subchannel.connect();
        }
    }
}

struct OneSubchannelPicker {
    sc: Subchannel,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.sc.clone(),
            metadata: Metadata::new(),
        })
    }
}

/// Queues picks while asking the policy to exit idle.
struct IdlePicker {
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _args: &PickArgs<'_>) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}
