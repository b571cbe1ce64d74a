//! Shared helpers for exercising LB policies without a real channel: a fake
//! channel controller that records the events a policy produces, and fake
//! subchannels whose transport never connects.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::backoff::{ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};
use crate::client::load_balancing::{
    ChannelController, LbPolicyOptions, LbState, SubchannelState,
};
use crate::client::name_resolution::Address;
use crate::client::subchannel::{InternalSubchannel, Subchannel, SubchannelKey};
use crate::client::{ConnectivityState, WorkScheduler};
use crate::rt::{default_runtime, SharedRuntime};
use crate::transport::{ConnectedTransport, Transport, TransportOptions};

pub(crate) enum TestEvent {
    NewSubchannel(Subchannel),
    UpdatePicker(LbState),
    RequestResolution,
}

pub(crate) struct TestChannelController {
    events: Vec<TestEvent>,
    runtime: SharedRuntime,
}

impl TestChannelController {
    pub(crate) fn new() -> Self {
        Self {
            events: Vec::new(),
            runtime: default_runtime(),
        }
    }

    pub(crate) fn events(&self) -> &[TestEvent] {
        &self.events
    }

    pub(crate) fn created_subchannels(&self) -> Vec<Subchannel> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TestEvent::NewSubchannel(sc) => Some(sc.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn last_picker_update(&self) -> Option<LbState> {
        self.events.iter().rev().find_map(|e| match e {
            TestEvent::UpdatePicker(state) => Some(state.clone()),
            _ => None,
        })
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Subchannel {
        let subchannel = new_test_subchannel(address.clone(), self.runtime.clone());
        self.events.push(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.events.push(TestEvent::UpdatePicker(update));
    }

    fn request_resolution(&mut self) {
        self.events.push(TestEvent::RequestResolution);
    }
}

pub(crate) struct NopWorkScheduler;

impl WorkScheduler for NopWorkScheduler {
    fn schedule_work(&self) {}
}

pub(crate) fn new_test_policy_options() -> LbPolicyOptions {
    LbPolicyOptions {
        work_scheduler: Arc::new(NopWorkScheduler),
        runtime: default_runtime(),
    }
}

/// A transport whose connection attempts never complete, so policy tests see
/// no real subchannel activity beyond what they inject themselves.
struct PendingTransport;

#[async_trait]
impl Transport for PendingTransport {
    async fn connect(
        &self,
        _address: String,
        _runtime: SharedRuntime,
        _opts: &TransportOptions,
    ) -> Result<ConnectedTransport, String> {
        std::future::pending().await
    }
}

pub(crate) fn new_test_subchannel(address: Address, runtime: SharedRuntime) -> Subchannel {
    let key = SubchannelKey::new(address, 0);
    let isc = InternalSubchannel::new(
        key,
        Arc::new(PendingTransport),
        Arc::new(ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG.clone()).unwrap()),
        None,
        Box::new(|_| {}),
        runtime,
    );
    Subchannel::new(isc)
}

pub(crate) fn ready_state() -> SubchannelState {
    SubchannelState {
        connectivity_state: ConnectivityState::Ready,
        last_connection_error: None,
    }
}

pub(crate) fn tf_state(error: &str) -> SubchannelState {
    SubchannelState {
        connectivity_state: ConnectivityState::TransientFailure,
        last_connection_error: Some(Arc::from(Box::from(error.to_string()))),
    }
}
