//! The client channel: a virtual, persistent connection to a service.
//!
//! A channel owns a name resolver and a load-balancing policy, both driven
//! by a single worker task that serializes their callbacks. The policy
//! publishes immutable picker snapshots behind an atomic pointer; call
//! binding re-picks against each newly published snapshot until it obtains a
//! connected subchannel. Channels idle out after a period with no activity
//! and are revived by the next call.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::call::driver::{Binder, BoundStream, ClientCallConfig};
use crate::call::{self, Call, Side};
use crate::client::backoff::{BackoffConfig, ExponentialBackoff};
use crate::client::load_balancing::{
    ChannelController, LbConfig, LbPolicy, LbPolicyOptions, LbState, Pick, PickArgs, PickResult,
    SubchannelState, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::{
    global_registry, Address, AuthorityOverride, Resolver, ResolverBuilder, ResolverController,
    ResolverOptions, ResolverUpdate, Target,
};
use crate::client::service_config::ServiceConfig;
use crate::client::subchannel::{
    HealthCheckConfig, InternalSubchannel, Subchannel, SubchannelKey, SubchannelPool,
    SubchannelWatcher, GLOBAL_SUBCHANNEL_POOL,
};
use crate::client::{ConnectivityState, WorkScheduler};
use crate::completion::CompletionQueue;
use crate::metadata::Metadata;
use crate::rt::{default_runtime, BoxedTaskHandle, SharedRuntime};
use crate::transport::{Transport, GLOBAL_TRANSPORT_REGISTRY};
use crate::{Code, Status};

/// Configuration for a [`Channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    /// Overrides the `:authority` used for RPCs on this channel.
    pub default_authority: Option<String>,
    /// Connection backoff parameters applied to this channel's subchannels.
    pub backoff: BackoffConfig,
    /// How long the channel may sit with no calls before entering IDLE.
    pub idle_timeout: Duration,
    pub max_send_message_size: usize,
    pub max_recv_message_size: usize,
    /// Byte budget for buffering outbound messages for retries and hedging.
    pub retry_buffer_size: usize,
    /// Disables retries and hedging even when the service config asks for
    /// them.
    pub disable_retries: bool,
    /// Use a channel-local subchannel pool instead of the process-wide one.
    pub use_local_subchannel_pool: bool,
    /// Enables subchannel health checking against the named service.
    pub health_check_service_name: Option<String>,
    /// A service config to use when the resolver does not supply one.
    pub default_service_config: Option<String>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            default_authority: None,
            backoff: BackoffConfig::default(),
            idle_timeout: Duration::from_secs(30 * 60),
            max_send_message_size: call::DEFAULT_MAX_SEND_MESSAGE_SIZE,
            max_recv_message_size: call::DEFAULT_MAX_RECV_MESSAGE_SIZE,
            retry_buffer_size: call::DEFAULT_RETRY_BUFFER_SIZE,
            disable_retries: false,
            use_local_subchannel_pool: false,
            health_check_service_name: None,
            default_service_config: None,
        }
    }
}

/// Per-call options supplied at call creation.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Absolute deadline for the call.
    pub deadline: Option<Instant>,
    /// Converts transient pick failures into queuing instead of failing the
    /// call. Defaults to the service config's value, or false.
    pub wait_for_ready: Option<bool>,
    /// Overrides the `:authority` for this call only.
    pub authority: Option<String>,
}

/// A client channel. Cheap to clone; all clones share the same underlying
/// state.
///
/// Channel creation cannot fail: if the target string is invalid or names an
/// unknown scheme, the returned channel fails every RPC with a sanitized
/// `Internal` status.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<PersistentChannel>,
}

impl Channel {
    pub fn new(target: &str, options: ChannelOptions) -> Channel {
        let parsed = Target::from_str(target);
        let (target_err, resolver_builder, parsed_target) = match parsed {
            Ok(t) => match global_registry().get(t.scheme()) {
                Some(b) => (None, Some(b), Some(t)),
                None => (
                    Some(format!("no resolver for scheme {:?}", t.scheme())),
                    None,
                    Some(t),
                ),
            },
            Err(e) => (Some(format!("invalid target {target:?}: {e}")), None, None),
        };

        let default_authority = options.default_authority.clone().unwrap_or_else(|| {
            match (&resolver_builder, &parsed_target) {
                (Some(b), Some(t)) => b.default_authority(t),
                _ => String::new(),
            }
        });

        let pool = if options.use_local_subchannel_pool {
            Arc::new(SubchannelPool::new())
        } else {
            GLOBAL_SUBCHANNEL_POOL.clone()
        };

        let args_fingerprint = fingerprint_args(&options);
        let default_config = options
            .default_service_config
            .as_deref()
            .and_then(|json| match ServiceConfig::parse(json) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("invalid default service config: {e}");
                    None
                }
            });

        Channel {
            inner: Arc::new(PersistentChannel {
                target: parsed_target,
                target_err,
                resolver_builder,
                default_authority,
                options,
                args_fingerprint,
                pool,
                runtime: default_runtime(),
                state: Mutex::new(PersistentState {
                    active: None,
                    shutdown: false,
                }),
                connectivity: watch::Sender::new(ConnectivityState::Idle),
                config: Mutex::new(ConfigState {
                    config: default_config,
                    is_default: true,
                    error: None,
                }),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The current aggregated connectivity state. With `connect` set, an
    /// IDLE channel begins connecting.
    pub fn state(&self, connect: bool) -> ConnectivityState {
        if connect {
            let _ = self.inner.ensure_active();
        }
        *self.inner.connectivity.borrow()
    }

    /// Waits (up to `deadline`) for the state to move away from `last_seen`.
    /// Returns false on timeout.
    pub async fn wait_for_state_change(
        &self,
        last_seen: ConnectivityState,
        deadline: Instant,
    ) -> bool {
        let mut rx = self.inner.connectivity.subscribe();
        let wait = async {
            rx.wait_for(|s| *s != last_seen).await.is_ok()
        };
        tokio::select! {
            changed = wait => changed,
            _ = crate::rt::sleep_until(&self.inner.runtime, deadline) => false,
        }
    }

    /// Starts a call on this channel. The returned call fails with
    /// `Cancelled` if the channel has been shut down.
    pub fn create_call(&self, path: &str, options: CallOptions, cq: CompletionQueue) -> Call {
        self.inner.create_call(path, options, cq)
    }

    /// Shuts the channel down: no new calls may be started and in-flight
    /// calls observe cancellation.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// The resolved default authority for this channel.
    pub fn default_authority(&self) -> &str {
        &self.inner.default_authority
    }
}

struct ConfigState {
    config: Option<ServiceConfig>,
    /// The current config came from ChannelOptions, not the resolver.
    is_default: bool,
    /// Set when the resolver produced a config error and no previous good
    /// config exists.
    error: Option<Status>,
}

struct PersistentState {
    active: Option<Arc<ActiveChannel>>,
    shutdown: bool,
}

struct PersistentChannel {
    target: Option<Target>,
    target_err: Option<String>,
    resolver_builder: Option<Arc<dyn ResolverBuilder>>,
    default_authority: String,
    options: ChannelOptions,
    args_fingerprint: u64,
    pool: Arc<SubchannelPool>,
    runtime: SharedRuntime,
    state: Mutex<PersistentState>,
    connectivity: watch::Sender<ConnectivityState>,
    config: Mutex<ConfigState>,
    calls: Mutex<Vec<Weak<call::CallInner>>>,
}

/// The live half of a channel: exists whenever the channel is not IDLE.
struct ActiveChannel {
    work_tx: mpsc::UnboundedSender<WorkItem>,
    picker: ArcSwap<LbState>,
    picker_version: watch::Sender<u64>,
    last_activity: Mutex<Instant>,
    worker_task: Mutex<Option<BoxedTaskHandle>>,
    idle_task: Mutex<Option<BoxedTaskHandle>>,
}

impl std::fmt::Debug for ActiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveChannel").finish_non_exhaustive()
    }
}

impl ActiveChannel {
    fn publish_picker(&self, state: LbState) {
        self.picker.store(Arc::new(state));
        self.picker_version.send_modify(|v| *v += 1);
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

impl Drop for ActiveChannel {
    fn drop(&mut self) {
        if let Some(task) = self.worker_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.idle_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

enum WorkItem {
    ResolverWork,
    ResolveNow,
    SubchannelUpdate(Subchannel, SubchannelState),
    LbWork,
}

impl PersistentChannel {
    fn shutdown(self: &Arc<Self>) {
        let active = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            state.active.take()
        };
        drop(active);
        let _ = self.connectivity.send(ConnectivityState::Shutdown);
        let calls = std::mem::take(&mut *self.calls.lock().unwrap());
        for weak in calls {
            if let Some(call) = weak.upgrade() {
                call.cancel(Status::cancelled("channel shutdown"));
            }
        }
    }

    fn enter_idle(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        if state.active.take().is_some() {
            debug!("channel entering idle");
            let _ = self.connectivity.send(ConnectivityState::Idle);
        }
    }

    fn ensure_active(self: &Arc<Self>) -> Result<Arc<ActiveChannel>, Status> {
        if let Some(err) = &self.target_err {
            return Err(Status::internal(err.clone()).sanitize_control_plane());
        }
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(Status::cancelled("channel shutdown"));
        }
        if let Some(active) = &state.active {
            return Ok(active.clone());
        }

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let active = Arc::new(ActiveChannel {
            work_tx: work_tx.clone(),
            picker: ArcSwap::new(Arc::new(LbState::initial())),
            picker_version: watch::Sender::new(0),
            last_activity: Mutex::new(Instant::now()),
            worker_task: Mutex::new(None),
            idle_task: Mutex::new(None),
        });

        let worker = Worker::new(self.clone(), Arc::downgrade(&active), work_tx);
        let worker_task = self
            .runtime
            .spawn(Box::pin(worker.run(work_rx)));
        *active.worker_task.lock().unwrap() = Some(worker_task);

        // The idle timer watches for a quiet period with no unfinished calls.
        let idle_timeout = self.options.idle_timeout;
        let persistent = Arc::downgrade(self);
        let active_weak = Arc::downgrade(&active);
        let runtime = self.runtime.clone();
        let idle_task = self.runtime.spawn(Box::pin(async move {
            loop {
                runtime.sleep(idle_timeout).await;
                let (Some(persistent), Some(active)) =
                    (persistent.upgrade(), active_weak.upgrade())
                else {
                    return;
                };
                let quiet = active.last_activity.lock().unwrap().elapsed() >= idle_timeout;
                if quiet && !persistent.has_live_calls() {
                    persistent.enter_idle();
                    return;
                }
            }
        }));
        *active.idle_task.lock().unwrap() = Some(idle_task);

        let _ = self.connectivity.send(ConnectivityState::Connecting);
        state.active = Some(active.clone());
        Ok(active)
    }

    fn has_live_calls(&self) -> bool {
        let mut calls = self.calls.lock().unwrap();
        calls.retain(|weak| {
            weak.upgrade()
                .is_some_and(|call| call.terminal.get().is_none())
        });
        !calls.is_empty()
    }

    fn create_call(self: &Arc<Self>, path: &str, options: CallOptions, cq: CompletionQueue) -> Call {
        // Kick the channel out of idle; binding also does this, but doing it
        // here makes `create_call` the traffic signal the idle timer sees.
        let activation = self.ensure_active();
        if let Ok(active) = &activation {
            active.touch();
        }

        let config = self.config.lock().unwrap();
        let method_config = config
            .config
            .as_ref()
            .and_then(|c| c.method_config(path))
            .cloned();
        drop(config);

        let deadline = effective_deadline(
            options.deadline,
            method_config.as_ref().and_then(|mc| mc.timeout),
        );
        let wait_for_ready = options
            .wait_for_ready
            .or(method_config.as_ref().and_then(|mc| mc.wait_for_ready))
            .unwrap_or(false);

        let (call, send_rx, recv_rx) = Call::new(
            Side::Client,
            path.to_string(),
            cq,
            deadline,
            self.runtime.clone(),
        );

        match activation {
            Ok(_) => {}
            Err(status) => {
                // The channel is shut down or unusable: the call starts dead,
                // and every batch on it completes with ok=false.
                call.cancel(status);
            }
        }

        self.calls.lock().unwrap().push(Arc::downgrade(call.inner()));

        let max_send = method_config
            .as_ref()
            .and_then(|mc| mc.max_request_message_bytes)
            .unwrap_or(self.options.max_send_message_size)
            .min(self.options.max_send_message_size);
        let retry_policy = if self.options.disable_retries {
            None
        } else {
            method_config.as_ref().and_then(|mc| mc.retry_policy.clone())
        };
        let hedging_policy = if self.options.disable_retries {
            None
        } else {
            method_config
                .as_ref()
                .and_then(|mc| mc.hedging_policy.clone())
        };

        let max_recv = method_config
            .as_ref()
            .and_then(|mc| mc.max_response_message_bytes)
            .unwrap_or(self.options.max_recv_message_size)
            .min(self.options.max_recv_message_size);
        let binder = Arc::new(ChannelBinder {
            persistent: self.clone(),
            path: path.to_string(),
            authority_override: options.authority,
            wait_for_ready,
            deadline,
        });

        crate::call::driver::start_client_driver(
            call.inner(),
            ClientCallConfig {
                binder,
                retry_policy,
                hedging_policy,
                retry_buffer_limit: self.options.retry_buffer_size,
                max_send_message_size: max_send,
                max_recv_message_size: max_recv,
            },
            send_rx,
            recv_rx,
        );
        call
    }
}

fn effective_deadline(
    call_deadline: Option<Instant>,
    config_timeout: Option<Duration>,
) -> Option<Instant> {
    let from_config = config_timeout.map(|t| Instant::now() + t);
    match (call_deadline, from_config) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn fingerprint_args(options: &ChannelOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    options.health_check_service_name.hash(&mut hasher);
    options.backoff.base_delay.hash(&mut hasher);
    options.backoff.max_delay.hash(&mut hasher);
    options.backoff.multiplier.to_bits().hash(&mut hasher);
    options.backoff.jitter.to_bits().hash(&mut hasher);
    hasher.finish()
}

// ===== binding calls to transport streams =====

struct ChannelBinder {
    persistent: Arc<PersistentChannel>,
    path: String,
    authority_override: Option<String>,
    wait_for_ready: bool,
    deadline: Option<Instant>,
}

#[async_trait]
impl Binder for ChannelBinder {
    async fn bind(&self, metadata: Metadata) -> Result<BoundStream, Status> {
        loop {
            {
                let config = self.persistent.config.lock().unwrap();
                if let Some(error) = &config.error {
                    if !self.wait_for_ready {
                        return Err(error.clone());
                    }
                }
            }
            let active = self.persistent.ensure_active()?;
            active.touch();

            // Subscribe before loading so a picker published in between is
            // not missed.
            let mut version_rx = active.picker_version.subscribe();
            let lb = active.picker.load_full();

            let result = lb.picker.pick(&PickArgs {
                path: &self.path,
                metadata: &metadata,
            });
            match result {
                PickResult::Pick(pick) => {
                    match self.try_open(&pick, &metadata).await {
                        Ok(bound) => return Ok(bound),
                        Err(status) => {
                            // The picked subchannel raced a disconnection;
                            // wait for a fresh picker.
                            trace!(code = ?status.code(), "pick failed to produce a stream");
                        }
                    }
                }
                PickResult::Queue => {}
                PickResult::Fail(status) => {
                    if !self.wait_for_ready {
                        return Err(Status::new(
                            Code::Unavailable,
                            status.message().to_string(),
                        ));
                    }
                }
                PickResult::Drop(status) => {
                    return Err(status.sanitize_control_plane());
                }
            }

            if version_rx.changed().await.is_err() {
                return Err(Status::unavailable("channel became idle"));
            }
        }
    }
}

impl ChannelBinder {
    async fn try_open(&self, pick: &Pick, metadata: &Metadata) -> Result<BoundStream, Status> {
        let transport = pick
            .subchannel
            .connected_transport()
            .ok_or_else(|| Status::unavailable("picked subchannel is not connected"))?;

        let authority = self.resolve_authority(&pick.subchannel.address());
        let mut md = metadata.clone();
        md.merge(pick.metadata.clone());

        let timeout = self
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()));
        let stream = transport
            .open_stream(crate::transport::ClientStreamHead {
                path: self.path.clone(),
                authority: authority.clone(),
                timeout,
                metadata: md,
            })
            .await?;
        Ok(BoundStream {
            stream,
            peer: transport.peer(),
            authority,
        })
    }

    /// Authority precedence: call-level override, channel default-authority
    /// option, per-address attribute, then the resolver's derived authority.
    /// An empty per-address attribute counts as absent.
    fn resolve_authority(&self, address: &Address) -> String {
        if let Some(authority) = &self.authority_override {
            return authority.clone();
        }
        if self.persistent.options.default_authority.is_some() {
            return self.persistent.default_authority.clone();
        }
        if let Some(AuthorityOverride(authority)) = address.attributes.get::<AuthorityOverride>() {
            if !authority.is_empty() {
                return authority.clone();
            }
        }
        self.persistent.default_authority.clone()
    }
}

// ===== the worker =====

struct ResolverWorkScheduler {
    work_tx: mpsc::UnboundedSender<WorkItem>,
}

impl WorkScheduler for ResolverWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.work_tx.send(WorkItem::ResolverWork);
    }
}

struct LbWorkScheduler {
    work_tx: mpsc::UnboundedSender<WorkItem>,
}

impl WorkScheduler for LbWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.work_tx.send(WorkItem::LbWork);
    }
}

struct ChannelSubchannelWatcher {
    subchannel: crate::client::subchannel::WeakSubchannel,
    work_tx: mpsc::UnboundedSender<WorkItem>,
}

impl SubchannelWatcher for ChannelSubchannelWatcher {
    fn on_state_change(&self, state: SubchannelState) {
        // Updates for a subchannel the LB policy has already dropped are
        // inconsequential.
        if let Some(subchannel) = self.subchannel.upgrade() {
            let _ = self
                .work_tx
                .send(WorkItem::SubchannelUpdate(subchannel, state));
        }
    }
}

/// The single task that owns the resolver and LB policy and serializes all
/// of their callbacks.
struct Worker {
    persistent: Arc<PersistentChannel>,
    /// Weak so that dropping the ActiveChannel (idle, shutdown) is what ends
    /// this worker, not the other way around.
    active: Weak<ActiveChannel>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    resolver: Option<Box<dyn Resolver>>,
    lb: Option<(String, Box<dyn LbPolicy>)>,
    lb_config: Option<LbConfig>,
}

impl Worker {
    fn new(
        persistent: Arc<PersistentChannel>,
        active: Weak<ActiveChannel>,
        work_tx: mpsc::UnboundedSender<WorkItem>,
    ) -> Self {
        Self {
            persistent,
            active,
            work_tx,
            resolver: None,
            lb: None,
            lb_config: None,
        }
    }

    async fn run(mut self, mut work_rx: mpsc::UnboundedReceiver<WorkItem>) {
        let builder = self
            .persistent
            .resolver_builder
            .clone()
            .expect("active channel without resolver builder");
        let target = self
            .persistent
            .target
            .clone()
            .expect("active channel without target");
        self.resolver = Some(builder.build(
            &target,
            ResolverOptions {
                authority: self.persistent.default_authority.clone(),
                work_scheduler: Arc::new(ResolverWorkScheduler {
                    work_tx: self.work_tx.clone(),
                }),
            },
        ));

        while let Some(item) = work_rx.recv().await {
            match item {
                WorkItem::ResolverWork => {
                    let mut resolver = self.resolver.take().expect("resolver missing");
                    resolver.work(&mut self);
                    self.resolver = Some(resolver);
                }
                WorkItem::ResolveNow => {
                    let mut resolver = self.resolver.take().expect("resolver missing");
                    resolver.resolve_now();
                    self.resolver = Some(resolver);
                }
                WorkItem::SubchannelUpdate(subchannel, state) => {
                    if let Some((name, mut policy)) = self.lb.take() {
                        let mut controller = WorkerController::for_worker(&self);
                        policy.subchannel_update(&subchannel, &state, &mut controller);
                        self.lb = Some((name, policy));
                    }
                }
                WorkItem::LbWork => {
                    if let Some((name, mut policy)) = self.lb.take() {
                        let mut controller = WorkerController::for_worker(&self);
                        policy.work(&mut controller);
                        self.lb = Some((name, policy));
                    }
                }
            }
        }
    }

    fn handle_resolver_update(&mut self, update: ResolverUpdate) -> Result<(), crate::Error> {
        // Service config first: it decides the LB policy.
        match &update.service_config {
            Ok(Some(config)) => {
                let mut state = self.persistent.config.lock().unwrap();
                state.config = Some(config.clone());
                state.is_default = false;
                state.error = None;
            }
            Ok(None) => {
                let mut state = self.persistent.config.lock().unwrap();
                if !state.is_default {
                    state.config = None;
                }
                state.error = None;
            }
            Err(e) => {
                let mut state = self.persistent.config.lock().unwrap();
                if state.config.is_none() {
                    state.error = Some(
                        Status::internal(format!("invalid service config: {e}"))
                            .sanitize_control_plane(),
                    );
                }
                // A previous good config keeps being used otherwise.
            }
        }

        let choice = {
            let state = self.persistent.config.lock().unwrap();
            state
                .config
                .as_ref()
                .and_then(|c| c.lb_policy.clone())
        };
        let (policy_name, policy_json) = match choice {
            Some(choice) => (choice.name, choice.config),
            None => ("pick_first".to_string(), None),
        };

        if self.lb.as_ref().map(|(name, _)| name.as_str()) != Some(policy_name.as_str()) {
            let builder = GLOBAL_LB_REGISTRY
                .get_policy(&policy_name)
                .expect("service config chose an unregistered LB policy");
            debug!(policy = %policy_name, "building LB policy");
            let policy = builder.build(LbPolicyOptions {
                work_scheduler: Arc::new(LbWorkScheduler {
                    work_tx: self.work_tx.clone(),
                }),
                runtime: self.persistent.runtime.clone(),
            });
            self.lb = Some((policy_name.clone(), policy));
            self.lb_config = None;
        }

        if let Some(json) = policy_json {
            let builder = GLOBAL_LB_REGISTRY
                .get_policy(&policy_name)
                .expect("policy disappeared from the registry");
            match builder.parse_config(&json) {
                Ok(config) => self.lb_config = config,
                Err(e) => warn!(policy = %policy_name, "invalid LB config: {e}"),
            }
        }

        let (name, mut policy) = self.lb.take().expect("LB policy just installed");
        let mut controller = WorkerController::for_worker(&self);
        let result = policy.resolver_update(update, self.lb_config.as_ref(), &mut controller);
        self.lb = Some((name, policy));
        result
    }
}

impl ResolverController for Worker {
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, crate::Error> {
        ServiceConfig::parse(config).map_err(Into::into)
    }

    fn update(&mut self, update: ResolverUpdate) -> Result<(), crate::Error> {
        self.handle_resolver_update(update)
    }
}

/// The LB-facing controller handed into policy callbacks.
struct WorkerController {
    persistent: Arc<PersistentChannel>,
    active: Weak<ActiveChannel>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
}

impl WorkerController {
    fn for_worker(worker: &Worker) -> Self {
        Self {
            persistent: worker.persistent.clone(),
            active: worker.active.clone(),
            work_tx: worker.work_tx.clone(),
        }
    }
}

impl ChannelController for WorkerController {
    fn new_subchannel(&mut self, address: &Address) -> Subchannel {
        let persistent = &self.persistent;
        let key = SubchannelKey::new(address.clone(), persistent.args_fingerprint);
        let isc = persistent.pool.lookup(&key).unwrap_or_else(|| {
            let transport = GLOBAL_TRANSPORT_REGISTRY
                .get_transport(address.network_type)
                .unwrap_or_else(|| Arc::new(UnknownNetworkTransport));
            let backoff = Arc::new(
                ExponentialBackoff::new(persistent.options.backoff.clone())
                    .unwrap_or_else(|_| {
                        ExponentialBackoff::new(BackoffConfig::default()).unwrap()
                    }),
            );
            let health_check = persistent
                .options
                .health_check_service_name
                .clone()
                .map(|service_name| HealthCheckConfig { service_name });
            let pool = persistent.pool.clone();
            let isc = InternalSubchannel::new(
                key.clone(),
                transport,
                backoff,
                health_check,
                Box::new(move |key| pool.unregister(&key)),
                persistent.runtime.clone(),
            );
            persistent.pool.register(&key, isc)
        });

        let subchannel = Subchannel::new(isc);
        subchannel.attach_watcher(Arc::new(ChannelSubchannelWatcher {
            subchannel: subchannel.downgrade(),
            work_tx: self.work_tx.clone(),
        }));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        let Some(active) = self.active.upgrade() else {
            // The channel went idle under us; nothing to publish to.
            return;
        };
        let state = update.connectivity_state;
        active.publish_picker(update);
        let _ = self.persistent.connectivity.send(state);
    }

    fn request_resolution(&mut self) {
        let _ = self.work_tx.send(WorkItem::ResolveNow);
    }
}

/// Stands in for a transport when the resolver produced an address of a
/// network type no registered transport can dial.
struct UnknownNetworkTransport;

#[async_trait]
impl Transport for UnknownNetworkTransport {
    async fn connect(
        &self,
        address: String,
        _runtime: SharedRuntime,
        _opts: &crate::transport::TransportOptions,
    ) -> Result<crate::transport::ConnectedTransport, String> {
        Err(format!("no transport registered for address {address}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Attributes;

    fn binder_for(channel: &Channel, authority_override: Option<String>) -> ChannelBinder {
        ChannelBinder {
            persistent: channel.inner.clone(),
            path: "/test.Service/Method".to_string(),
            authority_override,
            wait_for_ready: false,
            deadline: None,
        }
    }

    fn address_with_authority(authority: &str) -> Address {
        Address {
            address: "10.0.0.1:443".to_string(),
            attributes: Attributes::new().with(AuthorityOverride(authority.to_string())),
            ..Default::default()
        }
    }

    #[test]
    fn authority_precedence_call_override_wins() {
        let channel = Channel::new(
            "static:///1.2.3.4:443",
            ChannelOptions {
                default_authority: Some("channel.example.com".to_string()),
                ..Default::default()
            },
        );
        let binder = binder_for(&channel, Some("call.example.com".to_string()));
        assert_eq!(
            binder.resolve_authority(&address_with_authority("addr.example.com")),
            "call.example.com"
        );
    }

    #[test]
    fn authority_precedence_channel_option_beats_address() {
        let channel = Channel::new(
            "static:///1.2.3.4:443",
            ChannelOptions {
                default_authority: Some("channel.example.com".to_string()),
                ..Default::default()
            },
        );
        let binder = binder_for(&channel, None);
        assert_eq!(
            binder.resolve_authority(&address_with_authority("addr.example.com")),
            "channel.example.com"
        );
    }

    #[test]
    fn authority_precedence_address_attribute_beats_resolver() {
        let channel = Channel::new("static:///1.2.3.4:443", ChannelOptions::default());
        let binder = binder_for(&channel, None);
        assert_eq!(
            binder.resolve_authority(&address_with_authority("addr.example.com")),
            "addr.example.com"
        );
    }

    #[test]
    fn empty_authority_attribute_is_absent() {
        let channel = Channel::new("static:///1.2.3.4:443", ChannelOptions::default());
        let binder = binder_for(&channel, None);
        // Falls through to the resolver-derived authority.
        assert_eq!(
            binder.resolve_authority(&address_with_authority("")),
            "1.2.3.4:443"
        );
    }

    #[test]
    fn invalid_target_reports_error_on_activation() {
        let channel = Channel::new("not a target", ChannelOptions::default());
        let err = channel.inner.ensure_active().unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn unknown_scheme_reports_error_on_activation() {
        let channel = Channel::new("bogus:///nowhere", ChannelOptions::default());
        let err = channel.inner.ensure_active().unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn state_starts_idle_and_connects_on_demand() {
        let channel = Channel::new("static:///127.0.0.1:1", ChannelOptions::default());
        assert_eq!(channel.state(false), ConnectivityState::Idle);
        assert_eq!(channel.state(true), ConnectivityState::Connecting);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let channel = Channel::new("static:///127.0.0.1:1", ChannelOptions::default());
        channel.shutdown();
        assert_eq!(channel.state(false), ConnectivityState::Shutdown);
        assert!(channel.inner.ensure_active().is_err());
    }

    #[test]
    fn effective_deadline_takes_the_earlier() {
        let now = Instant::now();
        let call = Some(now + Duration::from_secs(10));
        let got = effective_deadline(call, Some(Duration::from_secs(1))).unwrap();
        assert!(got < now + Duration::from_secs(2));
        assert_eq!(effective_deadline(call, None), call);
        assert_eq!(effective_deadline(None, None), None);
    }
}
