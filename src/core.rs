//! The policy core: a single coordinator lock serializing picks, pings,
//! server-list handover, and connectivity reporting.
//!
//! Structurally this plays the role the teacher's worker plays for the ADS
//! stream, but where `client/worker.rs` drives everything through an mpsc
//! actor loop, here callers invoke `pick`/`ping`/`exit_idle`/etc. directly
//! and a `Mutex<Inner>` stands in for the actor's exclusive ownership — the
//! operations this crate exposes are call/response, not fire-and-forget
//! events, so a directly callable core avoids a request/response dance over
//! a channel for every pick.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::codec::LbCodec;
use crate::config::{EmptyServerListPolicy, GrpclbConfig};
use crate::error::{Error, Result};
use crate::message::ServerList;
use crate::queue::{PendingQueues, PickFlags, PickSlot};
use crate::rr::{self, BackendHandle, ConnectivityState, PickOutcome as RrPickOutcome, RoundRobinChild};
use crate::session::{LBSession, SharedDeadline};
use crate::token::{self, InitialMetadata};
use crate::transport::Transport;

/// Arguments to a [`PolicyCore::pick`] call.
///
/// Per §3, a pick carries the caller's initial-metadata handle (so the
/// chosen backend's LB token can be spliced into it before the pick
/// resolves), whether that handle actually has a token-storage slot
/// available, caller-defined flags matched by
/// [`PolicyCore::cancel_picks`], and the call's deadline, which becomes the
/// policy's session deadline per §6.1.
pub struct PickArgs {
    /// Caller-defined flags, matched by [`PolicyCore::cancel_picks`].
    pub flags: PickFlags,
    /// The call's initial-metadata handle. Handed back (possibly with an
    /// LB-token entry appended) alongside the pick outcome.
    pub initial_metadata: InitialMetadata,
    /// Whether `initial_metadata` has a token-storage slot the injector can
    /// write into. A pick whose caller cannot accept a token fails fast
    /// with [`Error::MissingTokenStorage`] rather than being enqueued.
    pub has_token_storage: bool,
    /// The call's deadline, if any. The most recent pick's deadline becomes
    /// the policy's session deadline (§6.1).
    pub deadline: Option<Instant>,
}

/// Outcome of a [`PolicyCore::pick`] call.
pub enum PickOutcome {
    /// Resolved without suspending. `Ok(None)` only happens when the policy
    /// is draining at shutdown. Carries back the caller's initial metadata,
    /// with an LB-token entry spliced in when a backend was chosen.
    Immediate(InitialMetadata, Result<Option<BackendHandle>>),
    /// Will resolve asynchronously. `slot` is `Some` only while the pick is
    /// still enqueued (no RR yet) and can be targeted by
    /// [`PolicyCore::cancel_pick`]/[`PolicyCore::cancel_picks`]; once a pick
    /// is forwarded to an RR, cancellation is the RR's own concern.
    Deferred {
        slot: Option<PickSlot>,
        result: oneshot::Receiver<(InitialMetadata, Result<Option<BackendHandle>>)>,
    },
}

/// Outcome of a [`PolicyCore::ping`] call.
pub enum PingOutcome {
    Immediate(Result<()>),
    Deferred(oneshot::Receiver<Result<()>>),
}

type StateWaiter = Box<dyn FnOnce(ConnectivityState, Option<String>) + Send>;

struct Inner {
    rr: Option<Arc<dyn RoundRobinChild>>,
    pending: PendingQueues<BackendHandle>,
    state: ConnectivityState,
    last_error: Option<String>,
    state_waiters: Vec<StateWaiter>,
    started_picking: bool,
    shutting_down: bool,
    session: Option<LBSession>,
}

/// The grpclb policy's coordination core.
///
/// One instance per load-balanced channel. Always held behind an `Arc` (see
/// [`PolicyCore::new`]) so callbacks delivered from the LB session and from
/// the adopted RR can hold a weak self-reference, per the reference
/// discipline: those callbacks must not keep the policy alive on their own.
pub struct PolicyCore<T, C> {
    config: GrpclbConfig,
    transport: Arc<T>,
    codec: Arc<C>,
    self_weak: Weak<Self>,
    /// The session deadline, per §6.1 taken from the most recent pick's
    /// deadline. Shared with the [`LBSession`] so a (re)connect can attach
    /// it to the streaming call.
    deadline: SharedDeadline,
    inner: Mutex<Inner>,
}

impl<T, C> PolicyCore<T, C>
where
    T: Transport,
    C: LbCodec,
{
    /// Construct a policy core. Picking does not begin until the first
    /// [`pick`](Self::pick) or [`exit_idle`](Self::exit_idle) call.
    pub fn new(config: GrpclbConfig, transport: Arc<T>, codec: Arc<C>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            transport,
            codec,
            self_weak: weak.clone(),
            deadline: Arc::new(Mutex::new(None)),
            inner: Mutex::new(Inner {
                rr: None,
                pending: PendingQueues::new(),
                state: ConnectivityState::Idle,
                last_error: None,
                state_waiters: Vec::new(),
                started_picking: false,
                shutting_down: false,
                session: None,
            }),
        })
    }

    /// Select a backend for one outgoing call.
    ///
    /// Fails fast with [`Error::MissingTokenStorage`], without enqueueing
    /// anything, when `args.has_token_storage` is `false` (§4.5).
    pub fn pick(&self, args: PickArgs) -> PickOutcome {
        let PickArgs {
            flags,
            mut initial_metadata,
            has_token_storage,
            deadline,
        } = args;

        if !has_token_storage {
            return PickOutcome::Immediate(initial_metadata, Err(Error::MissingTokenStorage));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            return PickOutcome::Immediate(initial_metadata, Err(Error::ChannelShutdown));
        }

        *self.deadline.lock().unwrap() = deadline;

        if let Some(rr) = inner.rr.clone() {
            drop(inner);
            return match rr.pick() {
                RrPickOutcome::Immediate(result) => {
                    token::inject(&mut initial_metadata, result.as_ref().ok());
                    PickOutcome::Immediate(initial_metadata, result.map(Some))
                }
                RrPickOutcome::Deferred(rx) => {
                    let (tx, result) = oneshot::channel();
                    tokio::spawn(async move {
                        let outcome = rx.await.unwrap_or(Err(Error::ChannelShutdown));
                        let mut metadata = initial_metadata;
                        token::inject(&mut metadata, outcome.as_ref().ok());
                        let _ = tx.send((metadata, outcome.map(Some)));
                    });
                    PickOutcome::Deferred { slot: None, result }
                }
            };
        }

        let (tx, result) = oneshot::channel();
        let slot = inner.pending.enqueue_pick(
            flags,
            initial_metadata,
            deadline,
            Box::new(move |metadata, outcome| {
                let _ = tx.send((metadata, outcome));
            }),
        );
        self.maybe_start_picking(&mut inner);
        drop(inner);
        PickOutcome::Deferred {
            slot: Some(slot),
            result,
        }
    }

    /// Ping the backend an RR would currently select.
    pub fn ping(&self) -> PingOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            return PingOutcome::Immediate(Err(Error::ChannelShutdown));
        }

        if let Some(rr) = inner.rr.clone() {
            drop(inner);
            return match rr.ping() {
                RrPickOutcome::Immediate(result) => PingOutcome::Immediate(result.map(|_| ())),
                RrPickOutcome::Deferred(rx) => {
                    let (tx, result) = oneshot::channel();
                    tokio::spawn(async move {
                        let outcome = rx.await.unwrap_or(Err(Error::ChannelShutdown));
                        let _ = tx.send(outcome.map(|_| ()));
                    });
                    PingOutcome::Deferred(result)
                }
            };
        }

        let (tx, result) = oneshot::channel();
        inner.pending.enqueue_ping(Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }));
        self.maybe_start_picking(&mut inner);
        drop(inner);
        PingOutcome::Deferred(result)
    }

    /// Cancel one enqueued pick by the slot [`pick`](Self::pick) returned.
    /// No-op if the pick already completed or was already forwarded to an
    /// RR.
    pub fn cancel_pick(&self, target: PickSlot, error: Error) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .pending
            .cancel_by_target_slot(target, move || error.clone());
    }

    /// Cancel every enqueued pick whose flags, masked by `mask`, equal
    /// `needle`.
    pub fn cancel_picks(&self, mask: PickFlags, needle: PickFlags, error: Error) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .pending
            .cancel_by_flag_mask(mask, needle, move || error.clone());
    }

    /// Begin picking without waiting for an actual pick call, so an idle
    /// channel starts warming up its LB session proactively.
    pub fn exit_idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_start_picking(&mut inner);
        if let Some(rr) = inner.rr.clone() {
            drop(inner);
            rr.exit_idle();
        }
    }

    /// Current aggregate connectivity state and, if in `TransientFailure`,
    /// the associated error.
    pub fn check_connectivity(&self) -> (ConnectivityState, Option<String>) {
        let inner = self.inner.lock().unwrap();
        (inner.state, inner.last_error.clone())
    }

    /// Edge-triggered subscription to the next aggregate state change.
    pub fn notify_on_state_change(&self, continuation: StateWaiter) {
        let mut inner = self.inner.lock().unwrap();
        inner.state_waiters.push(continuation);
    }

    /// Tear the policy down: no further picks are served, the LB session is
    /// cancelled, and every pending pick/ping completes with no backend
    /// chosen (not an error — shutdown while nothing was enqueued yet is not
    /// a fault in the caller).
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            return;
        }
        inner.shutting_down = true;
        inner.rr = None;
        inner.session = None;

        let picks = inner.pending.drain_picks();
        let pings = inner.pending.drain_pings();
        let waiters = set_state_locked(
            &mut inner,
            ConnectivityState::Shutdown,
            Some("channel shutdown".to_string()),
        );
        drop(inner);

        for pick in picks {
            (pick.continuation)(pick.initial_metadata, Ok(None));
        }
        for ping in pings {
            (ping.continuation)(Ok(()));
        }
        for waiter in waiters {
            waiter(ConnectivityState::Shutdown, Some("channel shutdown".to_string()));
        }
    }

    fn maybe_start_picking(&self, inner: &mut Inner) {
        if inner.started_picking || inner.shutting_down {
            return;
        }
        inner.started_picking = true;

        let weak = self.self_weak.clone();
        let session = LBSession::start(
            self.config.service_name.clone(),
            self.transport.clone(),
            self.codec.clone(),
            self.config.backoff.clone(),
            self.deadline.clone(),
            move |list| {
                if let Some(policy) = weak.upgrade() {
                    policy.handover(list);
                }
            },
        );
        inner.session = Some(session);
    }

    /// Adopt (or reject) a freshly decoded server list as the current RR,
    /// draining any picks/pings that were waiting for one.
    fn handover(&self, list: ServerList) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            return;
        }

        if list.is_empty() {
            match self.config.empty_server_list_policy {
                EmptyServerListPolicy::KeepServing => {
                    tracing::debug!("empty server list, keeping existing RR in place");
                    return;
                }
                EmptyServerListPolicy::MarkUnavailable => {
                    tracing::debug!("empty server list, tearing down existing RR");
                    inner.rr = None;
                    let waiters = set_state_locked(&mut inner, ConnectivityState::Idle, None);
                    drop(inner);
                    for waiter in waiters {
                        waiter(ConnectivityState::Idle, None);
                    }
                    return;
                }
            }
        }

        let new_rr = match rr::build(&list) {
            Ok(rr) => rr,
            Err(error) => {
                tracing::warn!(%error, "failed to build RR from server list, keeping existing RR");
                return;
            }
        };

        let (new_state, new_error) = new_rr.check_connectivity();
        if matches!(
            new_state,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown
        ) {
            tracing::debug!(?new_state, "new RR unusable on arrival, keeping existing RR");
            return;
        }

        inner.rr = Some(new_rr.clone());
        new_rr.exit_idle();
        self.subscribe_rr(&new_rr);

        let picks = inner.pending.drain_picks();
        let pings = inner.pending.drain_pings();
        let waiters = set_state_locked(&mut inner, new_state, new_error.clone());
        drop(inner);

        for pick in picks {
            forward_pick(new_rr.clone(), pick.initial_metadata, pick.continuation);
        }
        for ping in pings {
            forward_ping(new_rr.clone(), ping.continuation);
        }
        for waiter in waiters {
            waiter(new_state, new_error.clone());
        }
    }

    fn subscribe_rr(&self, rr: &Arc<dyn RoundRobinChild>) {
        let weak_self = self.self_weak.clone();
        let weak_rr = Arc::downgrade(rr);
        rr.notify_on_state_change(Box::new(move |state, error| {
            if let Some(policy) = weak_self.upgrade() {
                policy.on_rr_state_change(weak_rr, state, error);
            }
        }));
    }

    /// Reacts to a state edge from the currently adopted RR.
    ///
    /// When the RR itself reports `Shutdown` (§4.4), only `inner.rr` is
    /// cleared and the subscription is dropped — the aggregate
    /// `PolicyState` is left untouched, since invariant I5 reserves
    /// `Shutdown` for the policy's own shutdown path, not for an inner RR
    /// being torn down and replaced.
    fn on_rr_state_change(
        &self,
        weak_rr: Weak<dyn RoundRobinChild>,
        new_state: ConnectivityState,
        error: Option<String>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            return;
        }
        let Some(current) = inner.rr.clone() else {
            return;
        };
        let Some(subscribed) = weak_rr.upgrade() else {
            return;
        };
        if !Arc::ptr_eq(&current, &subscribed) {
            // A newer RR has since been adopted; this edge belongs to one
            // already replaced.
            return;
        }

        if matches!(new_state, ConnectivityState::Shutdown) {
            inner.rr = None;
            drop(inner);
            return;
        }

        let waiters = set_state_locked(&mut inner, new_state, error.clone());
        drop(inner);

        self.subscribe_rr(&subscribed);
        for waiter in waiters {
            waiter(new_state, error.clone());
        }
    }
}

fn set_state_locked(
    inner: &mut Inner,
    state: ConnectivityState,
    error: Option<String>,
) -> Vec<StateWaiter> {
    inner.state = state;
    inner.last_error = error;
    std::mem::take(&mut inner.state_waiters)
}

fn forward_pick(
    rr: Arc<dyn RoundRobinChild>,
    initial_metadata: InitialMetadata,
    continuation: Box<dyn FnOnce(InitialMetadata, Result<Option<BackendHandle>>) + Send>,
) {
    match rr.pick() {
        RrPickOutcome::Immediate(result) => {
            let mut metadata = initial_metadata;
            token::inject(&mut metadata, result.as_ref().ok());
            continuation(metadata, result.map(Some));
        }
        RrPickOutcome::Deferred(rx) => {
            tokio::spawn(async move {
                let outcome = rx.await.unwrap_or(Err(Error::ChannelShutdown));
                let mut metadata = initial_metadata;
                token::inject(&mut metadata, outcome.as_ref().ok());
                continuation(metadata, outcome.map(Some));
            });
        }
    }
}

fn forward_ping(rr: Arc<dyn RoundRobinChild>, continuation: Box<dyn FnOnce(Result<()>) + Send>) {
    match rr.ping() {
        RrPickOutcome::Immediate(result) => continuation(result.map(|_| ())),
        RrPickOutcome::Deferred(rx) => {
            tokio::spawn(async move {
                let outcome = rx.await.unwrap_or(Err(Error::ChannelShutdown));
                continuation(outcome.map(|_| ()));
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProstLbCodec;
    use crate::message::{LbToken, Server};
    use crate::transport::{Transport as TransportTrait, TransportStream};
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// A transport whose single stream yields one scripted server-list
    /// message and then blocks forever, so a test can observe exactly one
    /// handover without the session reconnecting underneath it.
    struct OneShotTransport {
        message: StdMutex<Option<Bytes>>,
    }

    struct OneShotStream {
        message: Option<Bytes>,
    }

    impl TransportTrait for OneShotTransport {
        type Stream = OneShotStream;

        async fn new_stream(
            &self,
            _initial_request: Bytes,
            _timeout: Option<Duration>,
        ) -> Result<Self::Stream> {
            Ok(OneShotStream {
                message: self.message.lock().unwrap().take(),
            })
        }
    }

    impl TransportStream for OneShotStream {
        async fn send(&mut self, _request: Bytes) -> Result<()> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Bytes>> {
            match self.message.take() {
                Some(bytes) => Ok(Some(bytes)),
                None => std::future::pending().await,
            }
        }
    }

    fn server_list_message() -> Bytes {
        use crate::codec::pb;
        use prost::Message;
        pb::LoadBalanceResponse {
            load_balance_response_type: Some(
                pb::load_balance_response::LoadBalanceResponseType::ServerList(pb::ServerList {
                    servers: vec![pb::Server {
                        ip_address: vec![10, 0, 0, 5],
                        port: 7070,
                        load_balance_token: "tok".to_string(),
                        drop: false,
                    }],
                }),
            ),
        }
        .encode_to_vec()
        .into()
    }

    fn core() -> Arc<PolicyCore<OneShotTransport, ProstLbCodec>> {
        let config = GrpclbConfig::new("svc", vec!["http://lb:443".into()]).unwrap();
        let transport = Arc::new(OneShotTransport {
            message: StdMutex::new(Some(server_list_message())),
        });
        let codec = Arc::new(ProstLbCodec);
        PolicyCore::new(config, transport, codec)
    }

    fn pick_args() -> PickArgs {
        PickArgs {
            flags: 0,
            initial_metadata: InitialMetadata::new(),
            has_token_storage: true,
            deadline: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pick_before_any_list_enqueues_then_resolves() {
        let policy = core();
        match policy.pick(pick_args()) {
            PickOutcome::Deferred { slot, result } => {
                assert!(slot.is_some());
                let (_metadata, outcome) = tokio::time::timeout(Duration::from_secs(5), result)
                    .await
                    .unwrap()
                    .unwrap();
                let backend = outcome.unwrap().unwrap();
                assert_eq!(
                    backend.address,
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 7070)
                );
            }
            PickOutcome::Immediate(..) => panic!("expected a deferred pick"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pick_after_list_adopted_resolves_immediately() {
        let policy = core();
        let first = policy.pick(pick_args());
        let PickOutcome::Deferred { result, .. } = first else {
            panic!("expected deferred")
        };
        result.await.unwrap();

        match policy.pick(pick_args()) {
            PickOutcome::Immediate(_metadata, Ok(Some(backend))) => {
                assert_eq!(backend.token, LbToken::new(b"tok".to_vec()));
            }
            _ => panic!("expected an immediate pick once an RR is adopted"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_pick_carries_lb_token_in_initial_metadata() {
        let policy = core();
        let first = policy.pick(pick_args());
        let PickOutcome::Deferred { result, .. } = first else {
            panic!("expected deferred")
        };
        result.await.unwrap();

        match policy.pick(pick_args()) {
            PickOutcome::Immediate(metadata, Ok(Some(_))) => {
                assert!(metadata.get_bin(crate::token::LB_TOKEN_METADATA_KEY).is_some());
            }
            _ => panic!("expected an immediate pick once an RR is adopted"),
        }
    }

    #[tokio::test]
    async fn pick_without_token_storage_fails_fast_without_enqueueing() {
        let policy = core();
        let mut args = pick_args();
        args.has_token_storage = false;
        match policy.pick(args) {
            PickOutcome::Immediate(_metadata, Err(Error::MissingTokenStorage)) => {}
            _ => panic!("expected an immediate MissingTokenStorage failure"),
        }
    }

    #[tokio::test]
    async fn cancel_pick_completes_with_cancelled_error_before_any_rr() {
        let config = GrpclbConfig::new("svc", vec!["http://lb:443".into()]).unwrap();
        let transport = Arc::new(OneShotTransport {
            message: StdMutex::new(None),
        });
        let codec = Arc::new(ProstLbCodec);
        let policy = PolicyCore::new(config, transport, codec);

        let PickOutcome::Deferred { slot, result } = policy.pick(pick_args()) else {
            panic!("expected deferred");
        };
        policy.cancel_pick(slot.unwrap(), Error::ChannelShutdown);
        let (_metadata, outcome) = result.await.unwrap();
        assert!(matches!(outcome, Err(Error::PickCancelled(_))));
    }

    #[tokio::test]
    async fn shutdown_drains_pending_picks_with_no_backend() {
        let config = GrpclbConfig::new("svc", vec!["http://lb:443".into()]).unwrap();
        let transport = Arc::new(OneShotTransport {
            message: StdMutex::new(None),
        });
        let codec = Arc::new(ProstLbCodec);
        let policy = PolicyCore::new(config, transport, codec);

        let PickOutcome::Deferred { result, .. } = policy.pick(pick_args()) else {
            panic!("expected deferred");
        };
        policy.shutdown();
        let (_metadata, outcome) = result.await.unwrap();
        assert!(outcome.unwrap().is_none());
        assert_eq!(policy.check_connectivity().0, ConnectivityState::Shutdown);
    }

    fn list_with(server: Server) -> ServerList {
        std::iter::once(server).collect()
    }

    #[test]
    fn server_helper_builds_single_entry_list() {
        let list = list_with(Server {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1),
            token: LbToken::EMPTY,
        });
        assert_eq!(list.len(), 1);
    }
}
