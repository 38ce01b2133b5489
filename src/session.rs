//! Drives one streaming LB call and reconnects with backoff when it ends.
//!
//! Structurally this is the same state machine as the teacher's
//! `AdsWorker::run`/`run_connected` pair, simplified for a session that
//! multiplexes exactly one resource type (the server list) instead of an
//! arbitrary set of xDS type URLs, and callback-driven instead of
//! channel-driven so it composes with `core.rs`'s single coordinator lock.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::codec::LbCodec;
use crate::decode::decode;
use crate::message::{LbRequest, LbResponse, ServerList};
use crate::retry::{Backoff, BackoffPolicy};
use crate::transport::{Transport, TransportStream};

/// The session deadline, shared with whoever is updating it on each pick
/// (per §6.1, "the session deadline is taken from the most recent pick's
/// deadline"). `None` means no deadline is currently in effect.
pub type SharedDeadline = Arc<Mutex<Option<Instant>>>;

/// Coarse state of one LB session, mirroring the Idle/Starting/Streaming/
/// Cooling state machine. Exposed for diagnostics; nothing outside this
/// module branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Cooling,
}

/// A running (or cooling-down) LB session.
///
/// Dropping or calling [`shutdown`](Self::shutdown) cancels the underlying
/// task; the teardown this triggers never runs any caller-supplied
/// continuation under a lock the caller is holding, since it all happens on
/// the spawned task.
pub struct LBSession {
    shutdown_tx: Option<oneshot::Sender<()>>,
    state: Arc<Mutex<SessionState>>,
    handle: tokio::task::JoinHandle<()>,
}

impl LBSession {
    /// Start a session against `service_name`, calling `on_list` under no
    /// lock of its own each time a *new* (distinct from the previous)
    /// server list arrives with at least one entry consulted by the
    /// empty-list policy upstream — an empty decoded list is still passed
    /// through so the caller can apply its configured policy.
    pub fn start<T, C>(
        service_name: String,
        transport: Arc<T>,
        codec: Arc<C>,
        backoff_policy: BackoffPolicy,
        deadline: SharedDeadline,
        on_list: impl Fn(ServerList) + Send + Sync + 'static,
    ) -> Self
    where
        T: Transport,
        C: LbCodec,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(SessionState::Idle));

        let handle = tokio::spawn(run(
            service_name,
            transport,
            codec,
            backoff_policy,
            deadline,
            on_list,
            shutdown_rx,
            state.clone(),
        ));

        Self {
            shutdown_tx: Some(shutdown_tx),
            state,
            handle,
        }
    }

    /// Cancel the session. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Current coarse session state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }
}

impl Drop for LBSession {
    fn drop(&mut self) {
        self.shutdown();
        self.handle.abort();
    }
}

async fn run<T, C>(
    service_name: String,
    transport: Arc<T>,
    codec: Arc<C>,
    backoff_policy: BackoffPolicy,
    deadline: SharedDeadline,
    on_list: impl Fn(ServerList) + Send + Sync + 'static,
    mut shutdown_rx: oneshot::Receiver<()>,
    state: Arc<Mutex<SessionState>>,
) where
    T: Transport,
    C: LbCodec,
{
    let mut backoff = Backoff::new(backoff_policy);
    let mut last_list: Option<ServerList> = None;

    loop {
        *state.lock().unwrap() = SessionState::Starting;

        let initial = LbRequest::Initial {
            name: service_name.clone(),
        };
        let request_bytes = match codec.encode_request(&initial) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(%error, "failed to encode initial LB request, session cannot start");
                return;
            }
        };

        let timeout = deadline
            .lock()
            .unwrap()
            .map(|d| d.saturating_duration_since(Instant::now()));

        let stream = tokio::select! {
            res = transport.new_stream(request_bytes, timeout) => res,
            _ = &mut shutdown_rx => {
                *state.lock().unwrap() = SessionState::Idle;
                return;
            }
        };

        let mut stream = match stream {
            Ok(stream) => {
                backoff.reset();
                stream
            }
            Err(error) => {
                tracing::warn!(%error, "LB transport connection failed, backing off");
                if !sleep_or_shutdown(&mut shutdown_rx, backoff.step()).await {
                    return;
                }
                continue;
            }
        };

        *state.lock().unwrap() = SessionState::Streaming;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    *state.lock().unwrap() = SessionState::Idle;
                    return;
                }
                message = stream.recv() => {
                    match message {
                        Ok(Some(bytes)) => {
                            handle_message(&codec, bytes, &mut backoff, &mut last_list, &on_list);
                        }
                        Ok(None) => {
                            tracing::debug!("LB stream ended");
                            break;
                        }
                        Err(error) => {
                            tracing::warn!(%error, "LB stream error");
                            break;
                        }
                    }
                }
            }
        }

        *state.lock().unwrap() = SessionState::Cooling;
        if !sleep_or_shutdown(&mut shutdown_rx, backoff.step()).await {
            return;
        }
    }
}

fn handle_message<C: LbCodec>(
    codec: &C,
    bytes: bytes::Bytes,
    backoff: &mut Backoff,
    last_list: &mut Option<ServerList>,
    on_list: &impl Fn(ServerList),
) {
    match codec.decode_response(bytes) {
        Ok(LbResponse::Initial {
            client_stats_report_interval_seconds,
        }) => {
            tracing::debug!(
                client_stats_report_interval_seconds,
                "received initial LB response"
            );
        }
        Ok(LbResponse::ServerList(raw)) => {
            let decoded = decode(&raw);
            if decoded.is_empty() && !raw.is_empty() {
                tracing::warn!("server list decoded to zero usable entries, all were invalid");
            }
            if last_list.as_ref() == Some(&decoded) {
                tracing::trace!("server list unchanged, discarding");
                return;
            }
            if !decoded.is_empty() {
                backoff.reset();
            }
            *last_list = Some(decoded.clone());
            on_list(decoded);
        }
        Err(error) => {
            tracing::warn!(%error, "invalid LB response, dropping message");
        }
    }
}

async fn sleep_or_shutdown(shutdown_rx: &mut oneshot::Receiver<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx => false,
    }
}
