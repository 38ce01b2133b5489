//! Wire-agnostic data model for the grpclb protocol.
//!
//! These types are codec-agnostic and form the boundary between the
//! session/coordination logic and the generated prost types in `codec.rs`.
//! Nothing outside `codec.rs` ever touches the generated `grpc.lb.v1` types.

use bytes::Bytes;
use std::net::SocketAddr;

/// An opaque per-backend token echoed back to the LB service on every call
/// picked for that backend.
///
/// The empty token is a valid value: it means the LB service did not supply
/// one for this server, and the token injector treats it as "nothing to
/// inject".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LbToken(Bytes);

impl LbToken {
    /// The sentinel empty token, used when the server list entry carried no
    /// `load_balance_token`.
    pub const EMPTY: LbToken = LbToken(Bytes::new());

    /// Build a token from its wire bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw token bytes, as they should be spliced into call metadata.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// True if the LB service supplied no token for this server.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A server list entry as it arrives on the wire, before address validation.
///
/// `decode.rs` turns these into validated [`Server`] values, dropping any
/// entry whose `ip_address`/`port` do not form a usable socket address.
#[derive(Debug, Clone)]
pub struct RawServer {
    /// Resolved IPv4 (4 bytes) or IPv6 (16 bytes) address, network byte order.
    pub ip_address: Bytes,
    /// TCP port, expected in `1..=65535`.
    pub port: i32,
    /// Opaque per-call accounting token; empty if the LB service set none.
    pub load_balance_token: String,
    /// Deprecated drop-request flag, carried through for wire compatibility.
    pub drop: bool,
}

/// A validated, pickable backend, as produced by the decode module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// The backend's resolved socket address.
    pub address: SocketAddr,
    /// The token to echo back on calls picked for this backend.
    pub token: LbToken,
}

/// A decoded, validated list of pickable backends.
///
/// An empty `ServerList` is a meaningful, distinct state from "no list has
/// ever arrived": it means the LB service affirmatively reported zero usable
/// backends, which the policy core handles per the configured empty-list
/// policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerList(pub Vec<Server>);

impl ServerList {
    /// An empty list: zero usable backends.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// True if this list carries no pickable backends.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of pickable backends in this list.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the pickable backends in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Server> {
        self.0.iter()
    }
}

impl FromIterator<Server> for ServerList {
    fn from_iter<T: IntoIterator<Item = Server>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ServerList {
    type Item = Server;
    type IntoIter = std::vec::IntoIter<Server>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The requests the client may send on the `BalanceLoad` stream.
///
/// Only `Initial` is ever sent by this policy; `Stats` is reserved for the
/// load-reporting extension and is never constructed today.
#[derive(Debug, Clone)]
pub enum LbRequest {
    /// The single initial request, sent once when the stream opens.
    Initial {
        /// The name of the service the client wants to load balance for.
        name: String,
    },
}

/// The responses the server may send on the `BalanceLoad` stream.
#[derive(Debug, Clone)]
pub enum LbResponse {
    /// The initial response, expected at most once, first.
    Initial {
        /// Seconds between client stats reports; reserved, unused today.
        client_stats_report_interval_seconds: i64,
    },
    /// A replacement server list, superseding any previously received list.
    ServerList(Vec<RawServer>),
}
