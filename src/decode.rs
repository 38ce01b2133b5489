//! Validates a decoded server list into pickable backends.
//!
//! This is a pure function deliberately kept free of any async or locking
//! concerns: [`session.rs`](crate::session) calls it synchronously each time
//! a `ServerList` message arrives off the wire.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::message::{LbToken, RawServer, Server, ServerList};

/// Validate and convert wire-decoded server entries into pickable backends.
///
/// Each entry is validated independently: an invalid `port` or an
/// `ip_address` that is neither 4 nor 16 bytes is rejected and logged, but
/// does not invalidate the rest of the list. Entries with `drop` set are
/// never pickable and are also rejected, since there is no current consumer
/// of the deprecated drop-request signal.
///
/// Returns an empty [`ServerList`] iff zero entries validated; callers treat
/// that as "do not build an RR" rather than as a decode failure.
pub fn decode(raw: &[RawServer]) -> ServerList {
    raw.iter().filter_map(decode_one).collect()
}

fn decode_one(raw: &RawServer) -> Option<Server> {
    if raw.drop {
        tracing::debug!("dropping server list entry with drop=true");
        return None;
    }

    let port = match u16::try_from(raw.port) {
        Ok(port) => port,
        Err(_) => {
            tracing::warn!(port = raw.port, "rejecting server with invalid port");
            return None;
        }
    };

    let address = match raw.ip_address.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&raw.ip_address);
            SocketAddr::new(Ipv4Addr::from(octets).into(), port)
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw.ip_address);
            SocketAddr::new(Ipv6Addr::from(octets).into(), port)
        }
        len => {
            tracing::warn!(len, "rejecting server with invalid address length");
            return None;
        }
    };

    let token = if raw.load_balance_token.is_empty() {
        LbToken::EMPTY
    } else {
        LbToken::new(raw.load_balance_token.clone().into_bytes())
    };

    Some(Server { address, token })
}
