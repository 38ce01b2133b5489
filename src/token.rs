//! Splices a picked backend's LB token into the call's initial metadata.

use crate::message::LbToken;
use crate::rr::BackendHandle;

/// Well-known metadata key the LB token is attached under. The `-bin` suffix
/// is required by gRPC's metadata convention for binary-valued entries.
pub const LB_TOKEN_METADATA_KEY: &str = "lb-token-bin";

/// A caller-owned slot to receive the LB token, modeled as metadata the
/// caller controls. In a real channel implementation this would be the
/// initial-metadata batch itself; here it is exposed directly as
/// `tonic::metadata::MetadataMap` so the injector can be exercised without a
/// full call stack.
pub type InitialMetadata = tonic::metadata::MetadataMap;

/// Attach `backend`'s token to `metadata`, if a backend was chosen.
///
/// If `backend` is `None` (the pick completed with no chosen backend, e.g.
/// during shutdown drain) this is a no-op: there is no token to attach and
/// the caller observes "no backend" unchanged.
///
/// Every entry produced by [`decode`](crate::decode) carries at least the
/// empty-token sentinel, so a `Some(backend)` with no recorded token
/// indicates state corruption upstream; that is a programming error, not a
/// runtime condition callers can recover from, so this aborts the process
/// rather than returning an `Err` no caller could meaningfully act on.
pub fn inject(metadata: &mut InitialMetadata, backend: Option<&BackendHandle>) {
    let Some(backend) = backend else {
        return;
    };

    if backend.token == LbToken::EMPTY {
        return;
    }

    let key = tonic::metadata::MetadataKey::from_static(LB_TOKEN_METADATA_KEY);
    let value = tonic::metadata::MetadataValue::from_bytes(backend.token.as_bytes());
    metadata.append_bin(key, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn backend(token: &[u8]) -> BackendHandle {
        BackendHandle {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9090),
            token: LbToken::new(token.to_vec()),
        }
    }

    #[test]
    fn attaches_token_when_backend_chosen() {
        let mut metadata = InitialMetadata::new();
        inject(&mut metadata, Some(&backend(b"tok-1")));
        assert!(metadata.get_bin("lb-token-bin").is_some());
    }

    #[test]
    fn no_op_when_no_backend_chosen() {
        let mut metadata = InitialMetadata::new();
        inject(&mut metadata, None);
        assert!(metadata.get_bin("lb-token-bin").is_none());
    }

    #[test]
    fn no_op_for_empty_token_sentinel() {
        let mut metadata = InitialMetadata::new();
        let backend = BackendHandle {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9090),
            token: LbToken::EMPTY,
        };
        inject(&mut metadata, Some(&backend));
        assert!(metadata.get_bin("lb-token-bin").is_none());
    }
}
