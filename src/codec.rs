//! Wire codec for the `grpc.lb.v1.LoadBalancer` protocol.
//!
//! Converts between the crate-owned [`LbRequest`]/[`LbResponse`] types and
//! the generated prost types in [`pb`], keeping the generated code's shape
//! out of the rest of the crate the same way a codec module keeps a
//! third-party schema's shape out of calling code.

use crate::error::{Error, Result};
use crate::message::{LbRequest, LbResponse, RawServer};
use bytes::Bytes;

/// Generated `grpc.lb.v1` types, compiled from `proto/grpclb.proto` by
/// `build.rs`.
pub mod pb {
    tonic::include_proto!("grpc.lb.v1");
}

/// Encodes [`LbRequest`]s and decodes [`LbResponse`]s for the LB stream.
///
/// A trait rather than a single hardcoded implementation so the transport
/// layer can be tested against a fake codec without pulling in prost.
pub trait LbCodec: Send + Sync + 'static {
    /// Encode a request for the outbound half of the stream.
    fn encode_request(&self, request: &LbRequest) -> Result<Bytes>;

    /// Decode one response message from the inbound half of the stream.
    fn decode_response(&self, bytes: Bytes) -> Result<LbResponse>;
}

/// The concrete [`LbCodec`] shipped by this crate, built on prost.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstLbCodec;

impl LbCodec for ProstLbCodec {
    fn encode_request(&self, request: &LbRequest) -> Result<Bytes> {
        use prost::Message;

        let proto = match request {
            LbRequest::Initial { name } => pb::LoadBalanceRequest {
                load_balance_request_type: Some(
                    pb::load_balance_request::LoadBalanceRequestType::InitialRequest(
                        pb::InitialLoadBalanceRequest { name: name.clone() },
                    ),
                ),
            },
        };

        Ok(proto.encode_to_vec().into())
    }

    fn decode_response(&self, bytes: Bytes) -> Result<LbResponse> {
        use prost::Message;

        let proto =
            pb::LoadBalanceResponse::decode(bytes).map_err(|e| Error::Codec(e.to_string()))?;

        match proto.load_balance_response_type {
            Some(pb::load_balance_response::LoadBalanceResponseType::InitialResponse(init)) => {
                Ok(LbResponse::Initial {
                    client_stats_report_interval_seconds: init.client_stats_report_interval_seconds,
                })
            }
            Some(pb::load_balance_response::LoadBalanceResponseType::ServerList(list)) => {
                Ok(LbResponse::ServerList(
                    list.servers
                        .into_iter()
                        .map(|s| RawServer {
                            ip_address: Bytes::copy_from_slice(&s.ip_address),
                            port: s.port,
                            load_balance_token: s.load_balance_token,
                            drop: s.drop,
                        })
                        .collect(),
                ))
            }
            None => Err(Error::Codec(
                "LoadBalanceResponse carried neither an initial response nor a server list".into(),
            )),
        }
    }
}
