//! Streaming transport for the `BalanceLoad` RPC.
//!
//! Mirrors the teacher's split between a connection-agnostic `Transport`
//! trait and a concrete tonic-backed implementation: the session logic in
//! `session.rs` only ever talks to [`Transport`]/[`TransportStream`], never
//! to a [`tonic::transport::Channel`] directly, so it can be driven in tests
//! by a transport that never touches the network.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tonic::transport::Channel;

use crate::codec::pb::load_balancer_client::LoadBalancerClient;
use crate::error::{Error, Result};

const LB_CHANNEL_BUFFER_SIZE: usize = 16;

/// Opens streaming calls to the LB service.
///
/// An external collaborator per the policy's own design: the one concrete
/// implementation here ([`TonicLbTransport`]) exists so the crate runs
/// end-to-end, but the session logic is generic over this trait.
pub trait Transport: Send + Sync + 'static {
    /// The bidirectional stream this transport opens.
    type Stream: TransportStream;

    /// Open a new `BalanceLoad` call and send `initial_request` as the first
    /// outbound message.
    ///
    /// `timeout`, when present, is the policy's current session deadline
    /// (§6.1: "the session deadline is taken from the most recent pick's
    /// deadline") expressed as a duration from now; implementations that can
    /// attach a per-call deadline to the underlying transport should do so.
    fn new_stream(
        &self,
        initial_request: Bytes,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// One open, bidirectional `BalanceLoad` call.
pub trait TransportStream: Send + 'static {
    /// Send one more request message (reserved for the client-stats
    /// extension; the initial request goes through [`Transport::new_stream`]).
    fn send(&mut self, request: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Receive the next response message, or `None` on a clean end of
    /// stream.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// `tonic`-backed [`Transport`] over the generated `LoadBalancer` client.
///
/// Like the teacher's `TonicTransport`, this passes raw bytes through a
/// pass-through codec rather than letting tonic decode directly into the
/// generated message types, so `codec.rs` stays the single place that knows
/// about the wire schema.
#[derive(Clone, Debug)]
pub struct TonicLbTransport {
    channel: Channel,
}

impl TonicLbTransport {
    /// Wrap an existing tonic [`Channel`]. Use this for custom channel
    /// configuration (TLS, load balancing across balancer addresses, etc.).
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// Connect to a single LB service endpoint with default channel
    /// settings.
    pub async fn connect(uri: impl Into<String>) -> Result<Self> {
        let uri: String = uri.into();
        let channel = Channel::from_shared(uri)
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self { channel })
    }
}

impl Transport for TonicLbTransport {
    type Stream = TonicLbStream;

    async fn new_stream(&self, initial_request: Bytes, timeout: Option<Duration>) -> Result<Self::Stream> {
        let mut client = LoadBalancerClient::new(self.channel.clone());

        let (tx, rx) = mpsc::channel::<Bytes>(LB_CHANNEL_BUFFER_SIZE);

        // Yield the initial request first so it is available the moment the
        // server polls the stream, then fall through to anything sent later
        // (the reserved client-stats half of the protocol).
        let initial_stream = tokio_stream::iter(std::iter::once(initial_request));
        let channel_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let request_stream = initial_stream.chain(channel_stream).map(RawRequest);

        let mut request = tonic::Request::new(request_stream);
        if let Some(timeout) = timeout {
            request.set_timeout(timeout);
        }

        let response = client.balance_load(request).await.map_err(Error::Transport)?;

        Ok(TonicLbStream {
            sender: tx,
            receiver: response.into_inner(),
        })
    }
}

/// A bidirectional `BalanceLoad` call backed by tonic.
#[derive(Debug)]
pub struct TonicLbStream {
    sender: mpsc::Sender<Bytes>,
    receiver: tonic::Streaming<RawResponse>,
}

impl TransportStream for TonicLbStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::LbCallEnded("outbound channel closed".into()))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.receiver.message().await {
            Ok(msg) => Ok(msg.map(|RawResponse(bytes)| bytes)),
            Err(status) => Err(Error::Transport(status)),
        }
    }
}

/// Pass-through `prost::Message` wrapper so the generic `tonic::Streaming`
/// machinery can move raw, already-encoded bytes without re-decoding them
/// into the generated types. `codec.rs` does that decoding itself.
#[derive(Debug, Clone)]
struct RawRequest(Bytes);

impl prost::Message for RawRequest {
    fn encode_raw(&self, buf: &mut impl bytes::BufMut) {
        buf.put_slice(&self.0);
    }

    fn merge_field(
        &mut self,
        _tag: u32,
        _wire_type: prost::encoding::wire_type::WireType,
        _buf: &mut impl bytes::Buf,
        _ctx: prost::encoding::DecodeContext,
    ) -> std::result::Result<(), prost::DecodeError> {
        unreachable!("RawRequest is only ever encoded, never decoded")
    }

    fn encoded_len(&self) -> usize {
        self.0.len()
    }

    fn clear(&mut self) {
        self.0 = Bytes::new();
    }
}

#[derive(Debug, Clone, Default)]
struct RawResponse(Bytes);

impl prost::Message for RawResponse {
    fn encode_raw(&self, buf: &mut impl bytes::BufMut) {
        buf.put_slice(&self.0);
    }

    fn merge_field(
        &mut self,
        _tag: u32,
        _wire_type: prost::encoding::wire_type::WireType,
        buf: &mut impl bytes::Buf,
        _ctx: prost::encoding::DecodeContext,
    ) -> std::result::Result<(), prost::DecodeError> {
        self.0 = buf.copy_to_bytes(buf.remaining());
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        self.0.len()
    }

    fn clear(&mut self) {
        self.0 = Bytes::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pb::load_balancer_server::{LoadBalancer, LoadBalancerServer};
    use crate::codec::pb::{
        load_balance_request::LoadBalanceRequestType, load_balance_response::LoadBalanceResponseType,
        LoadBalanceRequest, LoadBalanceResponse, Server as PbServer, ServerList as PbServerList,
    };
    use crate::codec::{LbCodec, ProstLbCodec};
    use crate::message::{LbRequest, LbResponse};
    use std::net::SocketAddr;
    use std::pin::Pin;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tokio_stream::Stream;
    use tonic::{Request, Response, Status};

    struct MockLbServer;

    #[tonic::async_trait]
    impl LoadBalancer for MockLbServer {
        type BalanceLoadStream =
            Pin<Box<dyn Stream<Item = std::result::Result<LoadBalanceResponse, Status>> + Send>>;

        async fn balance_load(
            &self,
            request: Request<tonic::Streaming<LoadBalanceRequest>>,
        ) -> std::result::Result<Response<Self::BalanceLoadStream>, Status> {
            let mut inbound = request.into_inner();

            let outbound = async_stream::try_stream! {
                while let Some(req) = inbound.next().await {
                    let req = req?;
                    if let Some(LoadBalanceRequestType::InitialRequest(_)) = req.load_balance_request_type {
                        yield LoadBalanceResponse {
                            load_balance_response_type: Some(LoadBalanceResponseType::ServerList(
                                PbServerList {
                                    servers: vec![PbServer {
                                        ip_address: vec![127, 0, 0, 1],
                                        port: 9090,
                                        load_balance_token: "tok-mock".to_string(),
                                        drop: false,
                                    }],
                                },
                            )),
                        };
                    }
                }
            };

            Ok(Response::new(Box::pin(outbound)))
        }
    }

    async fn start_mock_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(LoadBalancerServer::new(MockLbServer))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        addr
    }

    #[tokio::test]
    async fn connects_and_receives_server_list() {
        let addr = start_mock_server().await;
        let uri = format!("http://{addr}");

        let transport = TonicLbTransport::connect(&uri).await.unwrap();

        let codec = ProstLbCodec;
        let request_bytes = codec
            .encode_request(&LbRequest::Initial {
                name: "my-service".to_string(),
            })
            .unwrap();

        let mut stream = transport.new_stream(request_bytes, None).await.unwrap();

        let response_bytes = stream.recv().await.unwrap().unwrap();
        match codec.decode_response(response_bytes).unwrap() {
            LbResponse::ServerList(servers) => {
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].port, 9090);
                assert_eq!(servers[0].load_balance_token, "tok-mock");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
