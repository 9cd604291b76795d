use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::uri::PathAndQuery;
use http::Uri;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::ClientConfig;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tower::Service;

use super::pinning::PinnedServerKeyVerifier;
use super::proto;
use super::{ClientCredential, NodeChannel};
use crate::error::{CoordinatorError, NodeError};
use crate::session::SessionDescriptor;
use crate::types::{DerivationPath, MasterKeyHandle, MessageDigest, NodeIndex, PartialSignature};

const GENERATE_KEY: &str = "/tsm.v1.ECDSA/GenerateKey";
const PUBLIC_KEY: &str = "/tsm.v1.ECDSA/PublicKey";
const SIGN: &str = "/tsm.v1.ECDSA/Sign";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Node channel over gRPC with mutual TLS and a pinned server key.
#[derive(Clone)]
pub struct GrpcNodeChannel {
    node: NodeIndex,
    channel: Channel,
}

impl GrpcNodeChannel {
    /// Prepares the endpoint without touching the network; the TLS handshake
    /// happens on the first call.
    pub fn connect_lazy(
        node: NodeIndex,
        url: &str,
        pinned_spki: Vec<u8>,
        credential: &ClientCredential,
        request_timeout: Duration,
    ) -> Result<Self, CoordinatorError> {
        let (endpoint, target, tls) = prepare(node, url, pinned_spki, credential, request_timeout)?;
        let channel = endpoint.connect_with_connector_lazy(pinned_connector(target, tls));
        Ok(GrpcNodeChannel { node, channel })
    }

    /// Connects and completes the mutually authenticated handshake before returning.
    pub async fn connect(
        node: NodeIndex,
        url: &str,
        pinned_spki: Vec<u8>,
        credential: &ClientCredential,
        request_timeout: Duration,
    ) -> Result<Self, CoordinatorError> {
        let (endpoint, target, tls) = prepare(node, url, pinned_spki, credential, request_timeout)?;
        let channel = endpoint
            .connect_with_connector(pinned_connector(target, tls))
            .await
            .map_err(|e| CoordinatorError::ChannelSetup {
                node,
                reason: format!("handshake with {url} failed: {e}"),
            })?;
        tracing::debug!(node = node.0, url, "channel established");
        Ok(GrpcNodeChannel { node, channel })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, NodeError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| NodeError::Transport(format!("service was not ready: {e}")))?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await?;
        Ok(response.into_inner())
    }
}

fn prepare(
    node: NodeIndex,
    url: &str,
    pinned_spki: Vec<u8>,
    credential: &ClientCredential,
    request_timeout: Duration,
) -> Result<(Endpoint, Uri, ClientConfig), CoordinatorError> {
    let setup_error = |reason: String| CoordinatorError::ChannelSetup { node, reason };

    let target: Uri = url
        .parse()
        .map_err(|e| setup_error(format!("bad node url '{url}': {e}")))?;
    if target.scheme_str() != Some("https") {
        return Err(setup_error(format!("node url '{url}' must use https")));
    }
    let authority = target
        .authority()
        .ok_or_else(|| setup_error(format!("node url '{url}' has no host")))?;

    // The connector always dials `target` over TLS; the endpoint uri only shapes
    // the HTTP/2 requests.
    let endpoint = Endpoint::from_shared(format!("http://{authority}"))
        .map_err(|e| setup_error(format!("bad endpoint: {e}")))?
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(request_timeout);

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| setup_error(format!("tls setup: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerKeyVerifier::new(
            pinned_spki,
            provider,
        )))
        .with_client_auth_cert(credential.certificates().to_vec(), credential.private_key())
        .map_err(|e| setup_error(format!("client credential rejected: {e}")))?;

    Ok((endpoint, target, tls))
}

/// Dials the configured node over TLS whatever uri tonic asks for.
#[derive(Clone)]
struct PinnedConnector {
    https: HttpsConnector<HttpConnector>,
    target: Uri,
}

impl Service<Uri> for PinnedConnector {
    type Response = <HttpsConnector<HttpConnector> as Service<Uri>>::Response;
    type Error = <HttpsConnector<HttpConnector> as Service<Uri>>::Error;
    type Future = <HttpsConnector<HttpConnector> as Service<Uri>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.https.poll_ready(cx)
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        self.https.call(self.target.clone())
    }
}

fn pinned_connector(target: Uri, tls: ClientConfig) -> PinnedConnector {
    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_only()
        .enable_http2()
        .build();
    PinnedConnector { https, target }
}

#[tonic::async_trait]
impl NodeChannel for GrpcNodeChannel {
    fn node(&self) -> NodeIndex {
        self.node
    }

    async fn generate_key(
        &self,
        session: &SessionDescriptor,
        threshold: u32,
        curve: &str,
        key_label: &str,
    ) -> Result<MasterKeyHandle, NodeError> {
        let request = proto::GenerateKeyRequest {
            session: Some(session.into()),
            threshold,
            curve: curve.to_string(),
            key_label: key_label.to_string(),
        };
        let response: proto::GenerateKeyResponse = self.unary(GENERATE_KEY, request).await?;
        if response.key_id.is_empty() {
            return Err(NodeError::MalformedResponse("empty key id".into()));
        }
        Ok(MasterKeyHandle::new(response.key_id))
    }

    async fn public_key(
        &self,
        key: &MasterKeyHandle,
        path: &DerivationPath,
    ) -> Result<Vec<u8>, NodeError> {
        let request = proto::PublicKeyRequest {
            key_id: key.as_str().to_string(),
            chain_path: path.as_slice().to_vec(),
        };
        let response: proto::PublicKeyResponse = self.unary(PUBLIC_KEY, request).await?;
        Ok(response.public_key)
    }

    async fn sign(
        &self,
        session: &SessionDescriptor,
        key: &MasterKeyHandle,
        path: &DerivationPath,
        digest: &MessageDigest,
    ) -> Result<PartialSignature, NodeError> {
        let request = proto::SignRequest {
            session: Some(session.into()),
            key_id: key.as_str().to_string(),
            chain_path: path.as_slice().to_vec(),
            message_hash: digest.as_bytes().to_vec(),
        };
        let response: proto::SignResponse = self.unary(SIGN, request).await?;
        if response.partial_signature.is_empty() {
            return Err(NodeError::MalformedResponse("empty partial signature".into()));
        }
        Ok(PartialSignature::new(response.partial_signature))
    }
}
