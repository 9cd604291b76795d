use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use k256::pkcs8::EncodePublicKey;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::server::Grpc;
use tonic::Status;

use vault_coordinator::channel::proto;
use vault_coordinator::{
    derive, ChannelFactory, ClientCredential, CoordinatorError, DerivationPath, MasterKeyHandle,
    MessageDigest, NodeChannel, NodeError, NodeIdentity, NodeIndex, NodePool, SessionDescriptor,
    SessionDescriptorBuilder,
};

const KNOWN_KEY: &str = "known-key";
const LOCKED_KEY: &str = "locked-key";

/// Requires a client certificate and remembers the one presented.
#[derive(Debug)]
struct RecordingClientVerifier {
    provider: Arc<CryptoProvider>,
    presented: Mutex<Option<Vec<u8>>>,
}

impl RecordingClientVerifier {
    fn presented(&self) -> Option<Vec<u8>> {
        self.presented.lock().unwrap().clone()
    }
}

impl ClientCertVerifier for RecordingClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        *self.presented.lock().unwrap() = Some(end_entity.as_ref().to_vec());
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn node_public_key() -> k256::PublicKey {
    k256::SecretKey::from_slice(&[5u8; 32]).unwrap().public_key()
}

async fn generate_key(
    request: tonic::Request<proto::GenerateKeyRequest>,
) -> Result<tonic::Response<proto::GenerateKeyResponse>, Status> {
    let request = request.into_inner();
    let session = request
        .session
        .ok_or_else(|| Status::invalid_argument("missing session"))?;
    if request.threshold == 0 || request.threshold as usize > session.players.len() {
        return Err(Status::invalid_argument("threshold out of range"));
    }
    Ok(tonic::Response::new(proto::GenerateKeyResponse {
        key_id: format!("{}/{}/{}", session.session_id, request.curve, request.key_label),
    }))
}

async fn public_key(
    request: tonic::Request<proto::PublicKeyRequest>,
) -> Result<tonic::Response<proto::PublicKeyResponse>, Status> {
    let request = request.into_inner();
    if request.key_id != KNOWN_KEY {
        return Err(Status::not_found(format!("no key {}", request.key_id)));
    }
    let der = node_public_key().to_public_key_der().unwrap();
    Ok(tonic::Response::new(proto::PublicKeyResponse {
        public_key: der.as_bytes().to_vec(),
    }))
}

async fn sign(
    request: tonic::Request<proto::SignRequest>,
) -> Result<tonic::Response<proto::SignResponse>, Status> {
    let request = request.into_inner();
    if request.key_id == LOCKED_KEY {
        return Err(Status::permission_denied("key is locked"));
    }
    let session = request
        .session
        .ok_or_else(|| Status::invalid_argument("missing session"))?;

    // echo what arrived so the caller can check every field made it across
    let mut partial = session.session_id.into_bytes();
    partial.extend(request.chain_path.iter().flat_map(|c| c.to_be_bytes()));
    partial.extend(request.message_hash);
    Ok(tonic::Response::new(proto::SignResponse {
        partial_signature: partial,
    }))
}

async fn route(request: http::Request<Incoming>) -> Result<http::Response<BoxBody>, Infallible> {
    let response = match request.uri().path() {
        "/tsm.v1.ECDSA/GenerateKey" => {
            let mut grpc = Grpc::new(ProstCodec::<
                proto::GenerateKeyResponse,
                proto::GenerateKeyRequest,
            >::default());
            grpc.unary(tower::service_fn(generate_key), request).await
        }
        "/tsm.v1.ECDSA/PublicKey" => {
            let mut grpc = Grpc::new(ProstCodec::<
                proto::PublicKeyResponse,
                proto::PublicKeyRequest,
            >::default());
            grpc.unary(tower::service_fn(public_key), request).await
        }
        "/tsm.v1.ECDSA/Sign" => {
            let mut grpc =
                Grpc::new(ProstCodec::<proto::SignResponse, proto::SignRequest>::default());
            grpc.unary(tower::service_fn(sign), request).await
        }
        _ => {
            let mut response = http::Response::new(tonic::body::empty_body());
            *response.status_mut() = http::StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

struct TestNode {
    url: String,
    server_key_pem: String,
    verifier: Arc<RecordingClientVerifier>,
}

/// Serves the node service on a loopback port behind TLS with mandatory
/// client authentication.
async fn spawn_node() -> TestNode {
    let server = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(RecordingClientVerifier {
        provider: provider.clone(),
        presented: Mutex::new(None),
    });

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server.key_pair.serialize_der()));
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier.clone())
        .with_single_cert(vec![server.cert.der().clone()], key)
        .unwrap();
    config.alpn_protocols = vec![b"h2".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let service = TowerToHyperService::new(tower::service_fn(route));
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });

    TestNode {
        url: format!("https://127.0.0.1:{port}"),
        server_key_pem: server.key_pair.public_key_pem(),
        verifier,
    }
}

/// Client credential plus the DER of its certificate.
fn client_credential() -> (ClientCredential, Vec<u8>) {
    let client = rcgen::generate_simple_self_signed(vec!["coordinator".to_string()]).unwrap();
    let credential = ClientCredential::from_pem(
        client.cert.pem().as_bytes(),
        client.key_pair.serialize_pem().as_bytes(),
    )
    .unwrap();
    (credential, client.cert.der().to_vec())
}

fn identity(node: &TestNode, pinned_pem: String) -> Vec<NodeIdentity> {
    vec![NodeIdentity {
        index: NodeIndex(0),
        url: node.url.clone(),
        server_public_key_pem: pinned_pem,
    }]
}

fn session() -> SessionDescriptor {
    let keys = BTreeMap::from([(NodeIndex(0), vec![1, 2, 3])]);
    SessionDescriptorBuilder::new(1)
        .build_with_id("s-1", &[NodeIndex(0)], &keys)
        .unwrap()
}

async fn connect(node: &TestNode) -> (NodePool, Vec<u8>) {
    let (credential, client_der) = client_credential();
    let pool = ChannelFactory::new(identity(node, node.server_key_pem.clone()), credential)
        .connect_all()
        .await
        .unwrap();
    (pool, client_der)
}

#[tokio::test]
async fn pinned_channel_authenticates_both_sides_and_round_trips_calls() {
    let node = spawn_node().await;
    let (pool, client_der) = connect(&node).await;
    let channel = pool.get(NodeIndex(0)).unwrap();
    assert_eq!(channel.node(), NodeIndex(0));

    let key = channel
        .generate_key(&session(), 1, "secp256k1", "wallet")
        .await
        .unwrap();
    assert_eq!(key.as_str(), "s-1/secp256k1/wallet");

    // the node only answers after it has checked the client certificate
    assert_eq!(node.verifier.presented(), Some(client_der));

    let path = DerivationPath::new(vec![44, 60, 0, 0]);
    let derived = derive::public_key(channel.as_ref(), &MasterKeyHandle::new(KNOWN_KEY), &path)
        .await
        .unwrap();
    assert_eq!(derived.public_key(), &node_public_key());

    let digest = MessageDigest::new([9u8; 32]);
    let partial = channel
        .sign(&session(), &MasterKeyHandle::new(KNOWN_KEY), &path, &digest)
        .await
        .unwrap();
    let expected = [
        b"s-1".to_vec(),
        [44u32, 60, 0, 0].iter().flat_map(|c| c.to_be_bytes()).collect(),
        vec![9u8; 32],
    ]
    .concat();
    assert_eq!(partial.as_bytes(), expected.as_slice());
}

#[tokio::test]
async fn node_statuses_map_to_node_errors() {
    let node = spawn_node().await;
    let (pool, _) = connect(&node).await;
    let channel = pool.get(NodeIndex(0)).unwrap();
    let path = DerivationPath::new(vec![0]);

    assert_matches!(
        channel.public_key(&MasterKeyHandle::new("missing"), &path).await,
        Err(NodeError::UnknownKey(msg)) if msg.contains("missing")
    );
    assert_matches!(
        channel.generate_key(&session(), 0, "secp256k1", "").await,
        Err(NodeError::Rejected(_))
    );
    assert_matches!(
        channel
            .sign(&session(), &MasterKeyHandle::new(LOCKED_KEY), &path, &MessageDigest::new([0; 32]))
            .await,
        Err(NodeError::Status {
            code: tonic::Code::PermissionDenied,
            ..
        })
    );
    assert_matches!(
        derive::public_key(channel.as_ref(), &MasterKeyHandle::new("missing"), &path).await,
        Err(CoordinatorError::Derivation { node: NodeIndex(0), .. })
    );
}

#[tokio::test]
async fn mismatched_pin_fails_channel_setup() {
    let node = spawn_node().await;
    let stranger = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let (credential, _) = client_credential();

    let result = ChannelFactory::new(identity(&node, stranger.key_pair.public_key_pem()), credential)
        .connect_all()
        .await;

    assert_matches!(
        result,
        Err(CoordinatorError::ChannelSetup { node: NodeIndex(0), .. })
    );
}

#[tokio::test]
async fn lazy_channel_with_mismatched_pin_fails_on_first_call() {
    let node = spawn_node().await;
    let stranger = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let (credential, _) = client_credential();

    let pool = ChannelFactory::new(identity(&node, stranger.key_pair.public_key_pem()), credential)
        .connect_lazy()
        .unwrap();
    let channel = pool.get(NodeIndex(0)).unwrap();

    assert!(channel
        .public_key(&MasterKeyHandle::new(KNOWN_KEY), &DerivationPath::new(vec![0]))
        .await
        .is_err());
    assert_eq!(node.verifier.presented(), None);
}
