//! Server public-key pinning for node channels.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error, SignatureScheme};
use x509_parser::prelude::{FromDer, X509Certificate};

const PUBLIC_KEY_LABEL: &str = "PUBLIC KEY";

/// Decodes a PEM `PUBLIC KEY` block, parses it as a P-256 or secp256k1
/// SubjectPublicKeyInfo and re-encodes it into canonical DER, the form compared
/// against server certificates during the handshake.
pub fn canonical_public_key_der(pem: &str) -> Result<Vec<u8>, String> {
    let (rest, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| format!("no PEM block: {e}"))?;
    if !matches!(rest, [] | [b'\n'] | [b'\r', b'\n']) {
        return Err("trailing data after PEM block".into());
    }
    if block.label != PUBLIC_KEY_LABEL {
        return Err(format!("expected '{PUBLIC_KEY_LABEL}' block, found '{}'", block.label));
    }

    reencode_spki(&block.contents)
}

fn reencode_spki(der: &[u8]) -> Result<Vec<u8>, String> {
    use p256::pkcs8::{DecodePublicKey, EncodePublicKey};

    if let Ok(key) = p256::PublicKey::from_public_key_der(der) {
        return key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| format!("cannot encode key: {e}"));
    }
    if let Ok(key) = k256::PublicKey::from_public_key_der(der) {
        return key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| format!("cannot encode key: {e}"));
    }
    Err("not a P-256 or secp256k1 public key".into())
}

/// Accepts a server only if its leaf certificate carries the pinned public key.
/// Chain building and hostname checks are replaced by the pin; handshake
/// signatures are still verified with the provider's algorithms.
#[derive(Debug)]
pub struct PinnedServerKeyVerifier {
    pinned_spki: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl PinnedServerKeyVerifier {
    pub fn new(pinned_spki: Vec<u8>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            pinned_spki,
            provider,
        }
    }
}

impl ServerCertVerifier for PinnedServerKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| Error::InvalidCertificate(CertificateError::BadEncoding))?;

        if cert.public_key().raw == self.pinned_spki.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!("server certificate does not carry the pinned public key");
            Err(Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
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
    ) -> Result<HandshakeSignatureValid, Error> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use base64::Engine;

    fn verifier_for(pem: &str) -> PinnedServerKeyVerifier {
        PinnedServerKeyVerifier::new(
            canonical_public_key_der(pem).unwrap(),
            Arc::new(rustls::crypto::ring::default_provider()),
        )
    }

    #[test]
    fn sandbox_keys_are_already_canonical() {
        for node in CoordinatorConfig::sandbox().nodes {
            let der = canonical_public_key_der(&node.server_public_key_pem).unwrap();
            let body: String = node
                .server_public_key_pem
                .lines()
                .filter(|l| !l.starts_with("-----"))
                .collect();
            let raw = base64::engine::general_purpose::STANDARD
                .decode(body)
                .unwrap();
            assert_eq!(der, raw);
        }
    }

    #[test]
    fn accepts_secp256k1_keys() {
        let secret = k256::SecretKey::from_slice(&[3u8; 32]).unwrap();
        let pem = {
            use k256::pkcs8::{EncodePublicKey, LineEnding};
            secret.public_key().to_public_key_pem(LineEnding::LF).unwrap()
        };
        assert!(canonical_public_key_der(&pem).is_ok());
    }

    #[test]
    fn rejects_trailing_data_and_wrong_labels() {
        let pem = CoordinatorConfig::sandbox().nodes[0]
            .server_public_key_pem
            .clone();

        assert!(canonical_public_key_der(&format!("{pem}garbage")).is_err());
        assert!(canonical_public_key_der(&format!("{pem}\n\n  \n")).is_err());
        assert!(canonical_public_key_der(&format!("{pem}\n")).is_ok());
        assert!(canonical_public_key_der(&pem.replace("PUBLIC KEY", "CERTIFICATE")).is_err());
        assert!(canonical_public_key_der("not a pem at all").is_err());
        assert!(canonical_public_key_der(
            "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n"
        )
        .is_err());
    }

    #[test]
    fn verifier_matches_only_the_pinned_certificate() {
        let pinned = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let verifier = verifier_for(&pinned.key_pair.public_key_pem());
        let name = ServerName::try_from("localhost").unwrap();

        assert!(verifier
            .verify_server_cert(pinned.cert.der(), &[], &name, &[], UnixTime::now())
            .is_ok());
        assert!(matches!(
            verifier.verify_server_cert(other.cert.der(), &[], &name, &[], UnixTime::now()),
            Err(Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure
            ))
        ));
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
