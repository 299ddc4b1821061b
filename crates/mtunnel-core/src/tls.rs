//! Pinned TLS configuration for both ends of the tunnel. The host presents
//! its ephemeral self-signed identity; the client replaces chain validation
//! entirely with equality against the fingerprint embedded in the token.
//! SPEC_FULL.md §9 calls this out as a single atomic policy: "skip default
//! verification" only ever ships paired with the mandatory pin callback
//! below, never offered alone.

use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ClientConfig, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::identity::Identity;

pub const ALPN: &[u8] = b"mtunnel";
/// SNI presented by the client on connect. The host's certificate carries no
/// real DNS name worth matching against (verification is fingerprint-pinned
/// instead, see [`PinnedFingerprintVerifier`]), so this is just a fixed,
/// non-empty value quinn's API requires.
pub const SERVER_NAME: &str = "mtunnel";
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Host-side QUIC server config: presents `identity`, advertises ALPN
/// `mtunnel`, applies the idle timeout and keepalive from §6.
pub fn server_config(identity: &Identity) -> eyre::Result<ServerConfig> {
	let mut crypto = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.with_no_client_auth()
		.with_single_cert(vec![identity.cert_der.clone()], identity.private_key_der.clone_key())?;
	crypto.alpn_protocols = vec![ALPN.to_vec()];

	let mut config = ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto)?));
	config.transport_config(Arc::new(transport_config()?));

	Ok(config)
}

/// Client-side QUIC client config: disables chain validation in favor of
/// [`PinnedFingerprintVerifier`], advertises ALPN `mtunnel`.
pub fn client_config(expected_fingerprint: [u8; 32]) -> eyre::Result<ClientConfig> {
	let verifier = Arc::new(PinnedFingerprintVerifier { expected_fingerprint });

	let mut crypto = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.dangerous()
		.with_custom_certificate_verifier(verifier)
		.with_no_client_auth();
	crypto.alpn_protocols = vec![ALPN.to_vec()];

	let mut config = ClientConfig::new(Arc::new(QuicClientConfig::try_from(crypto)?));
	config.transport_config(Arc::new(transport_config()?));

	Ok(config)
}

fn transport_config() -> eyre::Result<TransportConfig> {
	let mut transport = TransportConfig::default();
	transport
		.max_idle_timeout(Some(IdleTimeout::try_from(IDLE_TIMEOUT).map_err(|_| eyre::eyre!("invalid idle timeout"))?))
		.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
	Ok(transport)
}

/// Replaces PKI chain validation with bitwise equality of the leaf
/// certificate's SHA-256(DER) against the fingerprint carried in the
/// connection token. There is deliberately no fallback path that accepts a
/// certificate chain failing this check.
#[derive(Debug)]
struct PinnedFingerprintVerifier {
	expected_fingerprint: [u8; 32],
}

impl ServerCertVerifier for PinnedFingerprintVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		let actual: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
		if actual == self.expected_fingerprint {
			Ok(ServerCertVerified::assertion())
		} else {
			Err(rustls::Error::General(format!(
				"certificate fingerprint mismatch: expected {}, got {}",
				hex(&self.expected_fingerprint),
				hex(&actual)
			)))
		}
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		// TLS 1.3 only, and signature verification is a no-op above, so this
		// just needs to list every scheme the pinned RSA identity might use.
		vec![
			SignatureScheme::RSA_PSS_SHA256,
			SignatureScheme::RSA_PSS_SHA384,
			SignatureScheme::RSA_PSS_SHA512,
			SignatureScheme::RSA_PKCS1_SHA256,
			SignatureScheme::RSA_PKCS1_SHA384,
			SignatureScheme::RSA_PKCS1_SHA512,
			SignatureScheme::ECDSA_NISTP256_SHA256,
			SignatureScheme::ECDSA_NISTP384_SHA384,
			SignatureScheme::ED25519,
		]
	}
}

fn hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}
