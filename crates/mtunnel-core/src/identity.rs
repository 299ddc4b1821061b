use rcgen::{
	CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
	KeyUsagePurpose, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::error::IdentityError;

const COMMON_NAME: &str = "mtunnel";
const RSA_KEY_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 365;

/// A fresh, ephemeral RSA-2048 key plus a self-signed certificate, and the
/// SHA-256 fingerprint of the certificate's DER bytes. Generated once per
/// host run; the private key never leaves the process.
pub struct Identity {
	pub cert_der: CertificateDer<'static>,
	pub private_key_der: PrivateKeyDer<'static>,
	pub fingerprint: [u8; 32],
}

impl Identity {
	pub fn generate() -> Result<Self, IdentityError> {
		let mut rng = rand_core::OsRng;
		let rsa_key = rsa::RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
			.map_err(|e| IdentityError::KeyGeneration(e.to_string()))?;

		let pkcs8_der = rsa_key
			.to_pkcs8_der()
			.map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;
		let pkcs8_bytes = pkcs8_der.as_bytes().to_vec();

		let signing_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8_bytes.clone()));
		let key_pair = KeyPair::from_der_and_sign_algo(&signing_key, &PKCS_RSA_SHA256)
			.map_err(|e| IdentityError::SigningKey(e.to_string()))?;

		let mut params = CertificateParams::new(Vec::<String>::new())
			.map_err(|e| IdentityError::CertificateParams(e.to_string()))?;

		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, COMMON_NAME);
		params.distinguished_name = dn;

		let not_before = OffsetDateTime::now_utc();
		params.not_before = not_before;
		params.not_after = not_before + Duration::days(VALIDITY_DAYS);
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.is_ca = IsCa::NoCa;

		let cert = params
			.self_signed(&key_pair)
			.map_err(|e| IdentityError::SelfSign(e.to_string()))?;

		let cert_der = CertificateDer::from(cert.der().to_vec());
		let fingerprint: [u8; 32] = Sha256::digest(cert_der.as_ref()).into();

		Ok(Self {
			cert_der,
			private_key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8_bytes)),
			fingerprint,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generated_identity_has_matching_fingerprint() {
		let identity = Identity::generate().unwrap();
		let recomputed: [u8; 32] = Sha256::digest(identity.cert_der.as_ref()).into();
		assert_eq!(identity.fingerprint, recomputed);
	}

	#[test]
	fn two_identities_have_distinct_fingerprints() {
		let a = Identity::generate().unwrap();
		let b = Identity::generate().unwrap();
		assert_ne!(a.fingerprint, b.fingerprint);
	}
}
