use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
	#[error("token base64 decode failed: {0}")]
	Base64(#[from] base64::DecodeError),

	#[error("token record too short: got {len} bytes")]
	TooShort { len: usize },

	#[error("token record has trailing bytes: {extra} unconsumed")]
	TrailingBytes { extra: usize },

	#[error("unknown network tag {0}")]
	UnknownNetwork(u8),

	#[error("unknown address family tag {0}, expected 4 or 6")]
	UnknownFamily(u8),
}

#[derive(Debug, Error)]
pub enum StunError {
	#[error("failed to bind probe socket: {0}")]
	Bind(#[source] std::io::Error),

	#[error("failed to resolve STUN server {host:?}: {source}")]
	Resolve {
		host: String,
		#[source]
		source: std::io::Error,
	},

	#[error("STUN server {0} has no IPv4 address")]
	NoIpv4Address(String),

	#[error("failed to send STUN binding request: {0}")]
	Send(#[source] std::io::Error),

	#[error("timed out waiting for STUN binding response")]
	Timeout,

	#[error("failed to read STUN response: {0}")]
	Recv(#[source] std::io::Error),

	#[error("malformed STUN message: {0}")]
	Malformed(&'static str),

	#[error("STUN transaction id mismatch")]
	TransactionMismatch,

	#[error("STUN response did not contain an XOR-MAPPED-ADDRESS attribute")]
	MissingMappedAddress,
}

#[derive(Debug, Error)]
pub enum IdentityError {
	#[error("failed to generate RSA-2048 key: {0}")]
	KeyGeneration(String),

	#[error("failed to encode RSA private key: {0}")]
	KeyEncoding(String),

	#[error("failed to build certificate signing key: {0}")]
	SigningKey(String),

	#[error("failed to build certificate parameters: {0}")]
	CertificateParams(String),

	#[error("failed to self-sign certificate: {0}")]
	SelfSign(String),
}
