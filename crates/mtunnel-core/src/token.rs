use std::net::IpAddr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::TokenError;
use crate::types::Network;

/// The out-of-band artifact the host emits and the client consumes.
///
/// Wire layout (frozen, see SPEC_FULL.md §3/§10.6): `network`(1) ++
/// `family`(1, 4 or 6) ++ `address`(4 or 16) ++ `port`(2, big-endian) ++
/// `fingerprint`(32), then base64 standard encoding. This is a from-scratch
/// layout, not `encoding/gob` — gob is Go-specific and not meant to be
/// consumed from another language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionToken {
	pub fingerprint: [u8; 32],
	pub network: Network,
	pub host: IpAddr,
	pub port: u16,
}

impl ConnectionToken {
	pub fn encode(&self) -> String {
		let mut buf = Vec::with_capacity(1 + 1 + 16 + 2 + 32);
		buf.push(self.network.tag());

		match self.host {
			IpAddr::V4(v4) => {
				buf.push(4);
				buf.extend_from_slice(&v4.octets());
			}
			IpAddr::V6(v6) => {
				buf.push(6);
				buf.extend_from_slice(&v6.octets());
			}
		}

		buf.extend_from_slice(&self.port.to_be_bytes());
		buf.extend_from_slice(&self.fingerprint);

		BASE64.encode(buf)
	}

	pub fn decode(encoded: &str) -> Result<Self, TokenError> {
		let buf = BASE64.decode(encoded)?;

		let mut cursor = buf.as_slice();
		let network = take_byte(&mut cursor)?;
		let network = Network::from_tag(network).ok_or(TokenError::UnknownNetwork(network))?;

		let family = take_byte(&mut cursor)?;
		let host = match family {
			4 => {
				let octets = take_n::<4>(&mut cursor)?;
				IpAddr::from(octets)
			}
			6 => {
				let octets = take_n::<16>(&mut cursor)?;
				IpAddr::from(octets)
			}
			other => return Err(TokenError::UnknownFamily(other)),
		};

		let port = u16::from_be_bytes(take_n::<2>(&mut cursor)?);
		let fingerprint = take_n::<32>(&mut cursor)?;

		if !cursor.is_empty() {
			return Err(TokenError::TrailingBytes { extra: cursor.len() });
		}

		Ok(Self {
			fingerprint,
			network,
			host,
			port,
		})
	}
}

fn take_byte(cursor: &mut &[u8]) -> Result<u8, TokenError> {
	let (&byte, rest) = cursor.split_first().ok_or(TokenError::TooShort { len: 0 })?;
	*cursor = rest;
	Ok(byte)
}

fn take_n<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N], TokenError> {
	if cursor.len() < N {
		return Err(TokenError::TooShort { len: cursor.len() });
	}
	let (head, rest) = cursor.split_at(N);
	*cursor = rest;
	Ok(head.try_into().expect("length checked above"))
}

#[cfg(test)]
mod tests {
	use std::net::{Ipv4Addr, Ipv6Addr};

	use super::*;

	fn sample_fingerprint() -> [u8; 32] {
		let mut fp = [0u8; 32];
		for (i, b) in fp.iter_mut().enumerate() {
			*b = i as u8;
		}
		fp
	}

	#[test]
	fn round_trips_ipv4_tcp() {
		let token = ConnectionToken {
			fingerprint: sample_fingerprint(),
			network: Network::Tcp,
			host: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
			port: 47112,
		};

		let encoded = token.encode();
		let decoded = ConnectionToken::decode(&encoded).unwrap();
		assert_eq!(decoded, token);
	}

	#[test]
	fn round_trips_ipv6_udp() {
		let token = ConnectionToken {
			fingerprint: sample_fingerprint(),
			network: Network::Udp,
			host: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
			port: 1,
		};

		let encoded = token.encode();
		let decoded = ConnectionToken::decode(&encoded).unwrap();
		assert_eq!(decoded, token);
	}

	#[test]
	fn tampering_with_fingerprint_byte_changes_decoded_value() {
		let token = ConnectionToken {
			fingerprint: sample_fingerprint(),
			network: Network::Tcp,
			host: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 9000,
		};

		let encoded = token.encode();
		let mut raw = BASE64.decode(&encoded).unwrap();
		let last = raw.len() - 1;
		raw[last] ^= 0x01;
		let tampered = BASE64.encode(raw);

		let decoded = ConnectionToken::decode(&tampered).unwrap();
		assert_ne!(decoded.fingerprint, token.fingerprint);
	}

	#[test]
	fn rejects_truncated_record() {
		let encoded = BASE64.encode([0u8; 3]);
		assert!(ConnectionToken::decode(&encoded).is_err());
	}

	#[test]
	fn rejects_trailing_bytes() {
		let token = ConnectionToken {
			fingerprint: sample_fingerprint(),
			network: Network::Tcp,
			host: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 9000,
		};
		let mut raw = BASE64.decode(token.encode()).unwrap();
		raw.push(0xff);
		let encoded = BASE64.encode(raw);

		assert!(matches!(
			ConnectionToken::decode(&encoded),
			Err(TokenError::TrailingBytes { extra: 1 })
		));
	}

	#[test]
	fn rejects_bad_base64() {
		assert!(ConnectionToken::decode("not base64!!").is_err());
	}
}
