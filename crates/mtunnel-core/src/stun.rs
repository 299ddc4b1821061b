//! A minimal STUN (RFC 5389) binding client: just enough to issue one
//! binding request against a public STUN server and extract the reflexive
//! XOR-MAPPED-ADDRESS. Not a general STUN implementation — no
//! authentication, no relaying, no support for attributes this tunnel
//! doesn't need.
//!
//! Header/attribute framing and the XOR-MAPPED-ADDRESS algorithm are
//! standard RFC 5389 STUN; verified against `mycrl-turn-rs`'s `stun` crate
//! (not a dependency, just a reference for the magic-cookie XOR math).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::StunError;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS_RESPONSE: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;
const HEADER_LEN: usize = 20;
const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct StunProbe {
	pub socket: UdpSocket,
	pub reflexive: SocketAddr,
}

/// Bind an ephemeral UDP socket, resolve `server` over IPv4, and issue one
/// STUN binding request. Returns the bound socket (still usable by the
/// caller — handing it to the secure transport afterward is what keeps the
/// reflexive mapping alive) together with the reflexive address.
pub async fn probe(server: Option<&str>) -> Result<StunProbe, StunError> {
	let server = server.unwrap_or(DEFAULT_STUN_SERVER);

	let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(StunError::Bind)?;

	let resolved = tokio::net::lookup_host(server)
		.await
		.map_err(|source| StunError::Resolve {
			host: server.to_string(),
			source,
		})?;
	let server_addr = resolved
		.into_iter()
		.find(|addr| addr.is_ipv4())
		.ok_or_else(|| StunError::NoIpv4Address(server.to_string()))?;

	let mut transaction_id = [0u8; 12];
	rand::rng().fill_bytes(&mut transaction_id);

	let request = encode_binding_request(&transaction_id);
	socket.send_to(&request, server_addr).await.map_err(StunError::Send)?;

	let mut buf = [0u8; 512];
	let len = timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
		.await
		.map_err(|_| StunError::Timeout)?
		.map_err(StunError::Recv)?;

	let reflexive = decode_binding_response(&buf[..len], &transaction_id)?;

	Ok(StunProbe { socket, reflexive })
}

/// Periodic STUN re-query to keep a NAT's UDP mapping alive under NATs with
/// short (<30s) mapping timeouts. Defined per the dormant extension point
/// noted in SPEC_FULL.md §9/§10.6; not called by the default run loop,
/// since the transport's own peer keepalive is sufficient for the common
/// case this tunnel targets.
pub async fn keepalive(socket: &UdpSocket, server: Option<&str>) -> Result<SocketAddr, StunError> {
	let server = server.unwrap_or(DEFAULT_STUN_SERVER);
	let resolved = tokio::net::lookup_host(server)
		.await
		.map_err(|source| StunError::Resolve {
			host: server.to_string(),
			source,
		})?;
	let server_addr = resolved
		.into_iter()
		.find(|addr| addr.is_ipv4())
		.ok_or_else(|| StunError::NoIpv4Address(server.to_string()))?;

	let mut transaction_id = [0u8; 12];
	rand::rng().fill_bytes(&mut transaction_id);

	let request = encode_binding_request(&transaction_id);
	socket.send_to(&request, server_addr).await.map_err(StunError::Send)?;

	let mut buf = [0u8; 512];
	let len = timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
		.await
		.map_err(|_| StunError::Timeout)?
		.map_err(StunError::Recv)?;

	decode_binding_response(&buf[..len], &transaction_id)
}

fn encode_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
	let mut buf = Vec::with_capacity(HEADER_LEN);
	buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
	buf.extend_from_slice(&0u16.to_be_bytes());
	buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
	buf.extend_from_slice(transaction_id);
	buf
}

fn decode_binding_response(packet: &[u8], expected_transaction_id: &[u8; 12]) -> Result<SocketAddr, StunError> {
	if packet.len() < HEADER_LEN {
		return Err(StunError::Malformed("response shorter than STUN header"));
	}

	let message_type = u16::from_be_bytes([packet[0], packet[1]]);
	let message_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
	let cookie = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
	let transaction_id = &packet[8..20];

	if cookie != MAGIC_COOKIE {
		return Err(StunError::Malformed("bad magic cookie"));
	}
	if message_type != BINDING_SUCCESS_RESPONSE {
		return Err(StunError::Malformed("not a binding success response"));
	}
	if transaction_id != expected_transaction_id {
		return Err(StunError::TransactionMismatch);
	}
	if packet.len() < HEADER_LEN + message_len {
		return Err(StunError::Malformed("truncated attribute section"));
	}

	let mut cursor = &packet[HEADER_LEN..HEADER_LEN + message_len];
	let mut mapped_address = None;
	let mut xor_mapped_address = None;

	while cursor.len() >= 4 {
		let attr_type = u16::from_be_bytes([cursor[0], cursor[1]]);
		let attr_len = u16::from_be_bytes([cursor[2], cursor[3]]) as usize;
		let padded_len = attr_len.div_ceil(4) * 4;

		if cursor.len() < 4 + padded_len {
			return Err(StunError::Malformed("truncated attribute value"));
		}
		let value = &cursor[4..4 + attr_len];

		match attr_type {
			ATTR_XOR_MAPPED_ADDRESS => {
				xor_mapped_address = Some(decode_address(value, transaction_id, true)?);
			}
			ATTR_MAPPED_ADDRESS => {
				mapped_address = Some(decode_address(value, transaction_id, false)?);
			}
			_ => {}
		}

		cursor = &cursor[4 + padded_len..];
	}

	xor_mapped_address
		.or(mapped_address)
		.ok_or(StunError::MissingMappedAddress)
}

fn decode_address(value: &[u8], transaction_id: &[u8], is_xor: bool) -> Result<SocketAddr, StunError> {
	if value.len() < 4 {
		return Err(StunError::Malformed("address attribute too short"));
	}

	let family = value[1];
	let port = u16::from_be_bytes([value[2], value[3]]);

	let ip = match family {
		FAMILY_IPV4 => {
			if value.len() < 8 {
				return Err(StunError::Malformed("ipv4 address truncated"));
			}
			let octets: [u8; 4] = value[4..8].try_into().expect("checked length");
			IpAddr::V4(Ipv4Addr::from(octets))
		}
		FAMILY_IPV6 => {
			if value.len() < 20 {
				return Err(StunError::Malformed("ipv6 address truncated"));
			}
			let octets: [u8; 16] = value[4..20].try_into().expect("checked length");
			IpAddr::V6(Ipv6Addr::from(octets))
		}
		_ => return Err(StunError::Malformed("unknown address family")),
	};

	let addr = SocketAddr::new(ip, port);
	Ok(if is_xor { xor_address(addr, transaction_id) } else { addr })
}

fn xor_address(addr: SocketAddr, transaction_id: &[u8]) -> SocketAddr {
	let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
	let ip = match addr.ip() {
		IpAddr::V4(v4) => IpAddr::V4(xor_v4(v4)),
		IpAddr::V6(v6) => IpAddr::V6(xor_v6(v6, transaction_id)),
	};
	SocketAddr::new(ip, port)
}

fn xor_v4(addr: Ipv4Addr) -> Ipv4Addr {
	let mut octets = addr.octets();
	for (i, b) in octets.iter_mut().enumerate() {
		*b ^= (MAGIC_COOKIE >> (24 - i * 8)) as u8;
	}
	Ipv4Addr::from(octets)
}

fn xor_v6(addr: Ipv6Addr, transaction_id: &[u8]) -> Ipv6Addr {
	let mut octets = addr.octets();
	for (i, b) in octets.iter_mut().enumerate().take(4) {
		*b ^= (MAGIC_COOKIE >> (24 - i * 8)) as u8;
	}
	for (i, b) in octets.iter_mut().enumerate().take(16).skip(4) {
		*b ^= transaction_id[i - 4];
	}
	Ipv6Addr::from(octets)
}
