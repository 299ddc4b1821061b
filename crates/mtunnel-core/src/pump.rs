//! The stream pump: couples one logical QUIC stream to one local
//! byte-stream connection with independent per-direction half-close.
//!
//! Grounded on `wind-core::io::copy_io`'s two-armed copy shape, but
//! deliberately split into two independent tasks instead of one shared
//! `select!` loop — `copy_io` breaks out of *both* directions as soon as
//! *either* side hits EOF, which is exactly the naive pattern SPEC_FULL.md
//! §9 calls out as wrong for HTTP/1.1 responses.

use std::io;
use std::sync::Arc;

use quinn::{Connection, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::types::Network;

const BUFFER_SIZE: usize = 16 * 1024;

/// Byte counts and last error (if any) per direction. Errors classified as
/// "normal close" by [`is_normal_close`] are never placed here by the
/// copiers — only the ones worth a caller logging.
#[derive(Debug, Default)]
pub struct PumpOutcome {
	pub local_to_stream_bytes: u64,
	pub stream_to_local_bytes: u64,
	pub local_to_stream_error: Option<io::Error>,
	pub stream_to_local_error: Option<io::Error>,
}

/// Couples `send`/`recv` (one accepted or opened logical stream) to `local`
/// (the accepted client connection, or the connection dialed to the
/// forwarding target) until both directions quiesce.
///
/// `conn` is the logical stream's owning connection; its completion trips
/// the cancellation watcher, which unblocks a copier that would otherwise
/// wait forever on a local read the peer will never satisfy (SPEC_FULL.md
/// §4.5's "cancellation watcher realization").
pub async fn pump<L>(send: SendStream, recv: RecvStream, local: L, network: Network, conn: Connection) -> PumpOutcome
where
	L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (local_read, local_write) = tokio::io::split(local);
	let local_write = Arc::new(SharedWriter::new(local_write));

	let cancel = CancellationToken::new();

	let watcher_cancel = cancel.clone();
	let watcher_conn = conn.clone();
	let watcher = tokio::spawn(async move {
		watcher_conn.closed().await;
		watcher_cancel.cancel();
	});

	let l_to_s = tokio::spawn(local_to_stream(local_read, send, cancel.clone()));
	let s_to_l = tokio::spawn(stream_to_local(recv, local_write.clone(), network, cancel.clone()));

	let (l_to_s_result, s_to_l_result) = tokio::join!(l_to_s, s_to_l);

	cancel.cancel();
	watcher.abort();

	// Both directions have quiesced; one more shutdown call fully closes the
	// underlying local connection (TCP socket, or the virtual UDP duplex),
	// dropping the last shared reference to its write half.
	let _ = local_write.shutdown().await;

	let (local_to_stream_bytes, local_to_stream_error) = l_to_s_result.unwrap_or((0, None));
	let (stream_to_local_bytes, stream_to_local_error) = s_to_l_result.unwrap_or((0, None));

	PumpOutcome {
		local_to_stream_bytes,
		stream_to_local_bytes,
		local_to_stream_error,
		stream_to_local_error,
	}
}

async fn local_to_stream<R>(
	mut local_read: R,
	mut send: SendStream,
	cancel: CancellationToken,
) -> (u64, Option<io::Error>)
where
	R: AsyncRead + Unpin,
{
	let mut buf = vec![0u8; BUFFER_SIZE];
	let mut total = 0u64;

	let error = loop {
		let read = tokio::select! {
			biased;
			_ = cancel.cancelled() => break None,
			res = local_read.read(&mut buf) => res,
		};

		match read {
			Ok(0) => break None,
			Ok(n) => {
				total += n as u64;
				// `SendStream::write_all` is quinn's own inherent method
				// (`Result<(), WriteError>`), not `AsyncWriteExt`'s.
				if let Err(err) = send.write_all(&buf[..n]).await {
					break Some(io::Error::other(err));
				}
			}
			Err(err) => break Some(err),
		}
	};

	// Half-close S: tell the peer no more data is coming in this direction.
	// L's write half is shared with `stream_to_local`, which is still
	// delivering the other direction's response; only it half-closes L,
	// once its own read side quiesces (matching the original client
	// handler's `CloseRead` rather than `CloseWrite` here).
	let _ = send.finish();

	(total, error)
}

async fn stream_to_local(
	mut recv: RecvStream,
	local_write: Arc<SharedWriter<impl AsyncWrite + Unpin>>,
	network: Network,
	cancel: CancellationToken,
) -> (u64, Option<io::Error>) {
	let mut buf = vec![0u8; BUFFER_SIZE];
	let mut total = 0u64;

	let error = loop {
		// `RecvStream::read` is quinn's own inherent method: `Ok(None)` is
		// EOF, distinct from `AsyncReadExt::read`'s `Ok(0)`.
		let read = tokio::select! {
			biased;
			_ = cancel.cancelled() => break None,
			res = recv.read(&mut buf) => res.map_err(io::Error::other),
		};

		match read {
			Ok(None) => break None,
			Ok(Some(n)) => {
				total += n as u64;
				if let Err(err) = local_write.write_all(&buf[..n]).await {
					break Some(err);
				}
			}
			Err(err) => break Some(err),
		}
	};

	// Propagate the remote's EOF onto the local peer by half-closing our
	// write side of L, so e.g. an HTTP/1.1 client sees the response end.
	if network == Network::Tcp {
		let _ = local_write.shutdown().await;
	}

	(total, error)
}

/// One local connection's write half, shared between the two copier tasks:
/// `stream_to_local` both writes the ordinary response bytes into it and is
/// the only one of the two that ever calls [`SharedWriter::shutdown`] on it
/// (once its own read side has quiesced) — `local_to_stream` never touches
/// it, since L's write half is how the other direction's response is still
/// being delivered. A `tokio::sync::Mutex` makes the writes and the final
/// shutdown in `pump` safe to call concurrently with it.
struct SharedWriter<W> {
	inner: AsyncMutex<W>,
}

impl<W: AsyncWrite + Unpin> SharedWriter<W> {
	fn new(inner: W) -> Self {
		Self {
			inner: AsyncMutex::new(inner),
		}
	}

	async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
		self.inner.lock().await.write_all(buf).await
	}

	async fn shutdown(&self) -> io::Result<()> {
		self.inner.lock().await.shutdown().await
	}
}

/// Errors in this bucket are routine connection teardown, not failures:
/// EOF, a write after the peer already closed, a broken pipe, a reset. The
/// pump logs everything else; these are expected often enough (every
/// ordinary stream end takes this path on one side) that logging them as
/// errors would just be noise.
pub fn is_normal_close(err: &io::Error) -> bool {
	use std::io::ErrorKind::*;

	if matches!(err.kind(), UnexpectedEof | BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected) {
		return true;
	}

	let message = err.to_string();
	message.contains("use of closed")
		|| message.contains("closed stream")
		|| message.contains("connection reset")
		|| message.contains("broken pipe")
}

#[cfg(test)]
mod tests {
	use std::net::{Ipv4Addr, SocketAddr};
	use std::sync::Arc as StdArc;

	use quinn::{ClientConfig, Endpoint, EndpointConfig, ServerConfig, TokioRuntime};
	use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
	use tokio::net::UdpSocket;

	use super::*;
	use crate::identity::Identity;

	fn install_provider() {
		let _ = rustls::crypto::ring::default_provider().install_default();
	}

	/// Spins up a loopback QUIC connection pair (real sockets, real
	/// handshake) so the pump can be exercised against actual
	/// `SendStream`/`RecvStream` halves rather than a mock.
	async fn loopback_connection() -> (Connection, Connection) {
		install_provider();
		let identity = Identity::generate().unwrap();

		let server_config: ServerConfig = crate::tls::server_config(&identity).unwrap();
		let client_config: ClientConfig = crate::tls::client_config(identity.fingerprint).unwrap();

		let server_socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let server_addr = server_socket.local_addr().unwrap();
		let server_endpoint =
			Endpoint::new(EndpointConfig::default(), Some(server_config), server_socket, StdArc::new(TokioRuntime)).unwrap();

		let client_socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let mut client_endpoint =
			Endpoint::new(EndpointConfig::default(), None, client_socket, StdArc::new(TokioRuntime)).unwrap();
		client_endpoint.set_default_client_config(client_config);

		let client_connecting = client_endpoint.connect(server_addr, "mtunnel").unwrap();
		let server_incoming = server_endpoint.accept();

		let (client_conn, server_conn) = tokio::join!(client_connecting, async {
			server_incoming.await.unwrap().accept().unwrap().await
		});

		(client_conn.unwrap(), server_conn.unwrap())
	}

	#[tokio::test]
	async fn pump_relays_bytes_in_both_directions() {
		let (client_conn, server_conn) = loopback_connection().await;

		let (client_send, server_recv_side) = tokio::join!(client_conn.open_bi(), async {
			let (send, recv) = server_conn.accept_bi().await.unwrap();
			(send, recv)
		});
		let (client_send, client_recv) = client_send.unwrap();
		let (server_send, server_recv) = server_recv_side;

		let (client_local, mut client_peer) = tokio::io::duplex(4096);
		let (server_local, mut server_peer) = tokio::io::duplex(4096);

		let client_conn_for_pump = client_conn.clone();
		let server_conn_for_pump = server_conn.clone();
		let client_pump = tokio::spawn(pump(
			client_send,
			client_recv,
			client_local,
			Network::Tcp,
			client_conn_for_pump,
		));
		let server_pump = tokio::spawn(pump(
			server_send,
			server_recv,
			server_local,
			Network::Tcp,
			server_conn_for_pump,
		));

		client_peer.write_all(b"hello from client").await.unwrap();
		client_peer.shutdown().await.unwrap();

		let mut received_on_server = Vec::new();
		server_peer.read_to_end(&mut received_on_server).await.unwrap();
		assert_eq!(received_on_server, b"hello from client");

		server_peer.write_all(b"hello from server").await.unwrap();
		server_peer.shutdown().await.unwrap();

		let mut received_on_client = Vec::new();
		client_peer.read_to_end(&mut received_on_client).await.unwrap();
		assert_eq!(received_on_client, b"hello from server");

		let client_outcome = client_pump.await.unwrap();
		let server_outcome = server_pump.await.unwrap();

		assert_eq!(client_outcome.local_to_stream_bytes, "hello from client".len() as u64);
		assert_eq!(server_outcome.stream_to_local_bytes, "hello from client".len() as u64);
		assert_eq!(server_outcome.local_to_stream_bytes, "hello from server".len() as u64);
		assert_eq!(client_outcome.stream_to_local_bytes, "hello from server".len() as u64);
	}

	#[tokio::test]
	async fn pump_propagates_half_close_without_waiting_on_the_other_direction() {
		let (client_conn, server_conn) = loopback_connection().await;

		let (client_send, server_recv_side) = tokio::join!(client_conn.open_bi(), async {
			let (send, recv) = server_conn.accept_bi().await.unwrap();
			(send, recv)
		});
		let (client_send, client_recv) = client_send.unwrap();
		let (server_send, server_recv) = server_recv_side;

		let (client_local, mut client_peer) = tokio::io::duplex(4096);
		let (server_local, mut server_peer) = tokio::io::duplex(4096);

		let client_pump = tokio::spawn(pump(client_send, client_recv, client_local, Network::Tcp, client_conn.clone()));
		let server_pump = tokio::spawn(pump(server_send, server_recv, server_local, Network::Tcp, server_conn.clone()));

		// Client half-closes its write immediately without sending anything;
		// the server side must observe EOF on its read without needing the
		// server to have written its response first.
		client_peer.shutdown().await.unwrap();

		let mut received = Vec::new();
		let read_result = tokio::time::timeout(std::time::Duration::from_secs(5), server_peer.read_to_end(&mut received)).await;
		assert!(read_result.is_ok(), "server should observe EOF promptly");
		assert!(received.is_empty());

		// Server can still write its response after observing the client's
		// half-close — this is the behavior a naive "close both on first
		// EOF" pump would break.
		server_peer.write_all(b"still works").await.unwrap();
		server_peer.shutdown().await.unwrap();

		let mut received_on_client = Vec::new();
		client_peer.read_to_end(&mut received_on_client).await.unwrap();
		assert_eq!(received_on_client, b"still works");

		client_pump.await.unwrap();
		server_pump.await.unwrap();
	}

	#[test]
	fn classifies_normal_close_errors() {
		assert!(is_normal_close(&io::Error::from(io::ErrorKind::UnexpectedEof)));
		assert!(is_normal_close(&io::Error::from(io::ErrorKind::BrokenPipe)));
		assert!(is_normal_close(&io::Error::from(io::ErrorKind::ConnectionReset)));
		assert!(is_normal_close(&io::Error::other("use of closed network connection")));
		assert!(!is_normal_close(&io::Error::other("disk full")));
	}
}
