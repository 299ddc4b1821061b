//! Local byte-stream connections: the things a stream pump couples to a
//! logical QUIC stream. TCP needs no adapter — `TcpStream` already
//! implements `AsyncRead`/`AsyncWrite`. UDP has no native accept-loop or
//! connect-a-socket-per-remote-peer model, so both ends get a thin adapter
//! here, grounded on `wind-tuic::inbound::QuicBidiStream`'s manual
//! `AsyncRead`/`AsyncWrite` delegation over a pair of quinn stream halves.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use mtunnel_core::Network;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const UDP_DATAGRAM_BUFFER: usize = 64 * 1024;
const UDP_ACCEPT_QUEUE: usize = 16;
const UDP_PEER_QUEUE: usize = 256;

/// One accepted or dialed local connection, whatever `network` it carries.
pub enum LocalConn {
	Tcp(TcpStream),
	Udp(UdpVirtualConn),
	ConnectedUdp(ConnectedUdpStream),
}

impl AsyncRead for LocalConn {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			LocalConn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			LocalConn::Udp(s) => Pin::new(s).poll_read(cx, buf),
			LocalConn::ConnectedUdp(s) => Pin::new(s).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for LocalConn {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			LocalConn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
			LocalConn::Udp(s) => Pin::new(s).poll_write(cx, buf),
			LocalConn::ConnectedUdp(s) => Pin::new(s).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			LocalConn::Tcp(s) => Pin::new(s).poll_flush(cx),
			LocalConn::Udp(s) => Pin::new(s).poll_flush(cx),
			LocalConn::ConnectedUdp(s) => Pin::new(s).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			LocalConn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			LocalConn::Udp(s) => Pin::new(s).poll_shutdown(cx),
			LocalConn::ConnectedUdp(s) => Pin::new(s).poll_shutdown(cx),
		}
	}
}

/// Client-side local "listener": TCP gets the OS's own accept loop; UDP gets
/// [`UdpAcceptor`]'s per-peer-address demultiplexing. `accept` races against
/// `cancel` so the peer-connection watcher (§4.4) can stop the loop without
/// a true socket close.
pub enum LocalAcceptor {
	Tcp(TcpListener),
	Udp(UdpAcceptor),
}

impl LocalAcceptor {
	pub async fn bind(network: Network, port: u16) -> io::Result<Self> {
		match network {
			Network::Tcp => Ok(Self::Tcp(TcpListener::bind(("127.0.0.1", port)).await?)),
			Network::Udp => Ok(Self::Udp(UdpAcceptor::bind(("127.0.0.1", port)).await?)),
		}
	}

	/// `None` means `cancel` fired; `Some(Err(_))` is a genuine accept error.
	pub async fn accept(&mut self, cancel: &CancellationToken) -> Option<io::Result<LocalConn>> {
		match self {
			Self::Tcp(listener) => tokio::select! {
				biased;
				_ = cancel.cancelled() => None,
				res = listener.accept() => Some(res.map(|(stream, _)| LocalConn::Tcp(stream))),
			},
			Self::Udp(acceptor) => tokio::select! {
				biased;
				_ = cancel.cancelled() => None,
				conn = acceptor.accept() => conn.map(|conn| Ok(LocalConn::Udp(conn))),
			},
		}
	}
}

/// Dials the forwarding target on the host side: a fresh TCP connection, or
/// a UDP socket connected to the one fixed destination this stream forwards
/// to (§4.4 — the host never needs per-peer demux, only the client's
/// listener does).
pub async fn dial_local(network: Network, port: u16) -> io::Result<LocalConn> {
	match network {
		Network::Tcp => Ok(LocalConn::Tcp(TcpStream::connect(("127.0.0.1", port)).await?)),
		Network::Udp => {
			let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
			socket.connect(("127.0.0.1", port)).await?;
			Ok(LocalConn::ConnectedUdp(ConnectedUdpStream { socket }))
		}
	}
}

/// One local UDP socket shared by every accepted virtual connection; a
/// background task owns the recv loop and demultiplexes inbound datagrams by
/// source address. The first datagram from a previously-unseen address
/// yields a new [`UdpVirtualConn`] handed to `accept`; later datagrams from
/// that address route to the existing one.
pub struct UdpAcceptor {
	incoming: mpsc::Receiver<UdpVirtualConn>,
}

impl UdpAcceptor {
	pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
		let socket = Arc::new(UdpSocket::bind(addr).await?);
		let (incoming_tx, incoming_rx) = mpsc::channel(UDP_ACCEPT_QUEUE);

		tokio::spawn(demux_loop(socket, incoming_tx));

		Ok(Self { incoming: incoming_rx })
	}

	async fn accept(&mut self) -> Option<UdpVirtualConn> {
		self.incoming.recv().await
	}
}

async fn demux_loop(socket: Arc<UdpSocket>, incoming_tx: mpsc::Sender<UdpVirtualConn>) {
	let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
	let mut buf = vec![0u8; UDP_DATAGRAM_BUFFER];

	loop {
		let (len, peer) = match socket.recv_from(&mut buf).await {
			Ok(v) => v,
			Err(_) => break,
		};

		if let Some(sender) = peers.get(&peer) {
			if sender.try_send(buf[..len].to_vec()).is_ok() {
				continue;
			}
			// Receiver gone (virtual connection dropped); fall through and
			// treat the next datagram from this address as a fresh peer.
			peers.remove(&peer);
		}

		let (tx, rx) = mpsc::channel(UDP_PEER_QUEUE);
		let _ = tx.try_send(buf[..len].to_vec());
		let conn = UdpVirtualConn {
			socket: socket.clone(),
			peer,
			rx,
			pending: Vec::new(),
		};

		if incoming_tx.send(conn).await.is_err() {
			break;
		}
		peers.insert(peer, tx);
	}
}

/// One demultiplexed peer's side of the shared UDP socket: reads pull
/// datagrams off this peer's channel (buffering a partial one across calls,
/// since `AsyncRead` makes no datagram-boundary guarantee to its caller);
/// writes go straight back out to `peer` over the shared socket.
pub struct UdpVirtualConn {
	socket: Arc<UdpSocket>,
	peer: SocketAddr,
	rx: mpsc::Receiver<Vec<u8>>,
	pending: Vec<u8>,
}

impl AsyncRead for UdpVirtualConn {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();

		if this.pending.is_empty() {
			match this.rx.poll_recv(cx) {
				Poll::Ready(Some(datagram)) => this.pending = datagram,
				Poll::Ready(None) => return Poll::Ready(Ok(())),
				Poll::Pending => return Poll::Pending,
			}
		}

		let take = this.pending.len().min(buf.remaining());
		buf.put_slice(&this.pending[..take]);
		this.pending.drain(..take);
		Poll::Ready(Ok(()))
	}
}

impl AsyncWrite for UdpVirtualConn {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		self.socket.poll_send_to(cx, buf, self.peer)
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	// UDP has no half-close; the pump never calls this for a non-TCP
	// `network` anyway (§4.5), but a no-op is the only sane answer if it did.
	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}

/// The host side's view of one UDP forwarding target: a connected socket,
/// since the host only ever forwards to the one fixed destination configured
/// for this session (`-port`), unlike the client's per-peer demux.
pub struct ConnectedUdpStream {
	socket: UdpSocket,
}

impl AsyncRead for ConnectedUdpStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		self.socket.poll_recv(cx, buf)
	}
}

impl AsyncWrite for ConnectedUdpStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		self.socket.poll_send(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

	use super::*;

	#[tokio::test]
	async fn udp_acceptor_demuxes_by_peer_address_and_echoes_back() {
		// Exercises `demux_loop` directly against a bound socket, mirroring
		// what `UdpAcceptor::bind` does internally, so the test can assert on
		// two distinct client addresses demuxing into two distinct virtual
		// connections.
		let socket = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).await.unwrap());
		let server_addr = socket.local_addr().unwrap();
		let (incoming_tx, mut incoming_rx) = mpsc::channel(UDP_ACCEPT_QUEUE);
		tokio::spawn(demux_loop(socket, incoming_tx));

		let client_a = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
		let client_b = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();

		client_a.send_to(b"hello from a", server_addr).await.unwrap();
		let mut conn_a = incoming_rx.recv().await.unwrap();

		let mut received = [0u8; 64];
		let n = conn_a.read(&mut received).await.unwrap();
		assert_eq!(&received[..n], b"hello from a");

		client_b.send_to(b"hello from b", server_addr).await.unwrap();
		let mut conn_b = incoming_rx.recv().await.unwrap();
		let n = conn_b.read(&mut received).await.unwrap();
		assert_eq!(&received[..n], b"hello from b");

		conn_a.write_all(b"reply to a").await.unwrap();
		let mut reply_buf = [0u8; 64];
		let (n, from) = client_a.recv_from(&mut reply_buf).await.unwrap();
		assert_eq!(&reply_buf[..n], b"reply to a");
		assert_eq!(from, server_addr);
	}

	#[tokio::test]
	async fn connected_udp_stream_round_trips_bytes() {
		let target = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
		let target_addr = target.local_addr().unwrap();

		let client_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
		client_socket.connect(target_addr).await.unwrap();
		let mut client = ConnectedUdpStream { socket: client_socket };

		client.write_all(b"ping").await.unwrap();
		let mut buf = [0u8; 16];
		let (n, from) = target.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"ping");

		target.send_to(b"pong", from).await.unwrap();
		let mut received = [0u8; 16];
		let n = client.read(&mut received).await.unwrap();
		assert_eq!(&received[..n], b"pong");
	}
}
