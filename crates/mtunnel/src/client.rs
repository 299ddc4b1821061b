//! Client runtime (§4.4): decodes the host's token, dials it with pinned
//! TLS, and forwards local connections onto fresh logical streams.

use std::net::SocketAddr;
use std::sync::Arc;

use eyre::Context as _;
use mtunnel_core::token::ConnectionToken;
use mtunnel_core::{info, pump, tls};
use quinn::{ClientConfig, Endpoint, EndpointConfig, TokioRuntime};
use tokio_util::sync::CancellationToken;

use crate::net;

/// `network` is not part of this config: the client learns which transport
/// kind to listen on from the decoded token, not from its own CLI flags — it
/// is the host's `-network` choice that governs what both ends dial/listen
/// as, per §4.4.
pub struct ClientRunConfig {
	pub port: u16,
	pub token: String,
}

pub async fn run(cfg: ClientRunConfig, shutdown: CancellationToken) -> eyre::Result<()> {
	let token = ConnectionToken::decode(&cfg.token).wrap_err("invalid connection token")?;
	let server_addr = SocketAddr::new(token.host, token.port);

	let client_config: ClientConfig = tls::client_config(token.fingerprint)?;

	let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
	let mut endpoint = Endpoint::new(EndpointConfig::default(), None, socket, Arc::new(TokioRuntime))?;
	endpoint.set_default_client_config(client_config);

	info!(target: "[CLIENT]", "dialing host at {server_addr}");
	let conn = endpoint
		.connect(server_addr, tls::SERVER_NAME)?
		.await
		.wrap_err("failed to establish connection to host")?;
	info!(target: "[CLIENT]", "connected to host, listening on localhost:{} ({})", cfg.port, token.network);

	let mut acceptor = net::LocalAcceptor::bind(token.network, cfg.port).await.wrap_err("failed to bind local listener")?;

	// Accept-loop cancellation: tripped either by the peer connection dying
	// or by a shutdown signal, so the loop below never blocks forever on a
	// local accept once either happens.
	let accept_cancel = CancellationToken::new();

	let peer_watch_cancel = accept_cancel.clone();
	let peer_watch_conn = conn.clone();
	let peer_watcher = tokio::spawn(async move {
		peer_watch_conn.closed().await;
		info!(target: "[CLIENT]", "host connection closed, stopping local accept loop");
		peer_watch_cancel.cancel();
	});

	let signal_cancel = accept_cancel.clone();
	let signal_conn = conn.clone();
	let signal_watcher = tokio::spawn(async move {
		shutdown.cancelled().await;
		info!(target: "[CLIENT]", "shutdown requested, closing host connection");
		signal_conn.close(quinn::VarInt::from_u32(0), b"client shutdown by user");
		signal_cancel.cancel();
	});

	loop {
		match acceptor.accept(&accept_cancel).await {
			None => break,
			Some(Err(err)) => {
				mtunnel_core::error!(target: "[CLIENT]", "local accept error: {err}");
				continue;
			}
			Some(Ok(local)) => {
				let network = token.network;
				let conn_for_open = conn.clone();
				match conn_for_open.open_bi().await {
					Ok((send, recv)) => {
						let conn_for_pump = conn_for_open.clone();
						tokio::spawn(async move {
							let outcome = pump::pump(send, recv, local, network, conn_for_pump).await;
							log_pump_outcome(&outcome);
						});
					}
					Err(err) => {
						mtunnel_core::error!(target: "[CLIENT]", "failed to open stream for new local connection: {err}");
						drop(local);
					}
				}
			}
		}
	}

	peer_watcher.abort();
	signal_watcher.abort();
	endpoint.wait_idle().await;

	Ok(())
}

fn log_pump_outcome(outcome: &pump::PumpOutcome) {
	if let Some(err) = &outcome.local_to_stream_error
		&& !pump::is_normal_close(err)
	{
		mtunnel_core::error!(target: "[CLIENT]", "local-to-stream copy error: {err}");
	}
	if let Some(err) = &outcome.stream_to_local_error
		&& !pump::is_normal_close(err)
	{
		mtunnel_core::error!(target: "[CLIENT]", "stream-to-local copy error: {err}");
	}
}
