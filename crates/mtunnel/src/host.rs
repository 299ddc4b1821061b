//! Host runtime (§4.3): owns the forwarded service's tunnel side. One
//! process, one identity, one probed UDP socket shared between the STUN
//! exchange and the QUIC listener it becomes.

use std::net::SocketAddr;
use std::sync::Arc;

use mtunnel_core::session::{REASON_SERVER_SHUTTING_DOWN, Session, SessionRegistry};
use mtunnel_core::token::ConnectionToken;
use mtunnel_core::types::Network;
use eyre::Context as _;
use mtunnel_core::{identity::Identity, info, pump, stun, tls};
use quinn::{Endpoint, EndpointConfig, TokioRuntime, VarInt};
use tokio_util::sync::CancellationToken;

use crate::{control, net};

pub struct HostConfig {
	pub network: Network,
	pub port: u16,
	pub stun_server: String,
}

pub async fn run(cfg: HostConfig, shutdown: CancellationToken) -> eyre::Result<()> {
	let identity = Identity::generate().wrap_err("failed to generate host identity")?;

	info!(target: "[HOST]", "probing reflexive address via {}", cfg.stun_server);
	let probe = stun::probe(Some(&cfg.stun_server))
		.await
		.wrap_err("STUN probe failed")?;
	info!(target: "[HOST]", "reflexive address {}", probe.reflexive);

	let server_config = tls::server_config(&identity)?;
	let socket = probe.socket.into_std()?;
	let endpoint = Endpoint::new(EndpointConfig::default(), Some(server_config), socket, Arc::new(TokioRuntime))?;

	let token = ConnectionToken {
		fingerprint: identity.fingerprint,
		network: cfg.network,
		host: probe.reflexive.ip(),
		port: probe.reflexive.port(),
	};
	control::emit_token(token.encode()).await?;

	let registry = Arc::new(SessionRegistry::new());

	let control_registry = registry.clone();
	tokio::spawn(async move {
		if let Err(err) = control::run(control_registry).await {
			mtunnel_core::error!(target: "[CONTROL]", "control loop ended with error: {err}");
		}
	});

	info!(target: "[HOST]", "listening, forwarding to localhost:{} ({})", cfg.port, cfg.network);

	loop {
		tokio::select! {
			biased;
			_ = shutdown.cancelled() => {
				info!(target: "[HOST]", "shutdown requested, closing {} session(s)", registry.len());
				registry.close_all();
				endpoint.close(VarInt::from_u32(0), REASON_SERVER_SHUTTING_DOWN.as_bytes());
				break;
			}
			incoming = endpoint.accept() => {
				match incoming {
					Some(incoming) => {
						let registry = registry.clone();
						let network = cfg.network;
						let port = cfg.port;
						tokio::spawn(async move {
							handle_incoming(incoming, registry, network, port).await;
						});
					}
					None => break,
				}
			}
		}
	}

	endpoint.wait_idle().await;
	Ok(())
}

async fn handle_incoming(incoming: quinn::Incoming, registry: Arc<SessionRegistry>, network: Network, port: u16) {
	let remote: SocketAddr = incoming.remote_address();

	let connecting = match incoming.accept() {
		Ok(connecting) => connecting,
		Err(err) => {
			mtunnel_core::error!(target: "[HOST]", "rejecting connection from {remote}: {err}");
			return;
		}
	};

	let conn = match connecting.await {
		Ok(conn) => conn,
		Err(err) => {
			mtunnel_core::error!(target: "[HOST]", "handshake with {remote} failed: {err}");
			return;
		}
	};

	let session = Session::new(conn.clone());
	if let Err(err) = control::announce_connected(&session).await {
		mtunnel_core::error!(target: "[CONTROL]", "failed to emit CONNECTED line: {err}");
	}
	let id = registry.insert(session);
	info!(target: "[HOST]", "session {id} connected from {remote}");

	loop {
		tokio::select! {
			biased;
			_ = conn.closed() => {
				break;
			}
			accepted = conn.accept_bi() => {
				match accepted {
					Ok((send, recv)) => {
						let conn_for_pump = conn.clone();
						tokio::spawn(async move {
							dispatch_stream(send, recv, network, port, conn_for_pump).await;
						});
					}
					Err(err) => {
						info!(target: "[HOST]", "session {id} stream accept ended: {err}");
						break;
					}
				}
			}
		}
	}

	registry.remove(&id);
	info!(target: "[HOST]", "session {id} closed");
}

async fn dispatch_stream(send: quinn::SendStream, recv: quinn::RecvStream, network: Network, port: u16, conn: quinn::Connection) {
	let local = match net::dial_local(network, port).await {
		Ok(local) => local,
		Err(err) => {
			mtunnel_core::error!(target: "[HOST]", "failed to dial local target localhost:{port}: {err}");
			return;
		}
	};

	let outcome = pump::pump(send, recv, local, network, conn).await;
	log_pump_outcome(&outcome);
}

fn log_pump_outcome(outcome: &pump::PumpOutcome) {
	if let Some(err) = &outcome.local_to_stream_error
		&& !pump::is_normal_close(err)
	{
		mtunnel_core::error!(target: "[HOST]", "local-to-stream copy error: {err}");
	}
	if let Some(err) = &outcome.stream_to_local_error
		&& !pump::is_normal_close(err)
	{
		mtunnel_core::error!(target: "[HOST]", "stream-to-local copy error: {err}");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn log_pump_outcome_does_not_panic_on_empty_outcome() {
		log_pump_outcome(&pump::PumpOutcome::default());
	}
}
