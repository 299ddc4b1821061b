//! One accepted peer connection (`Session`) and the process-wide map of
//! them (`SessionRegistry`). This module only owns lifecycle bookkeeping —
//! accepting logical streams and dispatching them to the pump is the host
//! runtime's job (it needs the forwarding target, which this crate doesn't
//! know about).

use std::collections::HashMap;

use parking_lot::Mutex;
use quinn::{Connection, VarInt};
use uuid::Uuid;

/// Close reason used by `SessionRegistry::close_all`, per SPEC_FULL.md
/// §4.6/§10.6.
pub const REASON_SERVER_SHUTTING_DOWN: &str = "server shutting down";
/// Close reason used by `SessionRegistry::force_close`.
pub const REASON_SESSION_CLOSED: &str = "session closed";

/// One accepted peer on the host side. `close` is idempotent — quinn
/// tolerates closing an already-closed connection.
pub struct Session {
	pub id: String,
	conn: Connection,
}

impl Session {
	pub fn new(conn: Connection) -> Self {
		Self {
			id: Uuid::new_v4().to_string(),
			conn,
		}
	}

	pub fn connection(&self) -> &Connection {
		&self.conn
	}

	pub fn close(&self, reason: &str) {
		self.conn.close(VarInt::from_u32(0), reason.as_bytes());
	}
}

/// Process-wide, host-only mapping from session id to `Session`. A single
/// `parking_lot::Mutex` guards the map; it is held only for the map
/// mutation itself, never across a `close()` call, per SPEC_FULL.md §4.6.
#[derive(Default)]
pub struct SessionRegistry {
	sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts `session` and returns its id.
	pub fn insert(&self, session: Session) -> String {
		let id = session.id.clone();
		self.sessions.lock().insert(id.clone(), session);
		id
	}

	/// A freshly allocated snapshot of currently-registered ids.
	pub fn list(&self) -> Vec<String> {
		self.sessions.lock().keys().cloned().collect()
	}

	/// Removes `id` if present. Idempotent: removing an absent id is a no-op
	/// that returns `false`.
	pub fn remove(&self, id: &str) -> bool {
		self.sessions.lock().remove(id).is_some()
	}

	/// Closes the session's connection with [`REASON_SESSION_CLOSED`] if
	/// present; a no-op if absent. Deliberately does **not** remove the
	/// entry — the session's own handler removes itself once it observes
	/// the connection terminate, per SPEC_FULL.md §9's "registry vs.
	/// handler race" note.
	pub fn force_close(&self, id: &str) -> bool {
		// Hold the lock only long enough to read out the connection handle
		// (quinn::Connection is cheap to clone); the actual close happens
		// outside the lock.
		let conn = { self.sessions.lock().get(id).map(|session| session.connection().clone()) };

		match conn {
			Some(conn) => {
				conn.close(VarInt::from_u32(0), REASON_SESSION_CLOSED.as_bytes());
				true
			}
			None => false,
		}
	}

	/// Closes every session with [`REASON_SERVER_SHUTTING_DOWN`] and empties
	/// the map. The closes themselves happen after the lock is released.
	pub fn close_all(&self) {
		let drained: HashMap<String, Session> = std::mem::take(&mut *self.sessions.lock());
		for session in drained.into_values() {
			session.close(REASON_SERVER_SHUTTING_DOWN);
		}
	}

	pub fn len(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;
	use std::sync::Arc;

	use quinn::{ClientConfig, Endpoint, EndpointConfig, ServerConfig, TokioRuntime};

	use super::*;
	use crate::identity::Identity;

	fn install_provider() {
		let _ = rustls::crypto::ring::default_provider().install_default();
	}

	async fn loopback_session() -> (Session, Connection) {
		install_provider();
		let identity = Identity::generate().unwrap();
		let server_config: ServerConfig = crate::tls::server_config(&identity).unwrap();
		let client_config: ClientConfig = crate::tls::client_config(identity.fingerprint).unwrap();

		let server_socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let server_addr = server_socket.local_addr().unwrap();
		let server_endpoint =
			Endpoint::new(EndpointConfig::default(), Some(server_config), server_socket, Arc::new(TokioRuntime)).unwrap();

		let client_socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let mut client_endpoint = Endpoint::new(EndpointConfig::default(), None, client_socket, Arc::new(TokioRuntime)).unwrap();
		client_endpoint.set_default_client_config(client_config);

		let client_connecting = client_endpoint.connect(server_addr, "mtunnel").unwrap();
		let (client_conn, server_conn) = tokio::join!(client_connecting, async {
			server_endpoint.accept().await.unwrap().accept().unwrap().await
		});

		(Session::new(server_conn.unwrap()), client_conn.unwrap())
	}

	#[test]
	fn new_session_has_a_fresh_uuid() {
		// Doesn't need a real connection; this checks id shape invariants
		// independent of network setup cost.
		let id_format = uuid::Uuid::parse_str(&Uuid::new_v4().to_string());
		assert!(id_format.is_ok());
	}

	#[tokio::test]
	async fn registry_add_list_remove_round_trips() {
		let (session, _client_conn) = loopback_session().await;
		let registry = SessionRegistry::new();
		let id = registry.insert(session);

		assert_eq!(registry.list(), vec![id.clone()]);
		assert!(registry.remove(&id));
		assert!(registry.list().is_empty());
		assert!(registry.is_empty());
	}

	#[test]
	fn remove_on_absent_id_is_a_no_op() {
		let registry = SessionRegistry::new();
		assert!(!registry.remove("does-not-exist"));
	}

	#[test]
	fn force_close_on_absent_id_is_a_no_op() {
		let registry = SessionRegistry::new();
		assert!(!registry.force_close("does-not-exist"));
	}

	#[tokio::test]
	async fn force_close_does_not_remove_the_entry() {
		let (session, _client_conn) = loopback_session().await;
		let registry = SessionRegistry::new();
		let id = registry.insert(session);

		assert!(registry.force_close(&id));
		// Still present — the session's own handler is responsible for
		// removal once it observes the connection close.
		assert_eq!(registry.list(), vec![id]);
	}

	#[tokio::test]
	async fn concurrent_add_remove_leaves_registry_consistent() {
		let registry = Arc::new(SessionRegistry::new());
		let mut ids = Vec::new();
		for _ in 0..8 {
			let (session, _conn) = loopback_session().await;
			ids.push(registry.insert(session));
		}
		assert_eq!(registry.len(), 8);

		let mut tasks = tokio::task::JoinSet::new();
		for id in ids.iter().cloned().take(4) {
			let registry = registry.clone();
			tasks.spawn(async move { registry.remove(&id) });
		}
		while tasks.join_next().await.is_some() {}

		assert_eq!(registry.len(), 4);
		let remaining = registry.list();
		for id in ids.iter().skip(4) {
			assert!(remaining.contains(id));
		}
	}
}
