use clap::{ArgAction, Parser, ValueEnum};
use mtunnel_core::Network;

/// `mtunnel -actas <host|client> -network <tcp|udp> -port <PORT> [-token <TOKEN>] [-v]...`
///
/// Intentionally small: no subcommands, no config file flags, no
/// daemonization flags. The persisted-configuration Non-goal means there is
/// no file-backed layer to parse into; this is the whole surface.
#[derive(Parser)]
#[command(about, long_about = None)]
pub struct Cli {
	/// Role this process plays: the side that owns the forwarded service,
	/// or the side that exposes a local listener for it.
	#[arg(long = "actas", value_enum, default_value_t = Role::Host)]
	pub actas: Role,

	/// Local transport kind: what the host dials and the client listens on.
	#[arg(long, value_enum, default_value_t = CliNetwork::Tcp)]
	pub network: CliNetwork,

	/// Host: local target port to forward to. Client: local listener port.
	#[arg(long)]
	pub port: u16,

	/// Client only: the base64 connection token emitted by the host.
	#[arg(long)]
	pub token: Option<String>,

	/// STUN server to query for the host's reflexive address.
	#[arg(long, default_value = "stun.l.google.com:19302")]
	pub stun_server: String,

	/// Increase log verbosity; repeatable (-v, -vv).
	#[arg(short = 'v', action = ArgAction::Count)]
	pub verbose: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Role {
	Host,
	Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CliNetwork {
	Tcp,
	Udp,
}

impl From<CliNetwork> for Network {
	fn from(value: CliNetwork) -> Self {
		match value {
			CliNetwork::Tcp => Network::Tcp,
			CliNetwork::Udp => Network::Udp,
		}
	}
}
