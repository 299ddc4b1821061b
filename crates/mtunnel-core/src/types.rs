use serde::{Deserialize, Serialize};

/// The local transport kind a session forwards over: what the host dials and
/// what the client listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
	Tcp,
	Udp,
}

impl Network {
	pub fn as_str(&self) -> &'static str {
		match self {
			Network::Tcp => "tcp",
			Network::Udp => "udp",
		}
	}

	pub fn tag(&self) -> u8 {
		match self {
			Network::Tcp => 0,
			Network::Udp => 1,
		}
	}

	pub fn from_tag(tag: u8) -> Option<Self> {
		match tag {
			0 => Some(Network::Tcp),
			1 => Some(Network::Udp),
			_ => None,
		}
	}
}

impl std::str::FromStr for Network {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"tcp" => Ok(Network::Tcp),
			"udp" => Ok(Network::Udp),
			other => Err(format!("unknown network {other:?}, expected tcp or udp")),
		}
	}
}

impl std::fmt::Display for Network {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}
