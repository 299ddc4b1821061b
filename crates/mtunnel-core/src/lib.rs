pub mod error;
pub mod identity;
pub mod log;
pub mod pump;
pub mod session;
pub mod stun;
pub mod tls;
pub mod token;
pub mod types;

pub use error::{IdentityError, StunError, TokenError};
pub use identity::Identity;
pub use session::{Session, SessionRegistry};
pub use token::ConnectionToken;
pub use types::Network;
