//! A pure-Rust IPMI client: session management (RMCP/IPMI 1.5 and
//! RMCP+/IPMI 2.0 with RAKP login), a cooperative multi-session dispatcher
//! over a single UDP socket, and Serial-Over-LAN.
//!
//! The entry point is [`SessionManager`]: bind one per process, open
//! [`Session`]s through it, and drive [`SessionManager::wait_for_response`]
//! (directly, or implicitly via [`Session::raw_command`]) to make progress.
//! [`Console`] layers a Serial-Over-LAN byte stream on top of an established
//! session.

pub mod app;

pub mod connection;

mod codec;

mod error;
pub use error::{ConfigurationError, IpmiError};

mod transport;

mod manager;
pub use manager::{Console, SessionManager};

pub mod session;
pub use session::{CommandError, CommandResponse, LoginError, Session, SolSink};
