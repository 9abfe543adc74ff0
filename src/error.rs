use crate::connection::{CompletionCode, NetFn};
use crate::session::{CommandError, LoginError};

/// Top-level error type returned by the consumer-facing APIs of this crate.
///
/// Mirrors the error-kind taxonomy laid out for this crate: configuration
/// failures are reported eagerly by constructors, authentication and protocol
/// failures surface through [`LoginError`]/[`CommandError`], and everything
/// else is either a transport failure or a dropped packet that the session's
/// own retry logic recovers from (and therefore never reaches this type).
#[derive(Debug, Clone, PartialEq)]
pub enum IpmiError {
    /// A configuration value (username, password, Kg) was not valid.
    Configuration(ConfigurationError),
    /// The login/RAKP handshake failed.
    Login(LoginError),
    /// A command exchange failed after the session was established.
    Command(CommandError),
    /// The response did not match the request that was sent.
    UnexpectedResponse {
        netfn_sent: NetFn,
        netfn_recvd: NetFn,
        cmd_sent: u8,
        cmd_recvd: u8,
    },
    /// The BMC returned a non-success completion code that the command's own
    /// [`crate::connection::IpmiCommand::handle_completion_code`] did not
    /// interpret specially.
    Failed {
        netfn: NetFn,
        cmd: u8,
        completion_code: CompletionCode,
        data: Vec<u8>,
    },
    /// Binding or configuring the underlying UDP socket failed.
    Transport(std::io::ErrorKind),
}

impl From<ConfigurationError> for IpmiError {
    fn from(value: ConfigurationError) -> Self {
        Self::Configuration(value)
    }
}

impl From<LoginError> for IpmiError {
    fn from(value: LoginError) -> Self {
        Self::Login(value)
    }
}

impl From<CommandError> for IpmiError {
    fn from(value: CommandError) -> Self {
        Self::Command(value)
    }
}

/// A configuration value supplied to [`crate::session::Session::new`] was invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The username is longer than the 16 bytes IPMI allows.
    UsernameTooLong,
    /// The password (or Kg key) is longer than the 20 bytes IPMI allows.
    PasswordTooLong,
}
