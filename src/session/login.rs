//! The login state machine's state enum and the errors it can terminate
//! with.

use crate::app::auth::PrivilegeLevel;

/// Where a [`crate::session::Session`] is in its login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// Not yet started, or about to (re-)send Get Channel Authentication
    /// Capabilities.
    Init,
    /// Waiting on the Get Session Challenge response (IPMI 1.5 branch).
    AwaitingSessionChallenge,
    /// Waiting on the Activate Session response (IPMI 1.5 branch).
    AwaitingActivateSession,
    /// RMCP+ Open Session Request sent, waiting on the response.
    OpenSession,
    /// RAKP1 sent, waiting on RAKP2.
    ExpectingRakp2,
    /// RAKP3 sent, waiting on RAKP4.
    ExpectingRakp4,
    /// Waiting on the final Set Session Privilege Level response, common to
    /// both branches.
    AwaitingPrivilegeLevel,
    /// Login succeeded; the session can exchange commands.
    Established,
    /// Login failed permanently; the session will never retry.
    Failed,
}

impl LoginState {
    /// Whether a session in this state is allowed to exchange `raw_command`s.
    pub fn is_established(&self) -> bool {
        matches!(self, LoginState::Established)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoginState::Failed)
    }
}

/// Why a login attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    /// The BMC does not support any authentication type this crate
    /// implements (MD5 for IPMI 1.5, RAKP/HMAC-SHA1 for IPMI 2.0).
    NoSupportedAuthType,
    /// RAKP2's key-exchange auth code did not match what we computed from
    /// the configured password.
    IncorrectPassword,
    /// RAKP4's integrity check value did not match what we computed from
    /// the derived SIK; almost always means a wrong `Kg`.
    InvalidRakp4IntegrityCode,
    /// The BMC reported a non-zero RMCP+ status code at some stage of the
    /// handshake. Carries the stringified `rmcp_codes` lookup.
    Rmcp(String),
    /// The cumulative per-retry timeout was exceeded before the handshake
    /// completed.
    Timeout,
    /// A malformed response was encountered at a point where the login
    /// cannot recover by simply dropping the packet (the rest of the
    /// protocol drops malformed packets silently and relies on the retry
    /// timer; this variant is for cases distinct enough to be worth
    /// reporting, e.g. "BMC is not IPMI 2.0 and IPMI 1.5 probing is
    /// disallowed").
    Protocol(&'static str),
}

impl core::fmt::Display for LoginError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoginError::NoSupportedAuthType => write!(f, "no supported authentication type"),
            LoginError::IncorrectPassword => write!(f, "Incorrect password provided"),
            LoginError::InvalidRakp4IntegrityCode => {
                write!(f, "Invalid RAKP4 integrity code (wrong Kg?)")
            }
            LoginError::Rmcp(s) => write!(f, "{s}"),
            LoginError::Timeout => write!(f, "timeout"),
            LoginError::Protocol(s) => write!(f, "{s}"),
        }
    }
}

/// The IPMI version a session negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpmiVersion {
    V1_5,
    V2_0,
}

/// The confidentiality algorithm in effect for a session's RMCP+ traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidentialityAlgorithm {
    None,
    AesCbc128,
}

/// The integrity algorithm in effect for a session's RMCP+ traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityAlgorithm {
    None,
    HmacSha1_96,
}

/// Everything the RAKP handshake accumulates before the session is
/// established. Dropped (zeroed by virtue of being replaced) once
/// `Established` is reached and the derived keys have been copied out.
#[derive(Debug, Clone, Default)]
pub struct RakpContext {
    pub tag: u8,
    pub random_local: [u8; 16],
    pub random_remote: [u8; 16],
    pub remote_guid: [u8; 16],
}

/// Parameters supplied to [`crate::session::Session::new`] that configure
/// the login handshake.
#[derive(Debug, Clone)]
pub struct LoginParams {
    pub privilege: PrivilegeLevel,
    /// Allow falling back to an IPMI 1.5-only probe if the BMC rejects the
    /// IPMI 2.0 probe byte.
    pub allow_ipmi15: bool,
}

impl Default for LoginParams {
    fn default() -> Self {
        Self {
            privilege: PrivilegeLevel::default(),
            allow_ipmi15: true,
        }
    }
}
