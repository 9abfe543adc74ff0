//! Wire-level encoding and decoding for RMCP / IPMI 1.5 and RMCP+ / IPMI 2.0
//! frames.
//!
//! Everything in this module is a pure function over byte slices: no socket,
//! no session state. The [`crate::session`] module is the only caller.

pub mod checksum;
pub mod core_payload;
pub mod rakp;
pub mod v1_5;
pub mod v2_0;

pub use core_payload::{build_core_payload, parse_core_payload, CorePayload, CorePayloadError};

/// The shared RMCP header that prefixes every IPMI-class RMCP packet:
/// version `0x06`, reserved `0x00`, sequence `0xFF` (no RMCP ACK wanted),
/// class `0x07` (IPMI).
pub const RMCP_HEADER: [u8; 4] = [0x06, 0x00, 0xFF, 0x07];
