//! Application-class (NetFn App) IPMI commands: device identification,
//! channel authentication/session setup, and session teardown.

pub mod auth;

mod get_device_id;
pub use get_device_id::{DeviceId, GetDeviceId};

mod close_session;
pub use close_session::CloseSession;

mod activate_payload;
pub use activate_payload::{ActivatePayload, ActivatePayloadResponse, DeactivatePayload};
