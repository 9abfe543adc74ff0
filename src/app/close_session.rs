use std::num::NonZeroU32;

use crate::connection::{IpmiCommand, Message, NetFn, NotEnoughData};

/// The Close Session command (netfn App, cmd `0x3C`), used to log out of an
/// established session.
#[derive(Debug, Clone, Copy)]
pub struct CloseSession {
    session_id: u32,
}

impl CloseSession {
    pub fn new(session_id: NonZeroU32) -> Self {
        Self {
            session_id: session_id.get(),
        }
    }
}

impl From<CloseSession> for Message {
    fn from(value: CloseSession) -> Self {
        Message::new_request(NetFn::App, 0x3C, value.session_id.to_le_bytes().to_vec())
    }
}

impl IpmiCommand for CloseSession {
    type Output = ();

    type Error = NotEnoughData;

    fn parse_success_response(_data: &[u8]) -> Result<Self::Output, Self::Error> {
        Ok(())
    }
}
