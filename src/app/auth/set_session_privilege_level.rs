use crate::connection::{IpmiCommand, Message, NetFn, NotEnoughData};

use super::PrivilegeLevel;

/// The Set Session Privilege Level command (netfn App, cmd `0x3B`), sent as
/// the final step of both the IPMI 1.5 and RMCP+ login state machines to
/// raise the session to its requested privilege level.
#[derive(Debug, Clone, Copy)]
pub struct SetSessionPrivilegeLevel {
    requested: PrivilegeLevel,
}

impl SetSessionPrivilegeLevel {
    pub fn new(requested: PrivilegeLevel) -> Self {
        Self { requested }
    }
}

impl From<SetSessionPrivilegeLevel> for Message {
    fn from(value: SetSessionPrivilegeLevel) -> Self {
        Message::new_request(NetFn::App, 0x3B, vec![value.requested.into()])
    }
}

impl IpmiCommand for SetSessionPrivilegeLevel {
    type Output = PrivilegeLevel;

    type Error = NotEnoughData;

    fn parse_success_response(data: &[u8]) -> Result<Self::Output, Self::Error> {
        if data.is_empty() {
            return Err(NotEnoughData);
        }
        PrivilegeLevel::try_from(data[0]).map_err(|_| NotEnoughData)
    }
}
