use std::num::NonZeroU32;

use crate::connection::{IpmiCommand, Message, NetFn};

use super::{AuthError, AuthType};

/// The challenge string and temporary session id returned by Get Session Challenge.
#[derive(Debug, Clone, Copy)]
pub struct SessionChallenge {
    pub temporary_session_id: NonZeroU32,
    pub challenge_string: [u8; 16],
}

/// The Get Session Challenge command, the first step of an IPMI 1.5 login.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GetSessionChallenge {
    auth_type: AuthType,
    username: [u8; 16],
}

impl GetSessionChallenge {
    /// Create a new `GetSessionChallenge`.
    ///
    /// Returns `None` if `username` is longer than 16 bytes.
    pub fn new(auth_type: AuthType, username: Option<&str>) -> Option<Self> {
        let bytes = username.map(|u| u.as_bytes()).unwrap_or(&[]);
        if bytes.len() > 16 {
            return None;
        }

        let mut username = [0u8; 16];
        bytes
            .iter()
            .enumerate()
            .for_each(|(idx, b)| username[idx] = *b);

        Some(Self {
            auth_type,
            username,
        })
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn username(&self) -> &str {
        let end = self.username.iter().take_while(|v| **v != 0).count();
        core::str::from_utf8(&self.username[..end]).unwrap_or("")
    }
}

impl From<GetSessionChallenge> for Message {
    fn from(value: GetSessionChallenge) -> Message {
        let mut data = vec![0u8; 17];

        data[0] = value.auth_type.into();
        data[1..].copy_from_slice(&value.username);

        Message::new_request(NetFn::App, 0x39, data)
    }
}

impl IpmiCommand for GetSessionChallenge {
    type Output = SessionChallenge;

    type Error = AuthError;

    fn parse_success_response(data: &[u8]) -> Result<Self::Output, Self::Error> {
        if data.len() != 20 {
            return Err(AuthError::NotEnoughData);
        }

        let temporary_session_id =
            NonZeroU32::try_from(u32::from_le_bytes(data[0..4].try_into().unwrap()))
                .map_err(|_| AuthError::InvalidZeroSession)?;

        let challenge_string = data[4..20].try_into().unwrap();

        Ok(SessionChallenge {
            temporary_session_id,
            challenge_string,
        })
    }
}
