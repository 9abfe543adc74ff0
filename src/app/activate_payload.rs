use crate::connection::{CompletionCode, IpmiCommand, Message, NetFn, NotEnoughData};

/// The payload type being activated or deactivated. Only Serial-Over-LAN is
/// implemented; OEM payload types are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Sol,
}

impl PayloadType {
    fn value(&self) -> u8 {
        match self {
            PayloadType::Sol => 0x01,
        }
    }
}

/// The Activate Payload command (netfn App, cmd `0x48`).
///
/// Requests encrypted and authenticated delivery (aux byte `0xC0`) and no
/// alert suppression, matching the one supported configuration this crate
/// targets.
#[derive(Debug, Clone, Copy)]
pub struct ActivatePayload {
    payload_type: PayloadType,
    payload_instance: u8,
}

impl ActivatePayload {
    pub fn new(payload_type: PayloadType, payload_instance: u8) -> Self {
        Self {
            payload_type,
            payload_instance,
        }
    }
}

impl From<ActivatePayload> for Message {
    fn from(value: ActivatePayload) -> Self {
        Message::new_request(
            NetFn::App,
            0x48,
            vec![
                value.payload_type.value(),
                value.payload_instance,
                0xC0,
                0x00,
                0x00,
                0x00,
            ],
        )
    }
}

/// The response to [`ActivatePayload`].
#[derive(Debug, Clone, Copy)]
pub struct ActivatePayloadResponse {
    /// Maximum size, in bytes, of a payload the console may send to the BMC.
    pub max_outbound_payload_size: u16,
    /// Maximum size, in bytes, of a payload the BMC may send to the console.
    pub max_inbound_payload_size: u16,
    /// The UDP port the BMC will use for this payload instance.
    pub payload_udp_port: u16,
    /// The VLAN number in use for this payload instance, if any.
    pub payload_vlan_number: Option<u16>,
}

/// Errors specific to activating a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivatePayloadError {
    /// The BMC reported completion code `0x80`: the payload type is already active
    /// on another session and this session did not request exclusivity.
    PayloadAlreadyActive,
    /// The BMC reported completion code `0x81`: this payload type is disabled.
    PayloadTypeDisabled,
    /// The BMC reported completion code `0x82`: too many active SOL payload
    /// instances.
    TooManyActivePayloads,
    /// The BMC reported completion code `0x83`: the requested payload encryption
    /// does not match what the session negotiated.
    PayloadEncryptionMismatch,
    /// The BMC reported completion code `0x84`: the requested payload
    /// authentication does not match what the session negotiated.
    PayloadAuthenticationMismatch,
}

impl IpmiCommand for ActivatePayload {
    type Output = ActivatePayloadResponse;

    type Error = ActivatePayloadError;

    fn handle_completion_code(
        completion_code: CompletionCode,
        _data: &[u8],
    ) -> Option<Self::Error> {
        match completion_code {
            CompletionCode::CommandSpecific(0x80) => Some(ActivatePayloadError::PayloadAlreadyActive),
            CompletionCode::CommandSpecific(0x81) => Some(ActivatePayloadError::PayloadTypeDisabled),
            CompletionCode::CommandSpecific(0x82) => {
                Some(ActivatePayloadError::TooManyActivePayloads)
            }
            CompletionCode::CommandSpecific(0x83) => {
                Some(ActivatePayloadError::PayloadEncryptionMismatch)
            }
            CompletionCode::CommandSpecific(0x84) => {
                Some(ActivatePayloadError::PayloadAuthenticationMismatch)
            }
            _ => None,
        }
    }

    fn parse_success_response(data: &[u8]) -> Result<Self::Output, Self::Error> {
        if data.len() < 10 {
            // Not technically possible to report via this error type, but the
            // dispatcher treats a malformed success response the same as a
            // dropped packet, so this can only surface as a retry/timeout.
            return Err(ActivatePayloadError::PayloadTypeDisabled);
        }

        let max_outbound_payload_size = u16::from_le_bytes([data[4], data[5]]);
        let max_inbound_payload_size = u16::from_le_bytes([data[6], data[7]]);
        let payload_udp_port = u16::from_le_bytes([data[8], data[9]]);
        let payload_vlan_number = if data.len() >= 12 {
            match u16::from_le_bytes([data[10], data[11]]) {
                0xFFFF => None,
                v => Some(v),
            }
        } else {
            None
        };

        Ok(ActivatePayloadResponse {
            max_outbound_payload_size,
            max_inbound_payload_size,
            payload_udp_port,
            payload_vlan_number,
        })
    }
}

/// The Deactivate Payload command (netfn App, cmd `0x49`).
#[derive(Debug, Clone, Copy)]
pub struct DeactivatePayload {
    payload_type: PayloadType,
    payload_instance: u8,
}

impl DeactivatePayload {
    pub fn new(payload_type: PayloadType, payload_instance: u8) -> Self {
        Self {
            payload_type,
            payload_instance,
        }
    }
}

impl From<DeactivatePayload> for Message {
    fn from(value: DeactivatePayload) -> Self {
        Message::new_request(
            NetFn::App,
            0x49,
            vec![
                value.payload_type.value(),
                value.payload_instance,
                0x00,
                0x00,
                0x00,
                0x00,
            ],
        )
    }
}

impl IpmiCommand for DeactivatePayload {
    type Output = ();

    type Error = NotEnoughData;

    fn parse_success_response(_data: &[u8]) -> Result<Self::Output, Self::Error> {
        Ok(())
    }
}
