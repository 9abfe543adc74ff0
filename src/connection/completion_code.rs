/// The reason a BMC gave for being temporarily unable to answer a request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResponseUnavailableReason {
    Unknown,
    SDRInUpdate,
    DeviceInFwUpdate,
    BMCInitializing,
}

/// A parsed IPMI completion code.
///
/// Generic completion codes (`0xC0`-`0xD6`, `0xFF`) are parsed into named
/// variants. Command-specific (`0x80`-`0xBE`) and OEM (`0x01`-`0x7E`) codes are
/// carried through as their raw value; a caller-supplied lookup table (see
/// `completion_code::describe`) is expected to give them meaning for a
/// specific `(netfn, cmd)` pair.
#[derive(Clone, Copy, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum CompletionCode {
    NodeBusy,
    InvalidCommand,
    InvalidCommandForLun,
    ProcessingTimeout,
    OutOfSpace,
    ReservationCancelledOrInvalidId,
    RequestDataTruncated,
    RequestDataLenInvalid,
    RequestDataLengthLimitExceeded,
    ParameterOutOfRange,
    CannotReturnNumOfRequestedBytes,
    RequestedDatapointNotPresent,
    InvalidDataFieldInRequest,
    CommandIllegalForSensorOrRecord,
    ResponseUnavailable { reason: ResponseUnavailableReason },
    CannotExecuteDuplicateRequest,
    DestinationUnavailable,
    InsufficientPrivilege,
    CannotExecuteCommandInCurrentState,
    SubFunctionDisabled,
    Unspecified,
    Oem(u8),
    CommandSpecific(u8),
    Reserved(u8),
}

impl TryFrom<u8> for CompletionCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let value = match value {
            0 => return Err(()),
            0xC0 => Self::NodeBusy,
            0xC1 => Self::InvalidCommand,
            0xC2 => Self::InvalidCommandForLun,
            0xC3 => Self::ProcessingTimeout,
            0xC4 => Self::OutOfSpace,
            0xC5 => Self::ReservationCancelledOrInvalidId,
            0xC6 => Self::RequestDataTruncated,
            0xC7 => Self::RequestDataLenInvalid,
            0xC8 => Self::RequestDataLengthLimitExceeded,
            0xC9 => Self::ParameterOutOfRange,
            0xCA => Self::CannotReturnNumOfRequestedBytes,
            0xCB => Self::RequestedDatapointNotPresent,
            0xCC => Self::InvalidDataFieldInRequest,
            0xCD => Self::CommandIllegalForSensorOrRecord,
            0xCE => Self::ResponseUnavailable {
                reason: ResponseUnavailableReason::Unknown,
            },
            0xCF => Self::CannotExecuteDuplicateRequest,
            0xD0 => Self::ResponseUnavailable {
                reason: ResponseUnavailableReason::SDRInUpdate,
            },
            0xD1 => Self::ResponseUnavailable {
                reason: ResponseUnavailableReason::DeviceInFwUpdate,
            },
            0xD2 => Self::ResponseUnavailable {
                reason: ResponseUnavailableReason::BMCInitializing,
            },
            0xD3 => Self::DestinationUnavailable,
            0xD4 => Self::InsufficientPrivilege,
            0xD5 => Self::CannotExecuteCommandInCurrentState,
            0xD6 => Self::SubFunctionDisabled,
            0xFF => Self::Unspecified,
            0x01..=0x7E => Self::Oem(value),
            0x80..=0xBE => Self::CommandSpecific(value),
            v => Self::Reserved(v),
        };

        Ok(value)
    }
}

impl CompletionCode {
    /// Whether this completion code is a reserved value or not.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved(_))
    }

    /// Look up a human-readable description for this completion code.
    ///
    /// Consults `command_specific` first (keyed by the netfn/cmd pair the code
    /// was returned for) and falls back to a small built-in table of the
    /// generic codes. Returns `None` for command-specific/OEM codes that the
    /// caller's table doesn't cover.
    pub fn describe(
        &self,
        netfn: u8,
        cmd: u8,
        command_specific: &dyn Fn(u8, u8, u8) -> Option<&'static str>,
    ) -> Option<&'static str> {
        if let Self::CommandSpecific(raw) | Self::Oem(raw) = self {
            if let Some(desc) = command_specific(netfn, cmd, *raw) {
                return Some(desc);
            }
        }

        let generic = match self {
            Self::NodeBusy => "Node busy",
            Self::InvalidCommand => "Invalid command",
            Self::InvalidCommandForLun => "Command invalid for given LUN",
            Self::ProcessingTimeout => "Timeout while processing command",
            Self::OutOfSpace => "Out of space",
            Self::ReservationCancelledOrInvalidId => "Reservation canceled or invalid reservation ID",
            Self::RequestDataTruncated => "Request data truncated",
            Self::RequestDataLenInvalid => "Request data length invalid",
            Self::RequestDataLengthLimitExceeded => "Request data field length limit exceeded",
            Self::ParameterOutOfRange => "Parameter out of range",
            Self::CannotReturnNumOfRequestedBytes => "Cannot return number of requested data bytes",
            Self::RequestedDatapointNotPresent => "Requested sensor, data, or record not present",
            Self::InvalidDataFieldInRequest => "Invalid data field in request",
            Self::CommandIllegalForSensorOrRecord => "Command illegal for specified sensor or record type",
            Self::ResponseUnavailable { .. } => "Command response could not be provided",
            Self::CannotExecuteDuplicateRequest => "Cannot execute duplicated request",
            Self::DestinationUnavailable => "Destination unavailable",
            Self::InsufficientPrivilege => "Insufficient privilege level",
            Self::CannotExecuteCommandInCurrentState => "Command not supported in present state",
            Self::SubFunctionDisabled => "Command sub-function disabled or unavailable",
            Self::Unspecified => "Unspecified error",
            Self::Oem(_) | Self::CommandSpecific(_) | Self::Reserved(_) => return None,
        };

        Some(generic)
    }
}
