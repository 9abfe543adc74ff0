//! The IPMI "core" request/response payload shared by IPMI 1.5 and IPMI 2.0:
//! `addr, netfn<<2, checksum1, addr, seqlun, cmd, data..., checksum2`.

use super::checksum::Checksum;

/// The address this crate uses as the responder (BMC) slave address on
/// outbound requests.
pub const RS_ADDR: u8 = 0x20;
/// The address this crate uses as its own (software ID) requester address.
pub const RQ_ADDR: u8 = 0x81;

/// A decoded core IPMI payload, with the two address/checksum fields
/// stripped away.
#[derive(Debug, Clone, PartialEq)]
pub struct CorePayload {
    pub netfn: u8,
    pub seq_lun: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

/// Build the core payload for a request from this client to the BMC.
pub fn build_core_payload(netfn: u8, seq_lun: u8, cmd: u8, data: &[u8]) -> Vec<u8> {
    let netfn_lun = netfn << 2;
    let mut out = Vec::with_capacity(6 + data.len());
    out.push(RS_ADDR);
    out.push(netfn_lun);
    out.push(Checksum::from_iter([RS_ADDR, netfn_lun].into_iter()));
    out.push(RQ_ADDR);
    out.push(seq_lun);
    out.push(cmd);
    out.extend_from_slice(data);
    let cs2 = Checksum::from_iter(
        [RQ_ADDR, seq_lun, cmd]
            .into_iter()
            .chain(data.iter().copied()),
    );
    out.push(cs2);
    out
}

/// Errors returned while parsing a core payload out of an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorePayloadError {
    TooShort,
    BadChecksum1,
    BadChecksum2,
}

/// Parse a core payload. This is direction-agnostic: it does not assume
/// which address field is the BMC's and which is ours, since a response
/// swaps their roles relative to the request that was sent.
pub fn parse_core_payload(raw: &[u8]) -> Result<CorePayload, CorePayloadError> {
    if raw.len() < 6 {
        return Err(CorePayloadError::TooShort);
    }

    let cs1 = Checksum::from_iter(raw[0..2].iter().copied());
    if cs1 != raw[2] {
        return Err(CorePayloadError::BadChecksum1);
    }

    let data_end = raw.len() - 1;
    let cs2 = Checksum::from_iter(raw[3..data_end].iter().copied());
    if cs2 != raw[data_end] {
        return Err(CorePayloadError::BadChecksum2);
    }

    Ok(CorePayload {
        netfn: raw[1] >> 2,
        seq_lun: raw[4],
        cmd: raw[5],
        data: raw[6..data_end].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for len in 0..=250usize {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let built = build_core_payload(0x06, 0x04, 0x01, &data);
            let parsed = parse_core_payload(&built).unwrap();
            assert_eq!(parsed.netfn, 0x06);
            assert_eq!(parsed.seq_lun, 0x04);
            assert_eq!(parsed.cmd, 0x01);
            assert_eq!(parsed.data, data);
        }
    }

    #[test]
    fn bad_checksum_detected() {
        let mut built = build_core_payload(0x06, 0x00, 0x01, &[1, 2, 3]);
        *built.last_mut().unwrap() ^= 0xFF;
        assert_eq!(
            parse_core_payload(&built),
            Err(CorePayloadError::BadChecksum2)
        );
    }
}
