//! IPMI 1.5 (`authtype` 0 or 2) RMCP session framing and MD5 authentication.

use md5::{Digest, Md5};

use super::RMCP_HEADER;

/// Total-frame lengths at which a legacy pad byte must be appended; an
/// artifact of some older BMCs' assumptions about packet sizes.
const LEGACY_PAD_LENGTHS: [usize; 5] = [56, 84, 112, 128, 156];

/// Compute the IPMI 1.5 MD5 session authentication code:
/// `MD5(password(16) || session_id(LE32) || payload || sequence(LE32) || password(16))`.
pub fn md5_auth_code(password: &[u8; 16], session_id: u32, payload: &[u8], sequence: u32) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(password);
    hasher.update(session_id.to_le_bytes());
    hasher.update(payload);
    hasher.update(sequence.to_le_bytes());
    hasher.update(password);
    hasher.finalize().into()
}

/// Zero-pad a username/password to 16 bytes as IPMI 1.5 authentication codes
/// require. Returns `None` if `value` is already longer than 16 bytes.
pub fn pad16(value: &[u8]) -> Option<[u8; 16]> {
    if value.len() > 16 {
        return None;
    }
    let mut padded = [0u8; 16];
    padded[..value.len()].copy_from_slice(value);
    Some(padded)
}

/// The fields of an IPMI 1.5 frame to build.
pub struct Frame<'a> {
    pub auth_type: u8,
    pub sequence: u32,
    pub session_id: u32,
    pub auth_code: Option<[u8; 16]>,
    pub payload: &'a [u8],
}

/// Build a complete IPMI 1.5 RMCP frame.
pub fn build_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + frame.payload.len());
    out.extend_from_slice(&RMCP_HEADER);
    out.push(frame.auth_type);
    out.extend_from_slice(&frame.sequence.to_le_bytes());
    out.extend_from_slice(&frame.session_id.to_le_bytes());
    if let Some(code) = frame.auth_code {
        out.extend_from_slice(&code);
    }
    out.push(frame.payload.len() as u8);
    out.extend_from_slice(frame.payload);

    if LEGACY_PAD_LENGTHS.contains(&out.len()) {
        out.push(0);
    }

    out
}

/// Errors while parsing an inbound IPMI 1.5 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    TooShort,
    BadHeader,
    BadLength,
}

/// A parsed IPMI 1.5 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub auth_type: u8,
    pub sequence: u32,
    pub session_id: u32,
    pub auth_code: Option<[u8; 16]>,
    pub payload: Vec<u8>,
}

/// Parse an inbound IPMI 1.5 frame. Does not verify the auth code; callers
/// with a password should check `auth_code` against [`md5_auth_code`]
/// themselves and drop the packet on mismatch.
pub fn parse_frame(raw: &[u8]) -> Result<Parsed, ParseError> {
    if raw.len() < 10 {
        return Err(ParseError::TooShort);
    }
    if raw[0..4] != RMCP_HEADER {
        return Err(ParseError::BadHeader);
    }

    let auth_type = raw[4];
    let sequence = u32::from_le_bytes(raw[5..9].try_into().unwrap());
    let session_id = u32::from_le_bytes(raw[9..13].try_into().unwrap());

    let mut offset = 13;
    let auth_code = if auth_type != 0 {
        if raw.len() < offset + 16 {
            return Err(ParseError::TooShort);
        }
        let code: [u8; 16] = raw[offset..offset + 16].try_into().unwrap();
        offset += 16;
        Some(code)
    } else {
        None
    };

    if raw.len() < offset + 1 {
        return Err(ParseError::TooShort);
    }
    let len = raw[offset] as usize;
    offset += 1;

    if raw.len() < offset + len {
        return Err(ParseError::BadLength);
    }

    Ok(Parsed {
        auth_type,
        sequence,
        session_id,
        auth_code,
        payload: raw[offset..offset + len].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_no_auth() {
        let payload = [1, 2, 3, 4, 5];
        let frame = Frame {
            auth_type: 0,
            sequence: 7,
            session_id: 0,
            auth_code: None,
            payload: &payload,
        };
        let built = build_frame(&frame);
        let parsed = parse_frame(&built).unwrap();
        assert_eq!(parsed.auth_type, 0);
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.auth_code, None);
    }

    #[test]
    fn round_trip_with_md5_auth() {
        let payload = [0xAAu8; 10];
        let code = md5_auth_code(&[0u8; 16], 0x1234, &payload, 1);
        let frame = Frame {
            auth_type: 2,
            sequence: 1,
            session_id: 0x1234,
            auth_code: Some(code),
            payload: &payload,
        };
        let built = build_frame(&frame);
        let parsed = parse_frame(&built).unwrap();
        assert_eq!(parsed.auth_code, Some(code));
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn legacy_pad_byte_appended() {
        // Header(4)+authtype(1)+seq(4)+sid(4)+len(1) = 14 bytes of fixed overhead.
        // Pick a payload length so the total lands exactly on 56.
        let payload = vec![0u8; 56 - 14];
        let frame = Frame {
            auth_type: 0,
            sequence: 0,
            session_id: 0,
            auth_code: None,
            payload: &payload,
        };
        let built = build_frame(&frame);
        assert_eq!(built.len(), 57);
    }
}
