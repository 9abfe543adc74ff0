//! RMCP+ (IPMI 2.0, `authtype` 0x06) session framing: payload types, the
//! integrity (HMAC-SHA1-96) and confidentiality (AES-CBC-128) wrappers.

use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::RMCP_HEADER;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// `authtype` value for an RMCP+ (IPMI 2.0) session packet.
pub const AUTH_TYPE_RMCP_PLUS: u8 = 0x06;

/// The mutual-authentication bit (bit 6) of the payload-type byte.
const INTEGRITY_BIT: u8 = 0x40;
/// The confidentiality bit (bit 7) of the payload-type byte.
const CONFIDENTIALITY_BIT: u8 = 0x80;

/// The RMCP+ payload type, encoded in the low 6 bits of the payload-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Ipmi,
    Sol,
    OpenSessionRequest,
    OpenSessionResponse,
    Rakp1,
    Rakp2,
    Rakp3,
    Rakp4,
}

impl PayloadType {
    pub fn code(self) -> u8 {
        match self {
            PayloadType::Ipmi => 0x00,
            PayloadType::Sol => 0x01,
            PayloadType::OpenSessionRequest => 0x10,
            PayloadType::OpenSessionResponse => 0x11,
            PayloadType::Rakp1 => 0x12,
            PayloadType::Rakp2 => 0x13,
            PayloadType::Rakp3 => 0x14,
            PayloadType::Rakp4 => 0x15,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let ty = match code {
            0x00 => Self::Ipmi,
            0x01 => Self::Sol,
            0x10 => Self::OpenSessionRequest,
            0x11 => Self::OpenSessionResponse,
            0x12 => Self::Rakp1,
            0x13 => Self::Rakp2,
            0x14 => Self::Rakp3,
            0x15 => Self::Rakp4,
            _ => return None,
        };
        Some(ty)
    }
}

/// Inputs needed to build one RMCP+ frame.
pub struct BuildParams<'a> {
    pub payload_type: PayloadType,
    pub session_id: u32,
    pub sequence: u32,
    pub payload: &'a [u8],
    /// `Some` to encrypt the payload with AES-CBC-128 (K2[0..16]).
    pub confidentiality_key: Option<&'a [u8; 16]>,
    /// A fresh random IV, required whenever `confidentiality_key` is `Some`.
    pub iv: Option<[u8; 16]>,
    /// `Some` to append an HMAC-SHA1-96 integrity trailer keyed with K1.
    pub integrity_key: Option<&'a [u8]>,
}

/// Build a complete RMCP+ frame: header, session/sequence ids, optionally
/// encrypted payload, optionally integrity-protected trailer.
pub fn build_frame(params: &BuildParams) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + params.payload.len());
    out.extend_from_slice(&RMCP_HEADER);
    out.push(AUTH_TYPE_RMCP_PLUS);

    let mut type_byte = params.payload_type.code();
    if params.integrity_key.is_some() {
        type_byte |= INTEGRITY_BIT;
    }
    if params.confidentiality_key.is_some() {
        type_byte |= CONFIDENTIALITY_BIT;
    }
    out.push(type_byte);

    out.extend_from_slice(&params.session_id.to_le_bytes());
    out.extend_from_slice(&params.sequence.to_le_bytes());

    let body = if let Some(key) = params.confidentiality_key {
        let iv = params.iv.expect("iv required when encrypting");
        encrypt_payload(key, iv, params.payload)
    } else {
        params.payload.to_vec()
    };

    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&body);

    if let Some(ikey) = params.integrity_key {
        append_integrity_trailer(&mut out, ikey);
    }

    out
}

/// Pad `payload` per IPMI table 13-20 (pad bytes `1, 2, 3, ..., n` then a
/// pad-length byte so the whole block is a multiple of 16) and AES-CBC
/// encrypt it, prefixed with the IV.
fn encrypt_payload(key: &[u8; 16], iv: [u8; 16], payload: &[u8]) -> Vec<u8> {
    let pad_len = {
        let rem = (payload.len() + 1) % 16;
        if rem == 0 {
            0
        } else {
            16 - rem
        }
    };

    let mut padded = payload.to_vec();
    for i in 1..=pad_len {
        padded.push(i as u8);
    }
    padded.push(pad_len as u8);

    let ciphertext = Aes128CbcEnc::new(key.into(), &iv.into())
        .encrypt_padded_vec_mut::<NoPadding>(&padded);

    let mut out = Vec::with_capacity(16 + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Append `0xFF` alignment padding, a pad-length byte, the reserved `0x07`
/// byte, then a 12-byte HMAC-SHA1-96 trailer over `out[4..]` (i.e. from the
/// authtype byte through the reserved byte).
fn append_integrity_trailer(out: &mut Vec<u8>, integrity_key: &[u8]) {
    let mut pad_count = 0usize;
    while (out.len() + pad_count + 2) % 4 != 0 {
        pad_count += 1;
    }
    for _ in 0..pad_count {
        out.push(0xFF);
    }
    out.push(pad_count as u8);
    out.push(0x07);

    // A HMAC key of any length is valid; this can only fail for a key length
    // the the hmac crate considers invalid, which doesn't happen for SHA1's
    // arbitrary-length keys.
    let mut mac = HmacSha1::new_from_slice(integrity_key).expect("hmac key");
    mac.update(&out[4..]);
    let digest = mac.finalize().into_bytes();
    out.extend_from_slice(&digest[..12]);
}

/// Errors while parsing an inbound RMCP+ frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    TooShort,
    BadHeader,
    BadAuthType,
    BadPayloadType,
    MissingIntegrityKey,
    BadHmac,
    BadTrailer,
    MissingConfidentialityKey,
    BadPadding,
}

/// A parsed RMCP+ frame with confidentiality/integrity already peeled off.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub payload_type: PayloadType,
    pub authenticated: bool,
    pub encrypted: bool,
    pub session_id: u32,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

/// Parse an inbound RMCP+ frame.
///
/// `integrity_key` must be supplied if the payload-type byte's mutual-auth
/// bit is set; `confidentiality_key` must be supplied if the confidentiality
/// bit is set. Passing `None` for a key the frame needs is reported as a
/// distinct error from a bad HMAC, but both should be treated as "drop the
/// packet" by the caller.
pub fn parse_frame(
    raw: &[u8],
    integrity_key: Option<&[u8]>,
    confidentiality_key: Option<&[u8; 16]>,
) -> Result<Parsed, ParseError> {
    if raw.len() < 16 {
        return Err(ParseError::TooShort);
    }
    if raw[0..4] != RMCP_HEADER {
        return Err(ParseError::BadHeader);
    }
    if raw[4] != AUTH_TYPE_RMCP_PLUS {
        return Err(ParseError::BadAuthType);
    }

    let type_byte = raw[5];
    let authenticated = type_byte & INTEGRITY_BIT != 0;
    let encrypted = type_byte & CONFIDENTIALITY_BIT != 0;
    let payload_type =
        PayloadType::from_code(type_byte & 0x3F).ok_or(ParseError::BadPayloadType)?;

    let session_id = u32::from_le_bytes(raw[6..10].try_into().unwrap());
    let sequence = u32::from_le_bytes(raw[10..14].try_into().unwrap());
    let body_len = u16::from_le_bytes(raw[14..16].try_into().unwrap()) as usize;

    let body_start = 16;
    if raw.len() < body_start + body_len {
        return Err(ParseError::TooShort);
    }
    let body = &raw[body_start..body_start + body_len];
    let trailer = &raw[body_start + body_len..];

    if authenticated {
        let ikey = integrity_key.ok_or(ParseError::MissingIntegrityKey)?;
        verify_integrity_trailer(&raw[..body_start + body_len], trailer, ikey)?;
    }

    let payload = if encrypted {
        let key = confidentiality_key.ok_or(ParseError::MissingConfidentialityKey)?;
        decrypt_payload(key, body)?
    } else {
        body.to_vec()
    };

    Ok(Parsed {
        payload_type,
        authenticated,
        encrypted,
        session_id,
        sequence,
        payload,
    })
}

fn verify_integrity_trailer(
    authenticated_prefix: &[u8],
    trailer: &[u8],
    integrity_key: &[u8],
) -> Result<(), ParseError> {
    if trailer.len() < 14 {
        return Err(ParseError::BadTrailer);
    }
    let mac_start = trailer.len() - 12;
    let received_mac = &trailer[mac_start..];
    let pad_and_reserved = &trailer[..mac_start];

    if pad_and_reserved[pad_and_reserved.len() - 1] != 0x07 {
        return Err(ParseError::BadTrailer);
    }

    let mut mac = HmacSha1::new_from_slice(integrity_key).map_err(|_| ParseError::BadHmac)?;
    mac.update(authenticated_prefix[4..].as_ref());
    mac.update(pad_and_reserved);
    let expected = mac.finalize().into_bytes();

    if &expected[..12] != received_mac {
        return Err(ParseError::BadHmac);
    }

    Ok(())
}

fn decrypt_payload(key: &[u8; 16], body: &[u8]) -> Result<Vec<u8>, ParseError> {
    if body.len() < 16 || (body.len() - 16) % 16 != 0 {
        return Err(ParseError::BadPadding);
    }
    let iv: [u8; 16] = body[..16].try_into().unwrap();
    let mut ciphertext = body[16..].to_vec();

    let plaintext = Aes128CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut ciphertext)
        .map_err(|_| ParseError::BadPadding)?;

    let pt_len = plaintext.len();
    if pt_len == 0 {
        return Err(ParseError::BadPadding);
    }
    let pad_len = plaintext[pt_len - 1] as usize;
    if pad_len + 1 > pt_len {
        return Err(ParseError::BadPadding);
    }

    Ok(plaintext[..pt_len - pad_len - 1].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IKEY: [u8; 20] = [0x11; 20];
    const CKEY: [u8; 16] = [0x22; 16];
    const IV: [u8; 16] = [0x33; 16];

    #[test]
    fn round_trip_plain() {
        let params = BuildParams {
            payload_type: PayloadType::Ipmi,
            session_id: 0xDEADBEEF,
            sequence: 1,
            payload: &[1, 2, 3],
            confidentiality_key: None,
            iv: None,
            integrity_key: None,
        };
        let built = build_frame(&params);
        let parsed = parse_frame(&built, None, None).unwrap();
        assert_eq!(parsed.payload, vec![1, 2, 3]);
        assert!(!parsed.authenticated);
        assert!(!parsed.encrypted);
    }

    #[test]
    fn round_trip_integrity_only() {
        let params = BuildParams {
            payload_type: PayloadType::Ipmi,
            session_id: 1,
            sequence: 2,
            payload: &[9; 17],
            confidentiality_key: None,
            iv: None,
            integrity_key: Some(&IKEY),
        };
        let built = build_frame(&params);
        let parsed = parse_frame(&built, Some(&IKEY), None).unwrap();
        assert_eq!(parsed.payload, vec![9; 17]);
        assert!(parsed.authenticated);
    }

    #[test]
    fn round_trip_encrypted_and_authenticated() {
        for len in [0usize, 1, 14, 15, 16, 17, 31, 32, 250] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let params = BuildParams {
                payload_type: PayloadType::Sol,
                session_id: 42,
                sequence: 7,
                payload: &payload,
                confidentiality_key: Some(&CKEY),
                iv: Some(IV),
                integrity_key: Some(&IKEY),
            };
            let built = build_frame(&params);
            let parsed = parse_frame(&built, Some(&IKEY), Some(&CKEY)).unwrap();
            assert_eq!(parsed.payload, payload, "len={len}");
        }
    }

    #[test]
    fn tampered_hmac_rejected() {
        let params = BuildParams {
            payload_type: PayloadType::Ipmi,
            session_id: 1,
            sequence: 1,
            payload: &[1, 2, 3],
            confidentiality_key: None,
            iv: None,
            integrity_key: Some(&IKEY),
        };
        let mut built = build_frame(&params);
        let last = built.len() - 1;
        built[last] ^= 0xFF;
        assert_eq!(
            parse_frame(&built, Some(&IKEY), None),
            Err(ParseError::BadHmac)
        );
    }

    #[test]
    fn missing_mutual_auth_bit_is_reported() {
        let params = BuildParams {
            payload_type: PayloadType::Ipmi,
            session_id: 1,
            sequence: 1,
            payload: &[1, 2, 3],
            confidentiality_key: None,
            iv: None,
            integrity_key: None,
        };
        let built = build_frame(&params);
        assert_eq!(
            parse_frame(&built, Some(&IKEY), None),
            Ok(Parsed {
                payload_type: PayloadType::Ipmi,
                authenticated: false,
                encrypted: false,
                session_id: 1,
                sequence: 1,
                payload: vec![1, 2, 3],
            })
        );
    }
}
