//! The four-message RAKP (Remote Authenticated Key-exchange Protocol)
//! handshake used to establish an RMCP+ (IPMI 2.0) session, and the
//! HMAC-SHA1 key derivation that follows it.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Algorithm-proposal octets for cipher suite 3: HMAC-SHA1 authentication,
/// HMAC-SHA1-96 integrity, AES-CBC-128 confidentiality. This is the only
/// cipher suite this crate proposes or accepts.
const AUTH_ALGO_SHA1: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00];
const INTEGRITY_ALGO_SHA1_96: [u8; 8] = [0x01, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00];
const CONFIDENTIALITY_ALGO_AES_CBC_128: [u8; 8] = [0x02, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00];

/// Build the RMCP+ Open Session Request payload.
pub fn build_open_session_request(tag: u8, max_privilege: u8, local_session_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + 24);
    out.push(tag);
    out.push(max_privilege);
    out.push(0);
    out.push(0);
    out.extend_from_slice(&local_session_id.to_le_bytes());
    out.extend_from_slice(&AUTH_ALGO_SHA1);
    out.extend_from_slice(&INTEGRITY_ALGO_SHA1_96);
    out.extend_from_slice(&CONFIDENTIALITY_ALGO_AES_CBC_128);
    out
}

/// A parsed Open Session Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSessionResponse {
    pub tag: u8,
    pub status_code: u8,
    pub max_privilege: u8,
    pub local_session_id: u32,
    pub remote_session_id: u32,
}

/// Errors parsing the Open Session Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenSessionError {
    TooShort,
}

pub fn parse_open_session_response(raw: &[u8]) -> Result<OpenSessionResponse, OpenSessionError> {
    if raw.len() < 12 {
        return Err(OpenSessionError::TooShort);
    }

    Ok(OpenSessionResponse {
        tag: raw[0],
        status_code: raw[1],
        max_privilege: raw[2],
        local_session_id: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        remote_session_id: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
    })
}

/// Build the RAKP Message 1 payload.
pub fn build_rakp1(
    tag: u8,
    pending_session_id: u32,
    random_local: [u8; 16],
    privilege: u8,
    userid: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(28 + userid.len());
    out.push(tag);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&pending_session_id.to_le_bytes());
    out.extend_from_slice(&random_local);
    out.push(privilege);
    out.push(0);
    out.push(0);
    out.push(userid.len() as u8);
    out.extend_from_slice(userid);
    out
}

/// A parsed RAKP Message 2 payload (before HMAC verification).
#[derive(Debug, Clone, PartialEq)]
pub struct Rakp2 {
    pub tag: u8,
    pub status_code: u8,
    pub local_session_id: u32,
    pub random_remote: [u8; 16],
    pub remote_guid: [u8; 16],
    pub key_exchange_auth_code: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rakp2Error {
    TooShort,
}

pub fn parse_rakp2(raw: &[u8]) -> Result<Rakp2, Rakp2Error> {
    if raw.len() < 40 {
        return Err(Rakp2Error::TooShort);
    }

    Ok(Rakp2 {
        tag: raw[0],
        status_code: raw[1],
        local_session_id: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        random_remote: raw[8..24].try_into().unwrap(),
        remote_guid: raw[24..40].try_into().unwrap(),
        key_exchange_auth_code: raw[40..].to_vec(),
    })
}

/// Compute the RAKP2 key-exchange auth code the BMC is expected to have
/// sent: `HMAC-SHA1(password, local_sid || pending_sid || rand_local ||
/// rand_remote || remote_guid || priv || userlen || userid)`.
#[allow(clippy::too_many_arguments)]
pub fn rakp2_expected_auth_code(
    password: &[u8],
    local_session_id: u32,
    pending_session_id: u32,
    random_local: &[u8; 16],
    random_remote: &[u8; 16],
    remote_guid: &[u8; 16],
    privilege: u8,
    userid: &[u8],
) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(password).expect("hmac key");
    mac.update(&local_session_id.to_le_bytes());
    mac.update(&pending_session_id.to_le_bytes());
    mac.update(random_local);
    mac.update(random_remote);
    mac.update(remote_guid);
    mac.update(&[privilege, userid.len() as u8]);
    mac.update(userid);
    mac.finalize().into_bytes().to_vec()
}

/// Derived key material produced once RAKP2's auth code has been verified.
pub struct DerivedKeys {
    pub sik: [u8; 20],
    pub k1: [u8; 20],
    pub k2: [u8; 20],
}

impl DerivedKeys {
    /// K2's first 16 bytes, used as the AES-CBC-128 confidentiality key.
    pub fn aes_key(&self) -> [u8; 16] {
        self.k2[..16].try_into().unwrap()
    }
}

/// Derive `SIK`, `K1` and `K2` per IPMI 2.0 RAKP cipher suite 3:
/// `SIK = HMAC-SHA1(Kg, rand_local || rand_remote || priv || userlen ||
/// userid)`; `K1 = HMAC(SIK, 0x01 * 20)`; `K2 = HMAC(SIK, 0x02 * 20)`.
pub fn derive_keys(
    kg: &[u8],
    random_local: &[u8; 16],
    random_remote: &[u8; 16],
    privilege: u8,
    userid: &[u8],
) -> DerivedKeys {
    let mut sik_mac = HmacSha1::new_from_slice(kg).expect("hmac key");
    sik_mac.update(random_local);
    sik_mac.update(random_remote);
    sik_mac.update(&[privilege, userid.len() as u8]);
    sik_mac.update(userid);
    let sik: [u8; 20] = sik_mac.finalize().into_bytes().into();

    let mut k1_mac = HmacSha1::new_from_slice(&sik).expect("hmac key");
    k1_mac.update(&[0x01; 20]);
    let k1: [u8; 20] = k1_mac.finalize().into_bytes().into();

    let mut k2_mac = HmacSha1::new_from_slice(&sik).expect("hmac key");
    k2_mac.update(&[0x02; 20]);
    let k2: [u8; 20] = k2_mac.finalize().into_bytes().into();

    DerivedKeys { sik, k1, k2 }
}

/// Build the RAKP Message 3 payload, including its `HMAC-SHA1(password,
/// rand_remote || local_sid || priv || userlen || userid)` auth code.
pub fn build_rakp3(
    tag: u8,
    pending_session_id: u32,
    password: &[u8],
    random_remote: &[u8; 16],
    local_session_id: u32,
    privilege: u8,
    userid: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 20);
    out.push(tag);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&pending_session_id.to_le_bytes());

    let mut mac = HmacSha1::new_from_slice(password).expect("hmac key");
    mac.update(random_remote);
    mac.update(&local_session_id.to_le_bytes());
    mac.update(&[privilege, userid.len() as u8]);
    mac.update(userid);
    out.extend_from_slice(&mac.finalize().into_bytes());

    out
}

/// A parsed RAKP Message 4 payload (before HMAC verification).
#[derive(Debug, Clone, PartialEq)]
pub struct Rakp4 {
    pub tag: u8,
    pub status_code: u8,
    pub local_session_id: u32,
    pub integrity_check_value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rakp4Error {
    TooShort,
}

pub fn parse_rakp4(raw: &[u8]) -> Result<Rakp4, Rakp4Error> {
    if raw.len() < 8 {
        return Err(Rakp4Error::TooShort);
    }

    Ok(Rakp4 {
        tag: raw[0],
        status_code: raw[1],
        local_session_id: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        integrity_check_value: raw[8..].to_vec(),
    })
}

/// Compute the expected RAKP4 integrity check value:
/// `HMAC-SHA1(SIK, rand_local || pending_sid || remote_guid)[..12]`.
pub fn rakp4_expected_icv(
    sik: &[u8; 20],
    random_local: &[u8; 16],
    pending_session_id: u32,
    remote_guid: &[u8; 16],
) -> [u8; 12] {
    let mut mac = HmacSha1::new_from_slice(sik).expect("hmac key");
    mac.update(random_local);
    mac.update(&pending_session_id.to_le_bytes());
    mac.update(remote_guid);
    let digest = mac.finalize().into_bytes();
    digest[..12].try_into().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_session_round_trip() {
        let built = build_open_session_request(5, 4, 0x12345678);
        assert_eq!(built[0], 5);
        assert_eq!(built[1], 4);
        assert_eq!(&built[4..8], &0x12345678u32.to_le_bytes());
    }

    #[test]
    fn rakp1_layout() {
        let random = [0x42u8; 16];
        let built = build_rakp1(3, 0xAABBCCDD, random, 4, b"admin");
        assert_eq!(built[0], 3);
        assert_eq!(&built[1..4], &[0, 0, 0]);
        assert_eq!(&built[4..8], &0xAABBCCDDu32.to_le_bytes());
        assert_eq!(&built[8..24], &random);
        assert_eq!(built[24], 4);
        assert_eq!(built[27], 5);
        assert_eq!(&built[28..], b"admin");
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let a = derive_keys(b"pass", &[1; 16], &[2; 16], 4, b"admin");
        let b = derive_keys(b"pass", &[1; 16], &[2; 16], 4, b"admin");
        assert_eq!(a.sik, b.sik);
        assert_eq!(a.k1, b.k1);
        assert_eq!(a.k2, b.k2);
        assert_ne!(a.k1, a.k2);
    }

    #[test]
    fn rakp2_auth_code_matches_hand_rolled_hmac() {
        let expected = rakp2_expected_auth_code(
            b"secret", 1, 2, &[3; 16], &[4; 16], &[5; 16], 4, b"admin",
        );
        let mut mac = HmacSha1::new_from_slice(b"secret").unwrap();
        mac.update(&1u32.to_le_bytes());
        mac.update(&2u32.to_le_bytes());
        mac.update(&[3; 16]);
        mac.update(&[4; 16]);
        mac.update(&[5; 16]);
        mac.update(&[4, 5]);
        mac.update(b"admin");
        assert_eq!(expected, mac.finalize().into_bytes().to_vec());
    }
}
