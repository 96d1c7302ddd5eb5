//! Capath filename hashing.
//!
//! The verifying daemon locates a CA certificate by hashing its subject
//! distinguished name: each RDN is DER-encoded as a single-attribute SET
//! with the value lower-cased as a UTF8String, the encodings are
//! concatenated, and the filename stem is the low 32 bits of the SHA-1
//! digest, little-endian, as 8 hex digits.

use sha1::{Digest, Sha1};

/// id-at-commonName (2.5.4.3)
pub const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
/// id-at-organizationalUnitName (2.5.4.11)
pub const OID_ORG_UNIT: &[u64] = &[2, 5, 4, 11];

const TAG_UTF8_STRING: u8 = 0x0c;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_OID: u8 = 0x06;

/// Hash an ordered list of (attribute OID, value) pairs into the 8-hex-digit
/// capath filename stem.
pub fn dn_hash(attrs: &[(&[u64], &str)]) -> String {
    let mut encoded = Vec::new();

    for (oid, value) in attrs {
        let mut attribute = encode_oid(oid);
        attribute.extend(encode_string(&value.to_lowercase()));

        let sequence = wrap(TAG_SEQUENCE, &attribute);
        encoded.extend(wrap(TAG_SET, &sequence));
    }

    let digest = Sha1::digest(&encoded);
    let low = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);

    format!("{low:08x}")
}

fn encode_string(value: &str) -> Vec<u8> {
    wrap(TAG_UTF8_STRING, value.as_bytes())
}

fn encode_oid(arcs: &[u64]) -> Vec<u8> {
    let mut body = vec![(arcs[0] * 40 + arcs[1]) as u8];

    for &arc in &arcs[2..] {
        body.extend(encode_base128(arc));
    }

    wrap(TAG_OID, &body)
}

fn encode_base128(mut value: u64) -> Vec<u8> {
    let mut bytes = vec![(value & 0x7f) as u8];
    value >>= 7;

    while value > 0 {
        bytes.push(((value & 0x7f) | 0x80) as u8);
        value >>= 7;
    }

    bytes.reverse();
    bytes
}

fn wrap(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(encode_length(body.len()));
    out.extend_from_slice(body);
    out
}

fn encode_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }

    let bytes: Vec<u8> = len
        .to_be_bytes()
        .into_iter()
        .skip_while(|b| *b == 0)
        .collect();

    let mut out = vec![0x80 | bytes.len() as u8];
    out.extend(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_encoding_matches_known_bytes() {
        assert_eq!(encode_oid(OID_COMMON_NAME), vec![0x06, 0x03, 0x55, 0x04, 0x03]);
        assert_eq!(encode_oid(OID_ORG_UNIT), vec![0x06, 0x03, 0x55, 0x04, 0x0b]);
    }

    #[test]
    fn short_and_long_lengths() {
        assert_eq!(encode_length(5), vec![5]);
        assert_eq!(encode_length(127), vec![127]);
        assert_eq!(encode_length(128), vec![0x81, 128]);
        assert_eq!(encode_length(300), vec![0x82, 0x01, 0x2c]);
    }

    #[test]
    fn hash_is_eight_hex_digits() {
        let hash = dn_hash(&[(OID_COMMON_NAME, "fakeca")]);
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_is_case_insensitive() {
        let lower = dn_hash(&[(OID_COMMON_NAME, "alice"), (OID_ORG_UNIT, "abc123")]);
        let upper = dn_hash(&[(OID_COMMON_NAME, "Alice"), (OID_ORG_UNIT, "ABC123")]);
        assert_eq!(lower, upper);
    }

    #[test]
    fn different_subjects_hash_differently() {
        let alice = dn_hash(&[(OID_COMMON_NAME, "alice")]);
        let bob = dn_hash(&[(OID_COMMON_NAME, "bob")]);
        assert_ne!(alice, bob);
    }

    #[test]
    fn attribute_order_matters() {
        let forward = dn_hash(&[(OID_COMMON_NAME, "a"), (OID_ORG_UNIT, "b")]);
        let reverse = dn_hash(&[(OID_ORG_UNIT, "b"), (OID_COMMON_NAME, "a")]);
        assert_ne!(forward, reverse);
    }

    #[test]
    fn long_values_use_long_form_lengths() {
        let value = "x".repeat(200);
        let encoded = encode_string(&value);
        assert_eq!(encoded[0], TAG_UTF8_STRING);
        assert_eq!(encoded[1], 0x81);
        assert_eq!(encoded[2], 200);
    }
}
