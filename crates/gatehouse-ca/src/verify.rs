//! Peer certificate check for the daemon's tls-verify hook.
//!
//! The client's leaf certificate is issued by the subordinate this process
//! minted for the user's key, so the leaf's issuer [CN, OU] hashes to a
//! capath filename and the leaf must carry the same public key as the
//! subordinate found there.

use std::path::Path;

use x509_parser::certificate::X509Certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::x509::X509Name;

use crate::dnhash::{dn_hash, OID_COMMON_NAME, OID_ORG_UNIT};
use crate::{CaError, Result};

/// Check whether the certificate at `peer_path` chains to a subordinate in
/// `capath`. Returns false on subject mismatch or when the collision list
/// is exhausted.
pub fn check_certificate(capath: &Path, peer_path: &Path) -> Result<bool> {
    let peer_bytes = std::fs::read(peer_path)?;
    let peer_pem = parse_pem(&peer_bytes)?;
    let peer = parse_cert(&peer_pem)?;

    let issuer_cn = name_attr(peer.issuer(), NameAttr::CommonName)
        .ok_or_else(|| CaError::BadCertificate("issuer has no common name".to_string()))?;
    let issuer_ou = name_attr(peer.issuer(), NameAttr::OrganizationalUnit)
        .ok_or_else(|| CaError::BadCertificate("issuer has no organizational unit".to_string()))?;
    let subject_cn = name_attr(peer.subject(), NameAttr::CommonName)
        .ok_or_else(|| CaError::BadCertificate("subject has no common name".to_string()))?;

    let hash = dn_hash(&[(OID_COMMON_NAME, &issuer_cn), (OID_ORG_UNIT, &issuer_ou)]);

    for index in 0.. {
        let path = capath.join(format!("{hash}.{index}"));
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            // The collision list is dense; the first missing index is the end.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CaError::Io(e)),
        };

        let ca_pem = parse_pem(&bytes)?;
        let ca_cert = parse_cert(&ca_pem)?;

        let ca_cn = name_attr(ca_cert.subject(), NameAttr::CommonName);
        let ca_ou = name_attr(ca_cert.subject(), NameAttr::OrganizationalUnit);

        if ca_cn.as_deref() == Some(subject_cn.as_str())
            && ca_cn.as_deref() == Some(issuer_cn.as_str())
            && ca_ou.as_deref() == Some(issuer_ou.as_str())
        {
            return Ok(peer.public_key().raw == ca_cert.public_key().raw);
        }
    }

    Ok(false)
}

enum NameAttr {
    CommonName,
    OrganizationalUnit,
}

fn name_attr(name: &X509Name<'_>, attr: NameAttr) -> Option<String> {
    let mut iter = match attr {
        NameAttr::CommonName => name.iter_common_name(),
        NameAttr::OrganizationalUnit => name.iter_organizational_unit(),
    };
    iter.next()
        .and_then(|value| value.as_str().ok())
        .map(str::to_string)
}

fn parse_pem(bytes: &[u8]) -> Result<x509_parser::pem::Pem> {
    let (_, pem) = parse_x509_pem(bytes)
        .map_err(|e| CaError::BadCertificate(e.to_string()))?;
    if pem.label != "CERTIFICATE" {
        return Err(CaError::BadCertificate(format!(
            "unexpected PEM label {}",
            pem.label
        )));
    }
    Ok(pem)
}

fn parse_cert<'a>(pem: &'a x509_parser::pem::Pem) -> Result<X509Certificate<'a>> {
    pem.parse_x509()
        .map_err(|e| CaError::BadCertificate(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertificateStore;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("gatehouse-verify-{name}-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_peer_certificate_is_an_error() {
        let dir = temp_dir("missing");
        let err = check_certificate(&dir, &dir.join("nope.pem"));
        assert!(err.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn garbage_peer_certificate_is_an_error() {
        let dir = temp_dir("garbage");
        let peer = dir.join("peer.pem");
        std::fs::write(&peer, "not a certificate").unwrap();
        assert!(check_certificate(&dir, &peer).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Build a leaf the way a client would: subject and issuer name the
    /// subordinate, signed by the user's own RSA key, carrying `carried_key`.
    fn self_issued_leaf(
        user: &str,
        cert_hash: &str,
        signing_key: &rsa::RsaPrivateKey,
        carried_key: &rsa::RsaPublicKey,
    ) -> String {
        use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair};
        use rsa::pkcs1::EncodeRsaPublicKey;
        use rsa::pkcs8::EncodePrivateKey;

        let signer_pem = signing_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let signer = KeyPair::from_pem(&signer_pem).unwrap();

        let mut issuer_params = CertificateParams::default();
        issuer_params.distinguished_name = DistinguishedName::new();
        issuer_params
            .distinguished_name
            .push(DnType::CommonName, user);
        issuer_params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, cert_hash);
        let issuer = Issuer::new(issuer_params, signer);

        let mut leaf_params = CertificateParams::default();
        leaf_params.distinguished_name = DistinguishedName::new();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, user);

        let leaf_key = crate::RegisteredKey {
            pkcs1_der: carried_key.to_pkcs1_der().unwrap().as_bytes().to_vec(),
        };

        leaf_params.signed_by(&leaf_key, &issuer).unwrap().pem()
    }

    #[test]
    fn minted_subordinate_accepts_its_own_leaf() {
        let capath = temp_dir("accept");
        let store = CertificateStore::create(&capath).unwrap();

        let mut rng = rand::thread_rng();
        let user_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = user_key.to_public_key();

        let cert_hash = store.add("alice", "KEYID1", &public).unwrap();

        let peer = capath.join("peer.pem");
        let leaf = self_issued_leaf("alice", &cert_hash, &user_key, &public);
        std::fs::write(&peer, leaf).unwrap();

        assert!(check_certificate(&capath, &peer).unwrap());

        let _ = std::fs::remove_dir_all(&capath);
    }

    #[test]
    fn leaf_with_a_different_key_is_rejected() {
        let capath = temp_dir("wrong-key");
        let store = CertificateStore::create(&capath).unwrap();

        let mut rng = rand::thread_rng();
        let user_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let other_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let cert_hash = store
            .add("alice", "KEYID1", &user_key.to_public_key())
            .unwrap();

        let peer = capath.join("peer.pem");
        let leaf = self_issued_leaf(
            "alice",
            &cert_hash,
            &user_key,
            &other_key.to_public_key(),
        );
        std::fs::write(&peer, leaf).unwrap();

        assert!(!check_certificate(&capath, &peer).unwrap());

        let _ = std::fs::remove_dir_all(&capath);
    }

    #[test]
    fn unknown_issuer_hash_is_rejected() {
        let capath = temp_dir("unknown-issuer");
        let _store = CertificateStore::create(&capath).unwrap();

        let mut rng = rand::thread_rng();
        let user_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = user_key.to_public_key();

        // Issuer hash computed over a subject that was never minted: the
        // scan finds no file at index 0 and rejects.
        let peer = capath.join("peer.pem");
        let leaf = self_issued_leaf("nobody", "feedface", &user_key, &public);
        std::fs::write(&peer, leaf).unwrap();

        assert!(!check_certificate(&capath, &peer).unwrap());

        let _ = std::fs::remove_dir_all(&capath);
    }
}
