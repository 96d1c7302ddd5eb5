//! In-process certificate authority for the VPN daemon's capath.
//!
//! A fresh ECDSA P-384 root is generated on every boot; one subordinate CA
//! certificate is minted per registered user key, carrying the user name as
//! common name and the key's SPKI digest as organizational unit. Files land
//! in the capath under `<dnhash>.<index>` so the daemon can locate the
//! issuer of a presented chain by hash. Revocation is key removal: the
//! subordinate is deleted when the key disappears from the backend.

pub mod dnhash;
mod server;
mod verify;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    PublicKeyData, SerialNumber, SignatureAlgorithm, PKCS_ECDSA_P384_SHA384, PKCS_RSA_SHA256,
};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::macros::datetime;
use time::OffsetDateTime;

use self::dnhash::{dn_hash, OID_COMMON_NAME, OID_ORG_UNIT};
pub use self::server::{make_server_certificate, ServerCertificate};
pub use self::verify::check_certificate;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("not a PEM public key: {0}")]
    PublicKey(String),

    #[error("unknown key alias {0}")]
    UnknownAlias(String),

    #[error("not a PEM certificate: {0}")]
    BadCertificate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaError>;

/// Expiry of the root certificate.
const ROOT_NOT_AFTER: OffsetDateTime = datetime!(9999-12-31 23:59:59 UTC);

/// Expiry of subordinate certificates.
const SUBORDINATE_NOT_AFTER: OffsetDateTime = datetime!(2200-12-31 23:59:59 UTC);

/// Common name of the throwaway root.
const ROOT_COMMON_NAME: &str = "fakeca";

/// Parse a PEM-encoded PKIX public key into an RSA key.
pub fn parse_rsa_public_key(content: &[u8]) -> Result<RsaPublicKey> {
    let text =
        std::str::from_utf8(content).map_err(|e| CaError::PublicKey(e.to_string()))?;
    RsaPublicKey::from_public_key_pem(text).map_err(|e| CaError::PublicKey(e.to_string()))
}

/// A registered user key, as rcgen sees it: the PKCS#1 body of the SPKI.
pub(crate) struct RegisteredKey {
    pub(crate) pkcs1_der: Vec<u8>,
}

impl PublicKeyData for RegisteredKey {
    fn der_bytes(&self) -> &[u8] {
        &self.pkcs1_der
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &PKCS_RSA_SHA256
    }
}

/// Location of one certificate file within the capath.
#[derive(Debug, Clone)]
struct Slot {
    dnhash: String,
    index: usize,
}

#[derive(Default)]
struct CapathIndex {
    /// Per dnhash, the alias stored at each collision index. `None` marks a
    /// certificate with no alias (the root).
    by_hash: HashMap<String, Vec<Option<String>>>,
    by_alias: HashMap<String, Slot>,
}

/// The in-process CA: root keypair plus the hash-indexed capath directory.
pub struct CertificateStore {
    path: PathBuf,
    issuer: Issuer<'static, KeyPair>,
    root_pem: String,
    counter: AtomicU64,
    index: Mutex<CapathIndex>,
}

impl CertificateStore {
    /// Generate a fresh root and initialize the capath directory.
    pub fn create(path: &Path) -> Result<Self> {
        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)?;

        let root_cert = root_params().self_signed(&root_key)?;
        let root_pem = root_cert.pem();

        std::fs::create_dir_all(path)?;

        let store = CertificateStore {
            path: path.to_path_buf(),
            issuer: Issuer::new(root_params(), root_key),
            root_pem,
            counter: AtomicU64::new(1),
            index: Mutex::new(CapathIndex::default()),
        };

        let root_hash = dn_hash(&[(OID_COMMON_NAME, ROOT_COMMON_NAME)]);
        store.store_file(&root_hash, None, store.root_pem.clone())?;

        Ok(store)
    }

    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    pub fn capath(&self) -> &Path {
        &self.path
    }

    /// Mint a subordinate CA certificate for one of `user`'s keys and
    /// persist it under the capath. Returns the cert-hash the daemon will
    /// present as the organizational unit of the client's chain.
    pub fn add(&self, user: &str, alias: &str, key: &RsaPublicKey) -> Result<String> {
        tracing::info!(user, alias, "adding key");

        let spki = key
            .to_public_key_der()
            .map_err(|e| CaError::PublicKey(e.to_string()))?;
        let cert_hash = hex_digest(spki.as_bytes());

        let pkcs1 = key
            .to_pkcs1_der()
            .map_err(|e| CaError::PublicKey(e.to_string()))?;
        let subject_key = RegisteredKey {
            pkcs1_der: pkcs1.as_bytes().to_vec(),
        };

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, user);
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, cert_hash.clone());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = SUBORDINATE_NOT_AFTER;
        params.serial_number = Some(SerialNumber::from(
            self.counter.fetch_add(1, Ordering::Relaxed) + 1,
        ));

        let cert = params.signed_by(&subject_key, &self.issuer)?;

        let dnhash = dn_hash(&[(OID_COMMON_NAME, user), (OID_ORG_UNIT, &cert_hash)]);
        self.store_file(&dnhash, Some(alias), cert.pem())?;

        Ok(cert_hash)
    }

    /// Drop the subordinate certificate registered under `alias`. The last
    /// file in the collision list moves into the freed slot so indexes stay
    /// dense.
    pub fn remove(&self, alias: &str) -> Result<()> {
        let mut index = self.index.lock();

        let slot = index
            .by_alias
            .remove(alias)
            .ok_or_else(|| CaError::UnknownAlias(alias.to_string()))?;

        let entries = index
            .by_hash
            .get_mut(&slot.dnhash)
            .ok_or_else(|| CaError::UnknownAlias(alias.to_string()))?;
        let last = entries.len() - 1;

        // The index is updated before the filesystem result is known; a
        // failed rename or unlink leaves a stray file behind, never a
        // dangling index entry.
        let result = if slot.index != last {
            let moved = entries[last].clone();
            entries[slot.index] = moved.clone();
            if let Some(moved_alias) = moved {
                if let Some(moved_slot) = index.by_alias.get_mut(&moved_alias) {
                    moved_slot.index = slot.index;
                }
            }
            std::fs::rename(
                self.file_path(&slot.dnhash, last),
                self.file_path(&slot.dnhash, slot.index),
            )
        } else {
            std::fs::remove_file(self.file_path(&slot.dnhash, slot.index))
        };

        let entries = index
            .by_hash
            .get_mut(&slot.dnhash)
            .ok_or_else(|| CaError::UnknownAlias(alias.to_string()))?;
        entries.pop();
        if entries.is_empty() {
            index.by_hash.remove(&slot.dnhash);
        }

        result.map_err(CaError::Io)
    }

    fn store_file(&self, dnhash: &str, alias: Option<&str>, pem: String) -> Result<()> {
        let mut index = self.index.lock();

        let entries = index.by_hash.entry(dnhash.to_string()).or_default();
        let slot = entries.len();
        entries.push(alias.map(str::to_string));

        if let Some(alias) = alias {
            index.by_alias.insert(
                alias.to_string(),
                Slot {
                    dnhash: dnhash.to_string(),
                    index: slot,
                },
            );
        }

        std::fs::write(self.file_path(dnhash, slot), pem)?;
        Ok(())
    }

    fn file_path(&self, dnhash: &str, index: usize) -> PathBuf {
        self.path.join(format!("{dnhash}.{index}"))
    }
}

/// Parameters of the throwaway root certificate (built once for the
/// self-signed cert, once for the issuer).
fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, ROOT_COMMON_NAME);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = ROOT_NOT_AFTER;
    params.serial_number = Some(SerialNumber::from(1u64));
    params
}

fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
