//! Server certificate bundle for the VPN daemon's TLS listener.
//!
//! Generated once and persisted through the backend; the signing CA is
//! independent of the client capath CA and its key is discarded after the
//! bundle is built.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P384_SHA384,
};
use time::OffsetDateTime;

use crate::{Result, ROOT_NOT_AFTER};

/// PEM bundle handed to the daemon configuration and the backend.
pub struct ServerCertificate {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Build a fresh CA and a server certificate for `name` signed by it.
pub fn make_server_certificate(name: &str) -> Result<ServerCertificate> {
    let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)?;

    let ca_cert = signing_ca_params(name).self_signed(&ca_key)?;
    let ca_pem = ca_cert.pem();
    let issuer = Issuer::new(signing_ca_params(name), ca_key);

    let server_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, name);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = ROOT_NOT_AFTER;
    params.serial_number = Some(SerialNumber::from(1u64));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyAgreement,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.signed_by(&server_key, &issuer)?;

    Ok(ServerCertificate {
        ca_pem,
        cert_pem: cert.pem(),
        key_pem: server_key.serialize_pem(),
    })
}

fn signing_ca_params(name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, format!("CA for {name}"));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = ROOT_NOT_AFTER;
    params.serial_number = Some(SerialNumber::from(1u64));
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_contains_three_pem_blocks() {
        let bundle = make_server_certificate("vpn.example.com").unwrap();

        assert!(bundle.ca_pem.contains("BEGIN CERTIFICATE"));
        assert!(bundle.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(bundle.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn server_certificate_names_the_vpn() {
        let bundle = make_server_certificate("vpn.example.com").unwrap();

        let (_, parsed) =
            x509_parser::pem::parse_x509_pem(bundle.cert_pem.as_bytes()).unwrap();
        let cert = parsed.parse_x509().unwrap();
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(cn, "vpn.example.com");
        assert!(!cert.is_ca());

        let issuer_cn = cert
            .issuer()
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(issuer_cn, "CA for vpn.example.com");
    }
}
