//! Certificate authority and key material for hosted control planes
//!
//! Everything here is pure: keys are generated, certificates are signed and
//! the results are handed back PEM-encoded, ready to be stored in secrets.
//! Nothing is cached; the resource ensurers call into this module at most
//! once per secret.

use crate::{CoreError, Result};
use ipnetwork::Ipv4Network;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::net::{IpAddr, Ipv4Addr};

/// Validity period of cluster root CAs
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period of leaf certificates
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Default size of service account signing keys
pub const SERVICE_ACCOUNT_KEY_BITS: usize = 4096;

/// A PEM-encoded certificate and its private key
#[derive(Clone, Debug)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A CA able to sign leaf certificates
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Load a CA from stored PEM material
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| CoreError::Crypto(format!("failed to parse ca key: {}", e)))?;
        ::pem::parse(cert_pem.as_bytes())
            .map_err(|e| CoreError::Crypto(format!("failed to parse ca cert: {}", e)))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
        let key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| CoreError::Crypto(format!("failed to load ca key: {}", e)))?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key)
            .map_err(|e| CoreError::Crypto(format!("failed to load ca cert: {}", e)))
    }
}

impl TryFrom<&CertKeyPair> for CertificateAuthority {
    type Error = CoreError;

    fn try_from(pair: &CertKeyPair) -> Result<Self> {
        Self::from_pem(&pair.cert_pem, &pair.key_pem)
    }
}

fn compute_validity(years: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    (now, now + time::Duration::days(years * 365))
}

fn distinguished_name(entries: &[(DnType, &str)]) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    for (ty, value) in entries {
        if !value.is_empty() {
            dn.push(ty.clone(), DnValue::Utf8String(value.to_string()));
        }
    }
    dn
}

fn subject_alt_names(dns_names: &[String], ips: &[IpAddr]) -> Result<Vec<SanType>> {
    let mut sans = Vec::with_capacity(dns_names.len() + ips.len());
    for name in dns_names {
        let name = Ia5String::try_from(name.clone())
            .map_err(|e| CoreError::Crypto(format!("invalid DNS name {:?}: {}", name, e)))?;
        sans.push(SanType::DnsName(name));
    }
    sans.extend(ips.iter().copied().map(SanType::IpAddress));
    Ok(sans)
}

/// Create a self-signed root CA
pub fn new_ca(common_name: &str) -> Result<CertKeyPair> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&[(DnType::CommonName, common_name)]);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn new_leaf(
    ca: &CertificateAuthority,
    dn: DistinguishedName,
    usage: ExtendedKeyUsagePurpose,
    sans: Vec<SanType>,
) -> Result<CertKeyPair> {
    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![usage];
    params.subject_alt_names = sans;
    let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;

    let key = KeyPair::generate()?;
    let issuer = ca.issuer()?;
    let cert = params.signed_by(&key, &issuer)?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Create a TLS server certificate signed by `ca`
pub fn new_server_key_pair(
    ca: &CertificateAuthority,
    common_name: &str,
    organization: &str,
    organizational_unit: &str,
    alt_dns_names: &[String],
    alt_ips: &[IpAddr],
) -> Result<CertKeyPair> {
    let dn = distinguished_name(&[
        (DnType::CommonName, common_name),
        (DnType::OrganizationName, organization),
        (DnType::OrganizationalUnitName, organizational_unit),
    ]);
    let sans = subject_alt_names(alt_dns_names, alt_ips)?;
    new_leaf(ca, dn, ExtendedKeyUsagePurpose::ServerAuth, sans)
}

/// Create a TLS client certificate signed by `ca`
pub fn new_client_key_pair(
    ca: &CertificateAuthority,
    common_name: &str,
    alt_ips: &[IpAddr],
) -> Result<CertKeyPair> {
    let dn = distinguished_name(&[(DnType::CommonName, common_name)]);
    let sans = subject_alt_names(&[], alt_ips)?;
    new_leaf(ca, dn, ExtendedKeyUsagePurpose::ClientAuth, sans)
}

/// Generate an RSA key for signing service account tokens, PKCS#1 PEM encoded
pub fn new_service_account_signing_key(bits: usize) -> Result<String> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| CoreError::Crypto(format!("failed to generate a private key: {}", e)))?;
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CoreError::Crypto(format!("failed to encode private key: {}", e)))?;
    Ok(pem.as_str().to_owned())
}

/// Address inside an IPv4 CIDR block with the last byte replaced,
/// e.g. `100.64.0.0/11` and `10` give `100.64.0.10`
pub fn compute_cluster_ip(cidr: &str, last_byte: u8) -> Result<Ipv4Addr> {
    let network: Ipv4Network = cidr.parse().map_err(|e| {
        CoreError::InvalidConfiguration(format!("invalid service cidr {:?}: {}", cidr, e))
    })?;
    let mut octets = network.network().octets();
    octets[3] = last_byte;
    Ok(Ipv4Addr::from(octets))
}
