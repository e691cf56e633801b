//! X.509 identity handling
//!
//! The registry's CA certificate doubles as the network definition: its
//! serial number is a marker bit followed by the managed network bits.
//! Issued certificates carry the allocation in the subject CN as
//! `"<prefix as integer>/<prefix length>"`.

use crate::prefix::{Network, Prefix};
use crate::{Error, Result};
use der::asn1::ObjectIdentifier;
use der::{DecodePem, Encode};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyPair, SerialNumber,
};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use time::{Duration, OffsetDateTime};
use x509_cert::Certificate;

const CN_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// Default validity of issued certificates.
pub const CERT_DURATION_DAYS: i64 = 365;

/// RSA modulus size for node keys.
pub const NODE_KEY_BITS: usize = 2048;

/// Parsed CA certificate: the PEM itself plus the network encoded in
/// its serial number.
#[derive(Debug, Clone)]
pub struct CaInfo {
    pub cert_pem: String,
    pub network: Network,
}

impl CaInfo {
    pub fn parse(cert_pem: &str) -> Result<Self> {
        let cert = Certificate::from_pem(cert_pem.as_bytes())?;
        let network = Network::from_serial(cert.tbs_certificate.serial_number.as_bytes())?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            network,
        })
    }
}

/// Generate a self-signed CA for the given network. Returns
/// `(certificate PEM, private key PEM)`.
pub fn generate_ca(network: &Network, common_name: &str) -> Result<(String, String)> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(Vec::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let serial = network.to_serial().to_be_bytes();
    // The marker bit keeps the serial non-zero for any network length.
    let first = serial.iter().position(|b| *b != 0).unwrap_or(serial.len() - 1);
    params.serial_number = Some(SerialNumber::from(serial[first..].to_vec()));
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(CERT_DURATION_DAYS * 10);
    let cert = params.self_signed(&key)?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Registry-side certificate signer.
pub struct CertSigner {
    ca_params: CertificateParams,
    ca_key: KeyPair,
}

impl CertSigner {
    pub fn new(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(ca_key_pem)?;
        let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)?;
        Ok(Self { ca_params, ca_key })
    }

    /// Sign a CSR, overriding its subject CN with the allocated prefix
    /// and pinning the validity window at issuance time.
    pub fn issue(&self, csr_pem: &str, prefix: &Prefix) -> Result<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)?;

        // Keep the requested subject except for the CN, which encodes
        // the allocation.
        let mut dn = DistinguishedName::new();
        for (ty, value) in csr.params.distinguished_name.iter() {
            if *ty != DnType::CommonName {
                dn.push(ty.clone(), value.clone());
            }
        }
        dn.push(DnType::CommonName, prefix.to_common_name());
        csr.params.distinguished_name = dn;

        csr.params.not_before = OffsetDateTime::now_utc();
        csr.params.not_after = csr.params.not_before + Duration::days(CERT_DURATION_DAYS);
        csr.params.is_ca = IsCa::ExplicitNoCa;

        let issuer = self.ca_params.clone().self_signed(&self.ca_key)?;
        let cert = csr.signed_by(&issuer, &self.ca_key)?;
        Ok(cert.pem())
    }
}

/// Generate a node RSA private key, PKCS#8 PEM encoded.
pub fn generate_node_key() -> Result<String> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), NODE_KEY_BITS)?;
    Ok(key.to_pkcs8_pem(LineEnding::LF)?.to_string())
}

/// Build a certificate signing request for a node key.
pub fn make_csr(key_pem: &str, email: &str) -> Result<String> {
    let key = KeyPair::from_pem(key_pem)?;
    let mut params = CertificateParams::new(Vec::new())?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::OrganizationName, "weftnet");
    if !email.is_empty() {
        params
            .distinguished_name
            .push(DnType::CustomDnType(vec![1, 2, 840, 113549, 1, 9, 1]), email);
    }
    Ok(params.serialize_request(&key)?.pem()?)
}

/// Extract the subject CN of a certificate.
pub fn cert_common_name(cert_pem: &str) -> Result<String> {
    let cert = Certificate::from_pem(cert_pem.as_bytes())?;
    for rdn in cert.tbs_certificate.subject.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid == CN_OID {
                if let Ok(s) = atv.value.decode_as::<der::asn1::Utf8StringRef>() {
                    return Ok(s.as_str().to_string());
                }
                if let Ok(s) = atv.value.decode_as::<der::asn1::PrintableStringRef>() {
                    return Ok(s.as_str().to_string());
                }
            }
        }
    }
    Err(Error::Crypto("certificate has no common name".to_string()))
}

/// The allocation encoded in a node certificate.
pub fn cert_prefix(cert_pem: &str) -> Result<Prefix> {
    Prefix::from_common_name(&cert_common_name(cert_pem)?)
}

/// Encrypt a payload under the RSA public key of a certificate, so only
/// the certificate's holder can read it.
pub fn encrypt_for_cert(cert_pem: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let cert = Certificate::from_pem(cert_pem.as_bytes())?;
    let spki = cert.tbs_certificate.subject_public_key_info.to_der()?;
    let key = RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| Error::Crypto(format!("certificate key is not RSA: {}", e)))?;
    Ok(key.encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, payload)?)
}

/// Decrypt a payload with a node's RSA private key.
pub fn decrypt_with_key(key_pem: &str, blob: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPrivateKey::from_pkcs8_pem(key_pem)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(key.decrypt(Pkcs1v15Encrypt, blob)?)
}
