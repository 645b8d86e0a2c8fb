//! X.509 certificate factory: RSA key generation and a root -> intermediate
//! -> leaf issuance chain.
//!
//! Every certificate is backed by an RSA-2048 key generated with the `rsa`
//! crate (rcgen cannot generate RSA keys itself, only import them), then
//! handed to `rcgen` as an imported PKCS#8 key for the actual DER encoding
//! and signing. The Subject Key Identifier is computed by hand as SHA-1 of
//! the raw modulus bytes rather than rcgen's default SPKI hash, matching the
//! source tool this factory is modeled on.

pub mod length_search;

use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyIdMethod, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use sha1::{Digest, Sha1};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::error::{CastforgeError, Result};

const RSA_BITS: usize = 2048;

/// Default subject fields shared by every certificate this factory issues.
/// The Organizational Unit is the one field callers are expected to mutate
/// (see [`length_search`]) to tune the DER-encoded length of a certificate.
#[derive(Debug, Clone)]
pub struct CertTemplate {
    pub common_name: String,
    pub country: String,
    pub province: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
    pub is_ca: bool,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// DNS names for the certificate's `subjectAltName` extension. Empty by
    /// default; a leaf meant to terminate TLS under a particular hostname
    /// (see `mod::build_tls_config`'s caller) must set this or every client
    /// hostname check against it will fail regardless of chain trust.
    pub subject_alt_names: Vec<String>,
}

impl CertTemplate {
    /// The default CA template: validity from one year ago to nine years
    /// from now, matching the source tool's `-1y..+9y` window.
    pub fn default_ca(common_name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            common_name: common_name.into(),
            country: "US".to_string(),
            province: "TX".to_string(),
            locality: "Heart of".to_string(),
            organization: "Acme Co Inc".to_string(),
            organizational_unit: "Cast-x".to_string(),
            is_ca: true,
            not_before: now - Duration::days(365),
            not_after: now + Duration::days(365 * 9),
            subject_alt_names: Vec::new(),
        }
    }

    /// The default leaf template: short-lived, now-10min to now+24h.
    ///
    /// This short validity window is applied only when the caller lets the
    /// factory auto-construct the template, matching (and preserving) an
    /// asymmetry in the source: a caller-supplied template is used verbatim
    /// and does not get this treatment.
    pub fn default_leaf(common_name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            common_name: common_name.into(),
            country: "US".to_string(),
            province: "TX".to_string(),
            locality: "Heart of".to_string(),
            organization: "Acme Co Inc".to_string(),
            organizational_unit: "Cast-x".to_string(),
            is_ca: false,
            not_before: now - Duration::minutes(10),
            not_after: now + Duration::hours(24),
            subject_alt_names: Vec::new(),
        }
    }

    /// Attach DNS `subjectAltName`s, e.g. for a leaf that will terminate TLS
    /// under a hostname a client checks.
    pub fn with_dns_sans(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subject_alt_names = names.into_iter().map(Into::into).collect();
        self
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.clone());
        dn.push(DnType::CountryName, self.country.clone());
        dn.push(DnType::StateOrProvinceName, self.province.clone());
        dn.push(DnType::LocalityName, self.locality.clone());
        dn.push(DnType::OrganizationName, self.organization.clone());
        dn.push(
            DnType::OrganizationalUnitName,
            self.organizational_unit.clone(),
        );
        dn
    }
}

/// A private RSA key and its issued X.509 certificate.
///
/// Invariant: `cert`'s subject public key equals `private_key`'s public
/// part -- guaranteed here because the certificate is always built from
/// this exact key.
///
/// Deliberately does not retain an `rcgen::Certificate` handle: a `KeyPair`
/// loaded back from disk (no such handle available) must be just as usable
/// as an issuer as one freshly generated in this process. Chaining instead
/// rebuilds an issuer `rcgen::Certificate` from `cert_der` + `private_key` on demand.
pub struct KeyPair {
    pub private_key: RsaPrivateKey,
    /// The issued, DER-encoded certificate.
    pub cert_der: Vec<u8>,
    pub is_ca: bool,
}

impl KeyPair {
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Wrap an already-issued certificate and its key, e.g. one loaded back
    /// from `ca.crt`/`ca.key` by [`load_from_files`].
    pub fn from_parts(private_key: RsaPrivateKey, cert_der: Vec<u8>, is_ca: bool) -> Self {
        Self { private_key, cert_der, is_ca }
    }

    /// Encode the certificate as a PEM `CERTIFICATE` block (RFC 7468).
    pub fn cert_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.cert_der.clone()))
    }

    /// Encode the private key as a PEM `RSA PRIVATE KEY` block (PKCS#1).
    pub fn key_pem(&self) -> Result<String> {
        self.private_key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .map(|s| (*s).clone())
            .map_err(|e| CastforgeError::Crypto(format!("PKCS#1 PEM encode failed: {e}")))
    }

    /// Persist `cert.pem`/`key.pem` to `cert_path`/`key_path` with mode
    /// 0600 (owner read/write only).
    pub fn persist_to_files(&self, cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<()> {
        write_restricted(cert_path, self.cert_pem().as_bytes())?;
        write_restricted(key_path, self.key_pem()?.as_bytes())?;
        Ok(())
    }
}

#[cfg(unix)]
fn write_restricted(path: &std::path::Path, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, data)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_restricted(path: &std::path::Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)?;
    Ok(())
}

/// Load a `KeyPair` back from a PEM certificate and a PEM PKCS#1 private
/// key. Used when the operator supplies an existing `ca.crt`/`ca.key`.
pub fn load_from_files(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<(Vec<u8>, RsaPrivateKey)> {
    let cert_pem = std::fs::read_to_string(cert_path)?;
    let key_pem = std::fs::read_to_string(key_path)?;

    let cert_der = pem_to_der(&cert_pem, "CERTIFICATE")?;
    let private_key = RsaPrivateKey::from_pkcs1_pem(&key_pem)
        .map_err(|e| CastforgeError::Format(format!("PKCS#1 key parse failed: {e}")))?;

    Ok((cert_der, private_key))
}

fn pem_to_der(pem_str: &str, expected_label: &str) -> Result<Vec<u8>> {
    let parsed = pem::parse(pem_str).map_err(|e| CastforgeError::Format(format!("malformed PEM: {e}")))?;
    if parsed.tag() != expected_label {
        return Err(CastforgeError::Format(format!(
            "unexpected PEM type: expected {expected_label}, got {}",
            parsed.tag()
        )));
    }
    Ok(parsed.into_contents())
}

/// SHA-1 of the raw RSA modulus bytes, used as the Subject Key Identifier.
///
/// Deliberately not rcgen's default SPKI hash: the source tool hashes the
/// modulus alone.
fn subject_key_identifier(key: &RsaPrivateKey) -> Vec<u8> {
    let modulus_bytes = key.n().to_bytes_be();
    let mut hasher = Sha1::new();
    hasher.update(&modulus_bytes);
    hasher.finalize().to_vec()
}

fn random_serial_number() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
    // Clear the top bit so the DER INTEGER encoding stays unsigned-positive
    // without an extra leading zero byte -- keeps lengths predictable.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn rsa_to_rcgen_keypair(key: &RsaPrivateKey) -> Result<rcgen::KeyPair> {
    let pkcs8_der = key
        .to_pkcs8_der()
        .map_err(|e| CastforgeError::Crypto(format!("PKCS#8 encode failed: {e}")))?;
    let pkcs8_ref = PrivatePkcs8KeyDer::from(pkcs8_der.as_bytes());
    rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_ref, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| CastforgeError::Crypto(format!("rcgen key import failed: {e}")))
}

fn build_params(template: &CertTemplate, ski: Vec<u8>) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name = template.distinguished_name();
    params.not_before = template.not_before;
    params.not_after = template.not_after;
    params.serial_number = Some(random_serial_number());
    params.key_identifier_method = KeyIdMethod::PreSpecified(ski);

    if !template.subject_alt_names.is_empty() {
        params.subject_alt_names = template
            .subject_alt_names
            .iter()
            .map(|name| {
                Ia5String::try_from(name.as_str())
                    .map(SanType::DnsName)
                    .map_err(|e| CastforgeError::Configuration(format!("invalid DNS SAN {name:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
    }

    if template.is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    } else {
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
    }

    Ok(params)
}

fn generate_rsa_key() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, RSA_BITS)
        .map_err(|e| CastforgeError::Crypto(format!("RSA-2048 key generation failed: {e}")))
}

/// `GenerateRootCA(template?, key?) -> KeyPair`.
///
/// If no key is supplied, a fresh RSA-2048 key is generated. The resulting
/// certificate is self-signed.
pub fn generate_root_ca(template: Option<CertTemplate>, key: Option<RsaPrivateKey>) -> Result<KeyPair> {
    let template = template.unwrap_or_else(|| CertTemplate::default_ca("Cast Root CA"));
    let private_key = match key {
        Some(k) => k,
        None => generate_rsa_key()?,
    };

    let ski = subject_key_identifier(&private_key);
    let params = build_params(&template, ski)?;
    let rcgen_kp = rsa_to_rcgen_keypair(&private_key)?;

    let issued = params
        .self_signed(&rcgen_kp)
        .map_err(|e| CastforgeError::Crypto(format!("self-sign failed: {e}")))?;
    let cert_der = issued.der().to_vec();

    debug!(bytes = cert_der.len(), "issued root CA certificate");

    Ok(KeyPair { private_key, cert_der, is_ca: true })
}

/// `GenerateIntermediateCA(parent, template?, key?) -> KeyPair`.
pub fn generate_intermediate_ca(
    parent: &KeyPair,
    template: Option<CertTemplate>,
    key: Option<RsaPrivateKey>,
) -> Result<KeyPair> {
    let template = template.unwrap_or_else(|| CertTemplate::default_ca("Cast Inter CA"));
    issue_child(parent, template, key, true)
}

/// `GenerateLeaf(parent, template?, key?) -> KeyPair`. Not a CA; shorter
/// validity by default (see [`CertTemplate::default_leaf`]).
pub fn generate_leaf(
    parent: &KeyPair,
    template: Option<CertTemplate>,
    key: Option<RsaPrivateKey>,
) -> Result<KeyPair> {
    let template = template.unwrap_or_else(|| CertTemplate::default_leaf("Cast Cert"));
    issue_child(parent, template, key, false)
}

fn issue_child(
    parent: &KeyPair,
    mut template: CertTemplate,
    key: Option<RsaPrivateKey>,
    is_ca: bool,
) -> Result<KeyPair> {
    template.is_ca = is_ca;

    let private_key = match key {
        Some(k) => k,
        None => generate_rsa_key()?,
    };

    let ski = subject_key_identifier(&private_key);
    let params = build_params(&template, ski)?;
    let child_rcgen_kp = rsa_to_rcgen_keypair(&private_key)?;
    let parent_rcgen_kp = rsa_to_rcgen_keypair(&parent.private_key)?;
    let parent_der = CertificateDer::from(parent.cert_der.clone());

    let issuer_params = CertificateParams::from_ca_cert_der(&parent_der)
        .map_err(|e| CastforgeError::Crypto(format!("failed to build issuer from parent cert: {e}")))?;
    let issuer_cert = issuer_params
        .self_signed(&parent_rcgen_kp)
        .map_err(|e| CastforgeError::Crypto(format!("failed to build issuer from parent cert: {e}")))?;
    let issued = params
        .signed_by(&child_rcgen_kp, &issuer_cert, &parent_rcgen_kp)
        .map_err(|e| CastforgeError::Crypto(format!("chain signing failed: {e}")))?;
    let cert_der = issued.der().to_vec();

    debug!(bytes = cert_der.len(), is_ca, "issued chained certificate");

    Ok(KeyPair { private_key, cert_der, is_ca })
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::FromDer;

    #[test]
    fn root_ca_is_self_consistent() {
        let kp = generate_root_ca(None, None).unwrap();
        assert!(kp.is_ca);
        assert!(!kp.cert_der.is_empty());

        let (_, parsed) = x509_parser::prelude::X509Certificate::from_der(&kp.cert_der).unwrap();
        assert!(parsed.is_ca());
    }

    #[test]
    fn intermediate_chains_to_root() {
        let root = generate_root_ca(None, None).unwrap();
        let inter = generate_intermediate_ca(&root, None, None).unwrap();
        assert!(inter.is_ca);

        let (_, parsed) = x509_parser::prelude::X509Certificate::from_der(&inter.cert_der).unwrap();
        let (_, root_parsed) =
            x509_parser::prelude::X509Certificate::from_der(&root.cert_der).unwrap();
        assert_eq!(parsed.issuer(), &root_parsed.subject().clone());
    }

    #[test]
    fn leaf_is_not_a_ca_and_short_lived() {
        let root = generate_root_ca(None, None).unwrap();
        let leaf = generate_leaf(&root, None, None).unwrap();
        assert!(!leaf.is_ca);

        let (_, parsed) = x509_parser::prelude::X509Certificate::from_der(&leaf.cert_der).unwrap();
        assert!(!parsed.is_ca());
        let window = parsed.validity().not_after.timestamp() - parsed.validity().not_before.timestamp();
        assert!(window <= 25 * 3600);
    }

    #[test]
    fn pem_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let kp = generate_root_ca(None, None).unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        kp.persist_to_files(&cert_path, &key_path).unwrap();

        let (loaded_der, _loaded_key) = load_from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded_der, kp.cert_der);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&cert_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn ski_is_sha1_of_modulus() {
        let kp = generate_root_ca(None, None).unwrap();
        let expected = subject_key_identifier(&kp.private_key);
        assert_eq!(expected.len(), 20);
    }
}
