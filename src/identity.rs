//! Certificate authority adapter.
//!
//! Holds the identity (issuing) certificate, its private key and a pool of
//! additional trusted certificates. Everything here is read-only after
//! startup, so a single instance is shared across requests.

use crate::config::IdentityConfig;
use crate::error::MdmError;
use crate::service::IssuerIdentity;
use chrono::{DateTime, Duration, Utc};
use openssl::asn1::{Asn1Integer, Asn1Object, Asn1OctetString, Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{
    X509Builder, X509Extension, X509NameBuilder, X509Ref, X509Req, X509ReqRef, X509StoreContext,
    X509VerifyResult, X509,
};
use rand::Rng;
use std::path::Path;
use tracing::info;

/// Microsoft device ID certificate extension.
pub const DEVICE_ID_EXTENSION_OID: &str = "1.3.6.1.4.1.311.66.1.0";

/// The issuing identity and trust pool.
#[derive(Clone)]
pub struct CertificateAuthority {
    certificate: X509,
    private_key: PKey<Private>,
    trust_pool: Vec<X509>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &common_name(&self.certificate))
            .field("trust_pool", &self.trust_pool.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn new(certificate: X509, private_key: PKey<Private>, trust_pool: Vec<X509>) -> Self {
        Self {
            certificate,
            private_key,
            trust_pool,
        }
    }

    /// Load the identity and trust pool from PEM files.
    pub fn load(config: &IdentityConfig) -> Result<Self, MdmError> {
        let certificate = X509::from_pem(&read_file(&config.certificate_path)?)?;
        let private_key = PKey::private_key_from_pem(&read_file(&config.private_key_path)?)?;

        let mut trust_pool = Vec::new();
        for path in &config.trust_pool_paths {
            trust_pool.extend(X509::stack_from_pem(&read_file(path)?)?);
        }

        info!(
            subject = ?common_name(&certificate),
            trust_pool = trust_pool.len(),
            "Loaded identity certificate"
        );
        Ok(Self::new(certificate, private_key, trust_pool))
    }

    /// Generate a self-signed identity.
    pub fn generate(common_name: &str, validity_days: u32) -> Result<Self, MdmError> {
        let private_key = PKey::from_rsa(Rsa::generate(2048)?)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        let name = name.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*random_serial()?)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&private_key)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::days_from_now(validity_days)?)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .digital_signature()
                .build()?,
        )?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        builder.sign(&private_key, MessageDigest::sha256())?;

        Ok(Self::new(builder.build(), private_key, vec![]))
    }

    /// Write the identity as PEM files.
    pub fn save(&self, config: &IdentityConfig) -> Result<(), MdmError> {
        for path in [&config.certificate_path, &config.private_key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&config.certificate_path, self.certificate.to_pem()?)?;
        std::fs::write(
            &config.private_key_path,
            self.private_key.private_key_to_pem_pkcs8()?,
        )?;
        Ok(())
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Check the certificate chains to the identity or the trust pool.
    pub fn verify_trust_chain(&self, cert: &X509Ref) -> Result<(), MdmError> {
        let mut store = X509StoreBuilder::new()?;
        store.add_cert(self.certificate.clone())?;
        for trusted in &self.trust_pool {
            store.add_cert(trusted.clone())?;
        }
        let store = store.build();

        let chain: Stack<X509> = Stack::new()?;
        let mut ctx = X509StoreContext::new()?;
        let failure = ctx.init(&store, cert, &chain, |c| {
            Ok(if c.verify_cert()? { None } else { Some(c.error()) })
        })?;
        match failure {
            None => Ok(()),
            Some(reason) => Err(MdmError::Certificate(format!(
                "certificate is not trusted: {}",
                reason
            ))),
        }
    }
}

impl IssuerIdentity for CertificateAuthority {
    fn issuer_identity(&self) -> Result<(X509, PKey<Private>), MdmError> {
        Ok((self.certificate.clone(), self.private_key.clone()))
    }

    fn is_issuer_identity(&self, cert: &X509Ref) -> Result<(), MdmError> {
        if self.certificate.issued(cert) != X509VerifyResult::OK {
            return Err(MdmError::Certificate(
                "certificate was not issued by the identity certificate".to_string(),
            ));
        }
        let public_key = self.certificate.public_key()?;
        if !cert.verify(&public_key)? {
            return Err(MdmError::Certificate(
                "certificate signature does not match the identity key".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, MdmError> {
    std::fs::read(path).map_err(|e| {
        MdmError::Config(format!("Failed to read {}: {}", path.display(), e))
    })
}

fn random_serial() -> Result<Asn1Integer, MdmError> {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

/// Parse a DER PKCS#10 request and check its self-signature.
pub fn parse_csr(der: &[u8]) -> Result<X509Req, MdmError> {
    let csr = X509Req::from_der(der)?;
    let public_key = csr.public_key()?;
    if !csr.verify(&public_key)? {
        return Err(MdmError::Certificate(
            "certificate request signature is invalid".to_string(),
        ));
    }
    Ok(csr)
}

/// What the issued device certificate should look like.
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    /// Subject common name
    pub common_name: String,
    /// Value of the device ID extension
    pub device_id: String,
    /// Validity in days from NotBefore
    pub validity_days: u32,
    /// Maximum random backdate of NotBefore
    pub max_jitter_minutes: u32,
}

/// Sign a device certificate for `csr` with a jittered one-year window.
pub fn sign_csr(
    issuer: &X509Ref,
    issuer_key: &PKey<Private>,
    csr: &X509ReqRef,
    template: &CertificateTemplate,
) -> Result<X509, MdmError> {
    let jitter = rand::thread_rng().gen_range(0..=template.max_jitter_minutes);
    let not_before = Utc::now() - Duration::minutes(i64::from(jitter));
    let not_after = not_before + Duration::days(i64::from(template.validity_days));
    sign_csr_with_window(issuer, issuer_key, csr, template, not_before, not_after)
}

/// Sign a device certificate valid between the given instants.
pub fn sign_csr_with_window(
    issuer: &X509Ref,
    issuer_key: &PKey<Private>,
    csr: &X509ReqRef,
    template: &CertificateTemplate,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<X509, MdmError> {
    let seed = format!("{}{}", template.common_name, Utc::now().to_rfc3339());
    let mut digest = openssl::sha::sha1(seed.as_bytes());
    // positive and at most 20 octets once DER encoded
    digest[0] &= 0x7f;
    let serial = BigNum::from_slice(&digest)?.to_asn1_integer()?;

    let mut subject = X509NameBuilder::new()?;
    subject.append_entry_by_nid(Nid::COMMONNAME, &template.common_name)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&subject.build())?;
    builder.set_issuer_name(issuer.subject_name())?;
    let public_key = csr.public_key()?;
    builder.set_pubkey(&public_key)?;
    builder.set_not_before(&*Asn1Time::from_unix(not_before.timestamp())?)?;
    builder.set_not_after(&*Asn1Time::from_unix(not_after.timestamp())?)?;
    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
    let oid = Asn1Object::from_str(DEVICE_ID_EXTENSION_OID)?;
    let value = Asn1OctetString::new_from_bytes(template.device_id.as_bytes())?;
    builder.append_extension(X509Extension::new_from_der(&oid, false, &value)?)?;
    builder.sign(issuer_key, MessageDigest::sha256())?;

    Ok(builder.build())
}

/// Content and signer of a PKCS#7 renewal envelope.
#[derive(Debug, Clone)]
pub struct RenewalEnvelope {
    /// Enclosed PKCS#10 request
    pub csr: Vec<u8>,
    /// Certificate that signed the envelope
    pub signer: X509,
}

/// Parse a DER PKCS#7 SignedData and verify its signature.
///
/// Only the signature is checked here; whether the signer is trusted is
/// decided by [`IssuerIdentity::is_issuer_identity`].
pub fn open_renewal_envelope(der: &[u8]) -> Result<RenewalEnvelope, MdmError> {
    let pkcs7 = Pkcs7::from_der(der)?;
    let certs: Stack<X509> = Stack::new()?;
    let store = X509StoreBuilder::new()?.build();

    let mut content = Vec::new();
    pkcs7.verify(&certs, &store, None, Some(&mut content), Pkcs7Flags::NOVERIFY)?;

    let signer = pkcs7
        .signers(&certs, Pkcs7Flags::empty())?
        .into_iter()
        .next()
        .ok_or_else(|| MdmError::Certificate("envelope has no signer".to_string()))?;

    Ok(RenewalEnvelope {
        csr: content,
        signer,
    })
}

/// Subject common name of a certificate.
pub fn common_name(cert: &X509Ref) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

/// Convert an ASN.1 time to UTC.
pub fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>, MdmError> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| MdmError::Certificate("certificate time out of range".to_string()))
}

/// NotBefore and NotAfter of a certificate.
pub fn validity(cert: &X509Ref) -> Result<(DateTime<Utc>, DateTime<Utc>), MdmError> {
    Ok((
        asn1_to_datetime(cert.not_before())?,
        asn1_to_datetime(cert.not_after())?,
    ))
}

/// True when `now` is inside the certificate's validity window.
pub fn is_current(not_before: DateTime<Utc>, not_after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    not_before <= now && now <= not_after
}

/// True once the certificate is within `period_days` of expiring.
pub fn renewal_window_open(not_after: DateTime<Utc>, now: DateTime<Utc>, period_days: u32) -> bool {
    not_after - now <= Duration::days(i64::from(period_days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::x509::X509ReqBuilder;

    fn make_csr(cn: &str) -> (X509Req, PKey<Private>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
        let mut req = X509ReqBuilder::new().unwrap();
        req.set_pubkey(&key).unwrap();
        req.set_subject_name(&name.build()).unwrap();
        req.sign(&key, MessageDigest::sha256()).unwrap();
        (req.build(), key)
    }

    fn template(cn: &str) -> CertificateTemplate {
        CertificateTemplate {
            common_name: cn.to_string(),
            device_id: "device-123".to_string(),
            validity_days: 365,
            max_jitter_minutes: 120,
        }
    }

    #[test]
    fn test_parse_csr_verifies_signature() {
        let (csr, _) = make_csr("device-123");
        let der = csr.to_der().unwrap();
        assert!(parse_csr(&der).is_ok());
        assert!(parse_csr(b"not a csr").is_err());
    }

    #[test]
    fn test_sign_csr_fields() {
        let ca = CertificateAuthority::generate("Zentinel Identity", 30).unwrap();
        let (issuer, key) = ca.issuer_identity().unwrap();
        let (csr, _) = make_csr("ignored");
        let cert = sign_csr(&issuer, &key, &csr, &template("device-123")).unwrap();

        assert_eq!(common_name(&cert).as_deref(), Some("device-123"));
        assert!(ca.is_issuer_identity(&cert).is_ok());

        let (not_before, not_after) = validity(&cert).unwrap();
        let now = Utc::now();
        assert!(not_before <= now);
        assert!(now - not_before <= Duration::minutes(121));
        assert_eq!(not_after - not_before, Duration::days(365));

        let der = cert.to_der().unwrap();
        assert!(der.windows(b"device-123".len()).any(|w| w == b"device-123"));
        let text = String::from_utf8(cert.to_text().unwrap()).unwrap();
        assert!(text.contains(DEVICE_ID_EXTENSION_OID));
        assert!(text.contains("TLS Web Client Authentication"));
        assert!(text.contains("CA:FALSE"));
    }

    #[test]
    fn test_serial_fits_twenty_octets() {
        let ca = CertificateAuthority::generate("Zentinel Identity", 30).unwrap();
        let (issuer, key) = ca.issuer_identity().unwrap();
        let (csr, _) = make_csr("ignored");

        for i in 0..32 {
            let cert = sign_csr(&issuer, &key, &csr, &template(&format!("device-{}", i))).unwrap();
            let serial = cert.serial_number().to_bn().unwrap();
            assert!(!serial.is_negative());
            assert!(serial.num_bits() <= 159, "serial has {} bits", serial.num_bits());
        }
    }

    #[test]
    fn test_is_issuer_identity_rejects_foreign_certificate() {
        let ca = CertificateAuthority::generate("Zentinel Identity", 30).unwrap();
        let other = CertificateAuthority::generate("Someone Else", 30).unwrap();
        let (issuer, key) = other.issuer_identity().unwrap();
        let (csr, _) = make_csr("x");
        let cert = sign_csr(&issuer, &key, &csr, &template("device-123")).unwrap();
        assert!(ca.is_issuer_identity(&cert).is_err());
        assert!(ca.verify_trust_chain(&cert).is_err());
        assert!(other.verify_trust_chain(&cert).is_ok());
    }

    #[test]
    fn test_open_renewal_envelope() {
        let ca = CertificateAuthority::generate("Zentinel Identity", 30).unwrap();
        let (issuer, ca_key) = ca.issuer_identity().unwrap();
        let (csr, device_key) = make_csr("device-123");
        let signer = sign_csr(&issuer, &ca_key, &csr, &template("device-123")).unwrap();

        let (renew_csr, _) = make_csr("device-123");
        let payload = renew_csr.to_der().unwrap();
        let certs: Stack<X509> = Stack::new().unwrap();
        let pkcs7 =
            Pkcs7::sign(&signer, &device_key, &certs, &payload, Pkcs7Flags::BINARY).unwrap();

        let envelope = open_renewal_envelope(&pkcs7.to_der().unwrap()).unwrap();
        assert_eq!(envelope.csr, payload);
        assert_eq!(common_name(&envelope.signer).as_deref(), Some("device-123"));
        assert!(open_renewal_envelope(b"garbage").is_err());
    }

    #[test]
    fn test_renewal_window_boundary() {
        let now = Utc::now();
        assert!(renewal_window_open(now + Duration::days(42), now, 42));
        assert!(renewal_window_open(now + Duration::days(10), now, 42));
        assert!(!renewal_window_open(
            now + Duration::days(42) + Duration::seconds(1),
            now,
            42
        ));
    }

    #[test]
    fn test_is_current() {
        let now = Utc::now();
        assert!(is_current(now - Duration::days(1), now + Duration::days(1), now));
        assert!(!is_current(now - Duration::days(2), now - Duration::days(1), now));
        assert!(!is_current(now + Duration::days(1), now + Duration::days(2), now));
    }

    #[test]
    fn test_asn1_to_datetime() {
        let time = Asn1Time::from_unix(1_700_000_000).unwrap();
        assert_eq!(asn1_to_datetime(&time).unwrap().timestamp(), 1_700_000_000);
    }
}
