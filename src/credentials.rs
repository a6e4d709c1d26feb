//! Materializing signing credentials from PKCS#12 bundles.
//!
//! Every fiscal document row carries the filesystem location of its
//! taxpayer certificate and the passphrase protecting it.  The bundle is
//! decrypted on demand, used for one message, and dropped; key material is
//! never cached across messages and never written back to disk.

use std::fmt;

use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::{X509, X509Ref};

//------------ Credentials ---------------------------------------------------

/// A decrypted signing identity: private key, certificate and any chain
/// certificates shipped in the bundle.
#[derive(Clone)]
pub struct Credentials {
    pkey: PKey<Private>,
    cert: X509,
    chain: Vec<X509>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("subject", &self.cert.subject_name())
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Load and decrypt a PKCS#12 bundle.
    pub fn load(path: &str, password: &str) -> Result<Self, CredentialError> {
        let bytes = std::fs::read(path).map_err(|err| CredentialError::Read {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        Self::from_der(&bytes, password)
    }

    /// Decrypt an in-memory PKCS#12 bundle.
    pub fn from_der(der: &[u8], password: &str) -> Result<Self, CredentialError> {
        let parsed = Pkcs12::from_der(der)
            .and_then(|p12| p12.parse2(password))
            .map_err(|err| CredentialError::Decode(err.to_string()))?;

        let pkey = parsed.pkey.ok_or(CredentialError::NoKey)?;
        let cert = parsed.cert.ok_or(CredentialError::NoCertificate)?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        Ok(Self { pkey, cert, chain })
    }

    /// The private key used to produce signature values.
    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.pkey
    }

    /// The signing certificate.
    pub fn certificate(&self) -> &X509Ref {
        &self.cert
    }

    /// The certificate as base64 DER, the form embedded in `KeyInfo`.
    pub fn certificate_base64(&self) -> Result<String, CredentialError> {
        use base64::Engine;
        let der = self
            .cert
            .to_der()
            .map_err(|err| CredentialError::Decode(err.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(der))
    }

    /// A PEM bundle (key, certificate, chain) for the TLS client identity.
    ///
    /// Keeping this in memory means no temporary key files exist at any
    /// point of an exchange.
    pub fn identity_pem(&self) -> Result<Vec<u8>, CredentialError> {
        let mut pem = self
            .pkey
            .private_key_to_pem_pkcs8()
            .map_err(|err| CredentialError::Decode(err.to_string()))?;
        let cert = self
            .cert
            .to_pem()
            .map_err(|err| CredentialError::Decode(err.to_string()))?;
        pem.extend_from_slice(&cert);
        for cert in &self.chain {
            let cert = cert
                .to_pem()
                .map_err(|err| CredentialError::Decode(err.to_string()))?;
            pem.extend_from_slice(&cert);
        }
        Ok(pem)
    }
}

//------------ CredentialError -----------------------------------------------

/// A PKCS#12 bundle could not be materialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialError {
    /// The bundle file could not be read.
    Read { path: String, reason: String },

    /// The bundle could not be decrypted or decoded; a wrong passphrase
    /// ends up here.
    Decode(String),

    /// The bundle holds no private key.
    NoKey,

    /// The bundle holds no certificate.
    NoCertificate,
}

impl std::error::Error for CredentialError {}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, reason } => {
                write!(f, "cannot read certificate bundle '{path}': {reason}")
            }
            Self::Decode(reason) => {
                write!(f, "cannot decode certificate bundle: {reason}")
            }
            Self::NoKey => f.write_str("the certificate bundle holds no private key"),
            Self::NoCertificate => f.write_str("the certificate bundle holds no certificate"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{CredentialError, Credentials};
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkcs12::Pkcs12;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509, X509NameBuilder};

    /// A throwaway self-signed identity packed as PKCS#12.
    pub(crate) fn test_bundle(password: &str) -> Vec<u8> {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "sifend test").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let mut p12 = Pkcs12::builder();
        p12.name("sifend test");
        p12.pkey(&pkey);
        p12.cert(&cert);
        p12.build2(password).unwrap().to_der().unwrap()
    }

    #[test]
    fn bundle_round_trip() {
        let der = test_bundle("segredo");
        let creds = Credentials::from_der(&der, "segredo").unwrap();
        assert!(!creds.certificate_base64().unwrap().is_empty());

        let pem = creds.identity_pem().unwrap();
        let pem = String::from_utf8(pem).unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn wrong_passphrase_is_a_decode_error() {
        let der = test_bundle("segredo");
        match Credentials::from_der(&der, "errado") {
            Err(CredentialError::Decode(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_a_read_error() {
        match Credentials::load("/nonexistent/bundle.p12", "x") {
            Err(CredentialError::Read { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
