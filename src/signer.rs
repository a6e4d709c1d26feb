//! Signing fiscal documents and building their QR token.
//!
//! A document arrives as unsigned XML whose `<DE>` element carries the
//! 44-character control code (CDC) as its `Id`.  Signing stamps the
//! signing time, computes an enveloped XML digital signature referencing
//! the CDC, and splices a `<gCamFuFD>` group holding the QR consultation
//! URL right after the signature.  The QR URL is an ordered query string
//! sealed with SHA-256 over the query plus the taxpayer security code
//! (CSC).

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::hash::MessageDigest;
use openssl::sign::Signer as OpensslSigner;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::credentials::{CredentialError, Credentials};
use crate::xml::{Element, XmlError, parse};

/// The SIFEN schema namespace.
pub const SIFEN_NS: &str = "http://ekuatia.set.gov.py/sifen/xsd";

/// The XML digital signature namespace.
pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

/// The XML Schema instance namespace.
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// The SIFEN manual version all produced artifacts declare.
pub const SIFEN_VERSION: &str = "150";

const ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const ALG_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ALG_EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ALG_C14N_10: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const ALG_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

//------------ SignedDocument ------------------------------------------------

/// The outcome of signing one document.
#[derive(Clone, Debug)]
pub struct SignedDocument {
    /// The signed document, XML declaration included.
    pub xml: String,

    /// The control code taken from `DE/@Id`.
    pub cdc: String,

    /// The full QR consultation URL embedded in `dCarQR`.
    pub qr_url: String,
}

//------------ sign_document -------------------------------------------------

/// Sign a document and embed its QR token.
pub fn sign_document(
    xml: &str,
    credentials: &Credentials,
    csc: &str,
    csc_id: &str,
    qr_base_url: &str,
) -> Result<SignedDocument, SignError> {
    let mut doc = parse(xml)?;

    // The signing timestamp lives inside the signed subtree, so it must be
    // stamped before any digest is taken.
    if let Some(el) = doc.find_mut("dFecFirma") {
        el.set_text(signing_timestamp());
    }

    let de = doc
        .find("DE")
        .ok_or_else(|| SignError::missing("DE"))?;
    let cdc = de
        .attr("Id")
        .ok_or_else(|| SignError::missing("DE/@Id"))?
        .to_string();

    // Remission notes are expected to carry a transport group; its absence
    // is accepted but worth flagging.
    let doc_type = doc.find("iTiDE").and_then(|el| el.text());
    if doc_type.as_deref() == Some("7") && doc.find("gTransp").is_none() {
        warn!("document {cdc}: remission note without gTransp group");
    }

    let digest_b64 = digest_subtree(&doc, "DE")?;
    let signature = build_signature(&digest_b64, &format!("#{cdc}"), credentials)?;
    doc.push_child(signature);

    let qr_url = build_qr_url(&doc, &cdc, &digest_b64, csc, csc_id, qr_base_url);
    let fufd = Element::new("gCamFuFD")
        .with_child(Element::new("dCarQR").with_text(qr_url.as_str()));
    if !doc.insert_after("Signature", fufd) {
        // The signature was appended right above, so its slot must exist.
        return Err(SignError::missing("Signature"));
    }

    Ok(SignedDocument {
        xml: doc.serialize(true),
        cdc,
        qr_url,
    })
}

/// Locate the control code in an already signed document.
pub fn extract_cdc(xml: &str) -> Result<String, SignError> {
    let doc = parse(xml)?;
    let de = doc.find("DE").ok_or_else(|| SignError::missing("DE"))?;
    de.attr("Id")
        .map(str::to_string)
        .ok_or_else(|| SignError::missing("DE/@Id"))
}

/// The local signing time, second precision, no zone designator.
pub(crate) fn signing_timestamp() -> String {
    jiff::Zoned::now().strftime("%Y-%m-%dT%H:%M:%S").to_string()
}

//------------ signature assembly --------------------------------------------

/// Digest the named subtree: base64 of SHA-256 over its canonical bytes,
/// namespace context included.
pub(crate) fn digest_subtree(root: &Element, local: &str) -> Result<String, SignError> {
    let subtree = scoped_subtree(root, local).ok_or_else(|| SignError::missing(local))?;
    let digest = Sha256::digest(subtree.canonical().as_bytes());
    Ok(BASE64.encode(digest))
}

/// Build a detached `Signature` element over an already computed digest.
///
/// The digital signature namespace is bound as the default, without a
/// prefix, for the whole subtree.
pub(crate) fn build_signature(
    digest_b64: &str,
    reference_uri: &str,
    credentials: &Credentials,
) -> Result<Element, SignError> {
    let signed_info = Element::new("SignedInfo")
        .with_child(
            Element::new("CanonicalizationMethod").with_attr("Algorithm", ALG_EXC_C14N),
        )
        .with_child(Element::new("SignatureMethod").with_attr("Algorithm", ALG_RSA_SHA256))
        .with_child(
            Element::new("Reference")
                .with_attr("URI", reference_uri)
                .with_child(
                    Element::new("Transforms")
                        .with_child(
                            Element::new("Transform").with_attr("Algorithm", ALG_ENVELOPED),
                        )
                        .with_child(
                            Element::new("Transform").with_attr("Algorithm", ALG_C14N_10),
                        ),
                )
                .with_child(Element::new("DigestMethod").with_attr("Algorithm", ALG_SHA256))
                .with_child(Element::new("DigestValue").with_text(digest_b64)),
        );

    // SignedInfo is canonicalized in the namespace context it will occupy
    // in the final document.
    let mut si = signed_info.clone();
    si.set_attr("xmlns", XMLDSIG_NS);
    let signature_b64 = rsa_sha256(si.canonical().as_bytes(), credentials)?;

    Ok(Element::new("Signature")
        .with_attr("xmlns", XMLDSIG_NS)
        .with_child(signed_info)
        .with_child(Element::new("SignatureValue").with_text(signature_b64))
        .with_child(
            Element::new("KeyInfo").with_child(
                Element::new("X509Data").with_child(
                    Element::new("X509Certificate")
                        .with_text(credentials.certificate_base64()?),
                ),
            ),
        ))
}

fn rsa_sha256(data: &[u8], credentials: &Credentials) -> Result<String, SignError> {
    let mut signer = OpensslSigner::new(MessageDigest::sha256(), credentials.private_key())
        .map_err(|err| SignError::Signature(err.to_string()))?;
    signer
        .update(data)
        .map_err(|err| SignError::Signature(err.to_string()))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|err| SignError::Signature(err.to_string()))?;
    Ok(BASE64.encode(signature))
}

/// Clone the first element with the given local name, carrying along any
/// namespace declarations inherited from its ancestors.
pub(crate) fn scoped_subtree(root: &Element, local: &str) -> Option<Element> {
    fn walk(el: &Element, local: &str, scope: &mut Vec<(String, String)>) -> Option<Element> {
        if el.local_name() == local {
            let mut clone = el.clone();
            // Walking the scope innermost-first makes shadowing
            // redeclarations win; the target's own declarations beat both.
            let mut seen: Vec<&str> = Vec::new();
            for (name, value) in scope.iter().rev() {
                if seen.contains(&name.as_str()) {
                    continue;
                }
                seen.push(name.as_str());
                if clone.attr(name).is_none() {
                    clone.set_attr(name.as_str(), value.as_str());
                }
            }
            return Some(clone);
        }
        let decls = ns_decls(el);
        let pushed = decls.len();
        scope.extend(decls);
        let result = el.child_elements().find_map(|c| walk(c, local, scope));
        if result.is_none() {
            scope.truncate(scope.len() - pushed);
        }
        result
    }

    fn ns_decls(el: &Element) -> Vec<(String, String)> {
        el.attrs()
            .filter(|(name, _)| *name == "xmlns" || name.starts_with("xmlns:"))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    walk(root, local, &mut Vec::new())
}

//------------ QR token ------------------------------------------------------

/// Compose the QR consultation URL.
///
/// Field order is fixed by the consultation service.  The DigestValue
/// field is the lowercase hex of the base64 digest text itself (not of
/// the decoded digest bytes); the consultation service validates against
/// that rendering, so it is reproduced as-is.
fn build_qr_url(
    doc: &Element,
    cdc: &str,
    digest_b64: &str,
    csc: &str,
    csc_id: &str,
    qr_base_url: &str,
) -> String {
    let emission_date = match doc.find("dFeEmiDE").and_then(|el| el.text()) {
        Some(text) => hex::encode(text.as_bytes()),
        None => "0".to_string(),
    };
    let receiver_ruc = field_or_zero(doc, "dRucRec");
    let total = field_or_zero(doc, "dTotGralOpe");
    let total_vat = field_or_zero(doc, "dTotIVA");
    let items = doc.count("gCamItem");
    let digest_hex = hex::encode(digest_b64.as_bytes());

    let query = format!(
        "nVersion={SIFEN_VERSION}&Id={cdc}&dFeEmiDE={emission_date}\
         &dRucRec={receiver_ruc}&dTotGralOpe={total}&dTotIVA={total_vat}\
         &cItems={items}&DigestValue={digest_hex}&IdCSC={csc_id}"
    );
    let seal = hex::encode(Sha256::digest(
        format!("{query}{}", csc.trim()).as_bytes(),
    ));
    format!("{qr_base_url}{query}&cHashQR={seal}")
}

fn field_or_zero(doc: &Element, local: &str) -> String {
    doc.find(local)
        .and_then(|el| el.text())
        .unwrap_or_else(|| "0".to_string())
}

//------------ SignError -----------------------------------------------------

/// Signing a document failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignError {
    /// The input could not be parsed at all.
    Xml(XmlError),

    /// A required element or attribute is absent.
    Malformed(String),

    /// The cryptographic signature could not be produced.
    Signature(String),
}

impl SignError {
    fn missing(what: &str) -> Self {
        Self::Malformed(what.to_string())
    }
}

impl From<XmlError> for SignError {
    fn from(err: XmlError) -> Self {
        Self::Xml(err)
    }
}

impl From<CredentialError> for SignError {
    fn from(err: CredentialError) -> Self {
        Self::Signature(err.to_string())
    }
}

impl std::error::Error for SignError {}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xml(err) => err.fmt(f),
            Self::Malformed(what) => write!(f, "required element '{what}' is absent"),
            Self::Signature(reason) => write!(f, "signing failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::test_bundle;
    use openssl::hash::MessageDigest;
    use openssl::sign::Verifier;

    const CDC: &str = "01800695631001001000000612021112917595714694";

    fn sample_document() -> String {
        format!(
            "<rDE xmlns=\"{SIFEN_NS}\">\
               <dVerFor>150</dVerFor>\
               <DE Id=\"{CDC}\">\
                 <dFecFirma>1999-01-01T00:00:00</dFecFirma>\
                 <gTimb><iTiDE>1</iTiDE></gTimb>\
                 <gDatGralOpe><dFeEmiDE>2021-11-29T17:59:57</dFeEmiDE>\
                   <gDatRec><dRucRec>80012345</dRucRec></gDatRec></gDatGralOpe>\
                 <gDtipDE><gCamItem><dCodInt>A</dCodInt></gCamItem>\
                   <gCamItem><dCodInt>B</dCodInt></gCamItem></gDtipDE>\
                 <gTotSub><dTotGralOpe>150000</dTotGralOpe>\
                   <dTotIVA>13636</dTotIVA></gTotSub>\
               </DE>\
             </rDE>"
        )
    }

    fn credentials() -> Credentials {
        Credentials::from_der(&test_bundle("segredo"), "segredo").unwrap()
    }

    #[test]
    fn signs_and_embeds_qr() {
        let creds = credentials();
        let signed = sign_document(
            &sample_document(),
            &creds,
            "ABCD0000000000000000000000000000",
            "0001",
            "https://ekuatia.set.gov.py/consultas/qr?",
        )
        .unwrap();

        assert_eq!(signed.cdc, CDC);
        assert!(signed.xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(signed.xml.contains(&format!("<Signature xmlns=\"{XMLDSIG_NS}\">")));
        assert!(signed.xml.contains(&format!("URI=\"#{CDC}\"")));
        // The QR group sits right after the signature.
        assert!(signed.xml.contains("</Signature><gCamFuFD><dCarQR>"));
        // The stamped signing time replaced the placeholder.
        assert!(!signed.xml.contains("1999-01-01T00:00:00"));
    }

    #[test]
    fn qr_seal_recomputes_from_url() {
        let creds = credentials();
        let csc = "ABCD0000000000000000000000000000";
        let signed = sign_document(
            &sample_document(),
            &creds,
            csc,
            "0001",
            "https://ekuatia.set.gov.py/consultas/qr?",
        )
        .unwrap();

        let query = signed
            .qr_url
            .strip_prefix("https://ekuatia.set.gov.py/consultas/qr?")
            .unwrap();
        let (base, seal) = query.split_once("&cHashQR=").unwrap();
        let expected = hex::encode(Sha256::digest(format!("{base}{csc}").as_bytes()));
        assert_eq!(seal, expected);
    }

    #[test]
    fn qr_fields_are_ordered_and_hexed() {
        let creds = credentials();
        let signed = sign_document(&sample_document(), &creds, "CSC01", "0002", "Q?").unwrap();

        let emission_hex = hex::encode("2021-11-29T17:59:57".as_bytes());
        assert!(signed.qr_url.contains(&format!(
            "nVersion=150&Id={CDC}&dFeEmiDE={emission_hex}&dRucRec=80012345"
        )));
        assert!(signed.qr_url.contains("&cItems=2&DigestValue="));
        assert!(signed.qr_url.contains("&IdCSC=0002&cHashQR="));

        // The digest field is the hex of the base64 text, so decoding it
        // back must yield the DigestValue element verbatim.
        let doc = parse(&signed.xml).unwrap();
        let digest_b64 = doc.find("DigestValue").unwrap().text().unwrap();
        let field = signed
            .qr_url
            .split("&DigestValue=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        assert_eq!(field, hex::encode(digest_b64.as_bytes()));
    }

    #[test]
    fn signature_value_verifies_over_canonical_signed_info() {
        let creds = credentials();
        let signed = sign_document(&sample_document(), &creds, "CSC", "1", "Q?").unwrap();

        let doc = parse(&signed.xml).unwrap();
        let si = scoped_subtree(&doc, "SignedInfo").unwrap();
        let signature_b64 = doc.find("SignatureValue").unwrap().text().unwrap();
        let signature = BASE64.decode(signature_b64).unwrap();

        let public = creds.certificate().public_key().unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public).unwrap();
        verifier.update(si.canonical().as_bytes()).unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }

    #[test]
    fn digest_covers_the_de_subtree() {
        let creds = credentials();
        let signed = sign_document(&sample_document(), &creds, "CSC", "1", "Q?").unwrap();

        // Recompute the digest over the signed document's DE subtree; the
        // signature and QR group live outside it, so the value must match
        // the recorded one.
        let doc = parse(&signed.xml).unwrap();
        let recomputed = digest_subtree(&doc, "DE").unwrap();
        let recorded = doc.find("DigestValue").unwrap().text().unwrap();
        assert_eq!(recomputed, recorded);
    }

    #[test]
    fn missing_de_is_malformed() {
        let creds = credentials();
        let err = sign_document("<rDE><x/></rDE>", &creds, "c", "1", "Q?").unwrap_err();
        assert_eq!(err, SignError::Malformed("DE".to_string()));
    }

    #[test]
    fn missing_id_is_malformed() {
        let creds = credentials();
        let err = sign_document("<rDE><DE><a/></DE></rDE>", &creds, "c", "1", "Q?").unwrap_err();
        assert_eq!(err, SignError::Malformed("DE/@Id".to_string()));
    }

    #[test]
    fn extract_cdc_reads_the_id() {
        let xml = format!("<rDE><DE Id=\"{CDC}\"><x/></DE></rDE>");
        assert_eq!(extract_cdc(&xml).unwrap(), CDC);
        assert!(extract_cdc("<rDE><y/></rDE>").is_err());
    }

    #[test]
    fn remission_without_transport_group_still_signs() {
        let creds = credentials();
        let xml = format!(
            "<rDE xmlns=\"{SIFEN_NS}\"><DE Id=\"{CDC}\">\
               <gTimb><iTiDE>7</iTiDE></gTimb></DE></rDE>"
        );
        assert!(sign_document(&xml, &creds, "c", "1", "Q?").is_ok());
    }
}
