//! Building signed cancellation events.
//!
//! A cancellation is submitted as a `gGroupGesEve` fragment shaped after
//! the event reception WSDL: the signed `rEve` describes the event, and
//! its detached `Signature` sits beside it under `rGesEve`.  Per SIFEN
//! correction 0141 the signed element carries the fixed id `1` and the
//! signature reference points at `#1`, not at the document's control
//! code; the control code travels inside `rGeVeCan`.

use crate::credentials::Credentials;
use crate::signer::{
    SIFEN_NS, SIFEN_VERSION, SignError, XSI_NS, build_signature, digest_subtree,
    signing_timestamp,
};
use crate::xml::Element;

const SCHEMA_LOCATION: &str =
    "http://ekuatia.set.gov.py/sifen/xsd siRecepEvento_v150.xsd";

/// Build the signed cancellation event for one document.
///
/// The output is an XML fragment without a declaration, ready to be
/// embedded into the event submission envelope.
pub fn build_cancel_event(
    cdc: &str,
    reason: &str,
    credentials: &Credentials,
) -> Result<String, SignError> {
    // Namespace declarations are placed before signing and never touched
    // afterwards; re-declaring them while re-parenting would break the
    // digest.
    let reve = Element::new("rEve")
        .with_attr("Id", "1")
        .with_attr("xmlns", SIFEN_NS)
        .with_attr("xmlns:xsi", XSI_NS)
        .with_child(Element::new("dFecFirma").with_text(signing_timestamp()))
        .with_child(Element::new("dVerFor").with_text(SIFEN_VERSION))
        .with_child(
            Element::new("gGroupTiEvt").with_child(
                Element::new("rGeVeCan")
                    .with_child(Element::new("Id").with_text(cdc))
                    .with_child(Element::new("mOtEve").with_text(reason)),
            ),
        );

    let digest_b64 = digest_subtree(&reve, "rEve")?;
    let signature = build_signature(&digest_b64, "#1", credentials)?;

    let fragment = wrapper("gGroupGesEve")
        .with_child(wrapper("rGesEve").with_child(reve).with_child(signature));
    Ok(fragment.serialize(false))
}

fn wrapper(name: &str) -> Element {
    Element::new(name)
        .with_attr("xmlns", SIFEN_NS)
        .with_attr("xmlns:xsi", XSI_NS)
        .with_attr("xsi:schemaLocation", SCHEMA_LOCATION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::test_bundle;
    use crate::signer::scoped_subtree;
    use crate::xml::parse;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use openssl::hash::MessageDigest;
    use openssl::sign::Verifier;

    const CDC: &str = "01800695631001001000000612021112917595714694";

    fn credentials() -> Credentials {
        Credentials::from_der(&test_bundle("segredo"), "segredo").unwrap()
    }

    #[test]
    fn event_shape() {
        let creds = credentials();
        let xml = build_cancel_event(CDC, "Duplicado en sistema", &creds).unwrap();

        // A fragment, not a document.
        assert!(xml.starts_with("<gGroupGesEve "));
        assert!(xml.contains(&format!("xsi:schemaLocation=\"{SCHEMA_LOCATION}\"")));

        let doc = parse(&xml).unwrap();
        let rgeseve = doc.find("rGesEve").unwrap();
        let children: Vec<&str> =
            rgeseve.child_elements().map(|el| el.local_name()).collect();
        assert_eq!(children, ["rEve", "Signature"]);

        let reve = doc.find("rEve").unwrap();
        assert_eq!(reve.attr("Id"), Some("1"));
        let order: Vec<&str> = reve.child_elements().map(|el| el.local_name()).collect();
        assert_eq!(order, ["dFecFirma", "dVerFor", "gGroupTiEvt"]);

        let cancel = doc.find("rGeVeCan").unwrap();
        assert_eq!(cancel.find("Id").unwrap().text().as_deref(), Some(CDC));
        assert_eq!(
            cancel.find("mOtEve").unwrap().text().as_deref(),
            Some("Duplicado en sistema")
        );

        // The reference points at the fixed event id, not the CDC.
        assert_eq!(doc.find("Reference").unwrap().attr("URI"), Some("#1"));
    }

    #[test]
    fn event_signature_verifies() {
        let creds = credentials();
        let xml = build_cancel_event(CDC, "Duplicado en sistema", &creds).unwrap();
        let doc = parse(&xml).unwrap();

        // Digest covers the canonical rEve subtree.
        let recomputed = digest_subtree(doc.find("rGesEve").unwrap(), "rEve").unwrap();
        let recorded = doc.find("DigestValue").unwrap().text().unwrap();
        assert_eq!(recomputed, recorded);

        // And the signature value covers the canonical SignedInfo.
        let si = scoped_subtree(&doc, "SignedInfo").unwrap();
        let signature = BASE64
            .decode(doc.find("SignatureValue").unwrap().text().unwrap())
            .unwrap();
        let public = creds.certificate().public_key().unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public).unwrap();
        verifier.update(si.canonical().as_bytes()).unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }
}
