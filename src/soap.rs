//! SOAP exchanges with SIFEN.
//!
//! One transport primitive does all the work: POST a SOAP 1.2 envelope
//! over mutually-authenticated TLS and hand back the response text.
//! SIFEN answers business rejections with non-2xx statuses whose bodies
//! are still well-formed SOAP, so a failing status with an XML body is
//! returned to the caller for classification instead of being raised.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::{CredentialError, Credentials};
use crate::signer::SIFEN_NS;

/// HTTP exchanges that outlive this have stalled; expiry surfaces as a
/// handler failure.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

//------------ SoapTransport -------------------------------------------------

/// The wire seam: POST a SOAP body, get the response text back.
#[async_trait]
pub trait SoapTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: String,
        credentials: &Credentials,
    ) -> Result<String, TransportError>;
}

//------------ HttpTransport -------------------------------------------------

/// The production transport over reqwest.
///
/// A client is built per call so each exchange authenticates with the
/// document's own certificate; the identity is assembled in memory and no
/// key material ever reaches the filesystem.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport;

#[async_trait]
impl SoapTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: String,
        credentials: &Credentials,
    ) -> Result<String, TransportError> {
        let identity = reqwest::Identity::from_pem(&credentials.identity_pem()?)
            .map_err(|err| TransportError::Client(err.to_string()))?;
        let client = reqwest::Client::builder()
            .identity(identity)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Client(err.to_string()))?;

        let response = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;

        if status.is_success() || looks_like_xml(&text) {
            Ok(text)
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                body: truncate(&text, 256),
            })
        }
    }
}

/// Whether a response body plausibly carries a SOAP document.
fn looks_like_xml(body: &str) -> bool {
    let body = body.trim_start();
    body.starts_with("<?xml")
        || body.starts_with("<env:Envelope")
        || body.starts_with("<soap:Envelope")
        || body.starts_with("<Envelope")
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

//------------ SifenClient ---------------------------------------------------

/// The three SIFEN endpoints the lifecycle talks to.
#[derive(Clone, Debug)]
pub struct SifenUrls {
    pub submit_batch: String,
    pub query_batch: String,
    pub submit_event: String,
}

/// Wraps payloads into the SIFEN SOAP vocabulary and exchanges them.
pub struct SifenClient {
    transport: std::sync::Arc<dyn SoapTransport>,
    urls: SifenUrls,
}

impl SifenClient {
    pub fn new(transport: std::sync::Arc<dyn SoapTransport>, urls: SifenUrls) -> Self {
        Self { transport, urls }
    }

    /// Submit a base64 ZIP batch.
    pub async fn submit_batch(
        &self,
        zip_b64: &str,
        credentials: &Credentials,
    ) -> Result<String, TransportError> {
        let body = envelope(&format!(
            "<rEnvioLote xmlns=\"{SIFEN_NS}\"><dId>{}</dId>\
             <xDE>{zip_b64}</xDE></rEnvioLote>",
            correlation_id()
        ));
        self.transport
            .post(&self.urls.submit_batch, body, credentials)
            .await
    }

    /// Query the state of a previously submitted batch.
    pub async fn query_batch(
        &self,
        protocol: &str,
        credentials: &Credentials,
    ) -> Result<String, TransportError> {
        let body = envelope(&format!(
            "<rEnviConsLoteDe xmlns=\"{SIFEN_NS}\"><dId>{}</dId>\
             <dProtConsLote>{protocol}</dProtConsLote></rEnviConsLoteDe>",
            correlation_id()
        ));
        self.transport
            .post(&self.urls.query_batch, body, credentials)
            .await
    }

    /// Submit a signed event fragment.
    pub async fn submit_event(
        &self,
        event_xml: &str,
        credentials: &Credentials,
    ) -> Result<String, TransportError> {
        let body = envelope(&format!(
            "<rEnviEventoDe xmlns=\"{SIFEN_NS}\"><dId>{}</dId>\
             <dEvReg>{}</dEvReg></rEnviEventoDe>",
            correlation_id(),
            strip_xml_decl(event_xml),
        ));
        self.transport
            .post(&self.urls.submit_event, body, credentials)
            .await
    }
}

fn envelope(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <soap:Envelope xmlns:soap=\"{SOAP_ENV_NS}\">\
         <soap:Header/><soap:Body>{body}</soap:Body></soap:Envelope>"
    )
}

/// Milliseconds since the epoch; SIFEN echoes it back for correlation.
fn correlation_id() -> i64 {
    jiff::Timestamp::now().as_millisecond()
}

/// Drop a leading XML declaration, if any.
pub fn strip_xml_decl(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    match trimmed.strip_prefix("<?xml") {
        Some(rest) => match rest.split_once("?>") {
            Some((_, tail)) => tail.trim_start(),
            None => trimmed,
        },
        None => trimmed,
    }
}

//------------ TransportError ------------------------------------------------

/// An exchange failed without a response worth classifying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The TLS identity or client could not be assembled.
    Client(String),

    /// The request itself failed (connect, TLS handshake, timeout).
    Http(String),

    /// A failing status whose body is not XML.
    Status { status: u16, body: String },
}

impl From<CredentialError> for TransportError {
    fn from(err: CredentialError) -> Self {
        Self::Client(err.to_string())
    }
}

impl std::error::Error for TransportError {}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(reason) => write!(f, "cannot build SOAP client: {reason}"),
            Self::Http(reason) => write!(f, "SOAP request failed: {reason}"),
            Self::Status { status, body } => {
                write!(f, "SIFEN answered HTTP {status} without a SOAP body: {body}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_soap_12() {
        let env = envelope("<x/>");
        assert!(env.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(env.contains(&format!("xmlns:soap=\"{SOAP_ENV_NS}\"")));
        assert!(env.contains("<soap:Body><x/></soap:Body>"));
    }

    #[test]
    fn xml_bodies_are_recognized() {
        assert!(looks_like_xml("<?xml version=\"1.0\"?><a/>"));
        assert!(looks_like_xml("  <env:Envelope>"));
        assert!(looks_like_xml("<soap:Envelope>"));
        assert!(looks_like_xml("<Envelope>"));
        assert!(!looks_like_xml("502 Bad Gateway"));
        assert!(!looks_like_xml("<html><body>error</body></html>"));
    }

    #[test]
    fn declaration_stripping() {
        assert_eq!(
            strip_xml_decl("<?xml version=\"1.0\" encoding=\"UTF-8\"?><gGroupGesEve/>"),
            "<gGroupGesEve/>"
        );
        assert_eq!(strip_xml_decl("<gGroupGesEve/>"), "<gGroupGesEve/>");
        assert_eq!(strip_xml_decl("  <?xml version=\"1.0\"?>\n<a/>"), "<a/>");
    }
}
