//! The action dispatcher and the three lifecycle handlers.
//!
//! The dispatcher parses a broker payload, loads the document's rows and
//! routes to the submit, poll or cancel handler.  Unusable messages and
//! vanished rows are dropped (the caller acknowledges them — retrying is
//! pointless); handler errors propagate so the caller can reject the
//! message without requeueing.  SIFEN business rejections are neither:
//! they are ordinary state transitions persisted on the records.

use std::fmt;
use std::io::{Cursor, Write};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{info, warn};

use crate::credentials::{CredentialError, Credentials};
use crate::event::build_cancel_event;
use crate::message::{Action, ActionMessage};
use crate::queue::{PollScheduler, QueueError};
use crate::signer::{SignError, extract_cdc, sign_document};
use crate::soap::{SifenClient, TransportError, strip_xml_decl};
use crate::store::{EmissionRecord, EmissionUpdate, FiscalDocumentId, Store, StoreError};

/// Awaiting the batch poll, or transiently reprocessing.
const STATUS_SUBMITTED: &str = "900";

/// Approved, used when the response names no code of its own.
const STATUS_APPROVED_DEFAULT: &str = "0201";

/// Rejected, used when the response names no code of its own.
const STATUS_REJECTED_DEFAULT: &str = "0300";

/// Gave up polling.
const STATUS_EXHAUSTED: &str = "998";

/// Submission yielded no protocol and no code.
const STATUS_SUBMIT_ERROR: &str = "999";

/// The header code recording a completed cancellation.
const HEADER_CANCELLED: i64 = 600;

/// Event response codes that count as a completed cancellation.
const CANCEL_SUCCESS_CODES: [&str; 3] = ["0500", "0501", "0600"];

/// SIFEN's transient bad-parse mode: this code with exactly this message
/// means the batch should simply be polled again.
const TRANSIENT_MALFORMED_CODE: &str = "0160";
const TRANSIENT_MALFORMED_MSG: &str = "XML Mal Formado.";

const DESC_SUBMITTED: &str = "Enviado. Aguardando consulta de lote.";
const DESC_APPROVED: &str = "Aprobado exitosamente.";
const DESC_REPROCESSING: &str = "Reprocesando lote (XML mal formado transitorio).";
const DESC_EXHAUSTED: &str = "Excedidas las tentativas de consulta de lote.";
const DESC_CANCELLED: &str = "Nota Cancelada";

//------------ Dispatcher ----------------------------------------------------

/// Routes one broker message through its lifecycle handler.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    sifen: SifenClient,
    scheduler: Arc<dyn PollScheduler>,
    qr_base_url: String,
    max_poll_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        sifen: SifenClient,
        scheduler: Arc<dyn PollScheduler>,
        qr_base_url: String,
        max_poll_attempts: u32,
    ) -> Self {
        Self {
            store,
            sifen,
            scheduler,
            qr_base_url,
            max_poll_attempts,
        }
    }

    /// Handle one payload.
    ///
    /// `Ok` means the message is spent — progress was recorded or the
    /// message was dropped as unusable.  `Err` means the handler failed
    /// and an operator will have to republish.
    pub async fn dispatch(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let message = match ActionMessage::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping message: {err}");
                return Ok(());
            }
        };
        let id = message.id;

        let Some(emission) = self.store.load_emission(id).await? else {
            info!("document {id}: no emission row; dropping message");
            return Ok(());
        };
        if self.store.load_header(id).await?.is_none() {
            info!("document {id}: no header row; dropping message");
            return Ok(());
        }

        match message.action {
            Action::Submit => self.handle_submit(&emission).await,
            Action::Poll { attempts } => self.handle_poll(&emission, attempts).await,
            Action::Cancel { reason } => self.handle_cancel(&emission, &reason).await,
        }
    }

    //--- submit

    /// Sign, batch, submit; on success record the protocol and park the
    /// first poll.
    async fn handle_submit(&self, emission: &EmissionRecord) -> Result<(), HandlerError> {
        let id = emission.document_id;
        let credentials =
            Credentials::load(&emission.cert_path, &emission.cert_password)?;
        let signed = sign_document(
            &emission.xml_original,
            &credentials,
            &emission.csc,
            &emission.csc_id,
            &self.qr_base_url,
        )?;
        let batch = format!("<rLoteDE>{}</rLoteDE>", strip_xml_decl(&signed.xml));
        let zip_b64 = zip_base64(&batch)?;

        let response = self.sifen.submit_batch(&zip_b64, &credentials).await?;
        let protocol = response_field(&response, "dProtConsLote");

        match protocol.as_deref() {
            Some(protocol) if protocol != "0" => {
                let update = EmissionUpdate {
                    xml_signed: Some(batch),
                    xml_response: Some(response),
                    protocol: Some(protocol.to_string()),
                    status_code: Some(STATUS_SUBMITTED.to_string()),
                    status_description: Some(DESC_SUBMITTED.to_string()),
                    ..Default::default()
                };
                self.store.update_emission(id, update).await?;
                self.scheduler.schedule_poll(id, 1).await?;
                info!("document {id}: batch accepted under protocol {protocol}");
            }
            _ => {
                let msg = response_field(&response, "dMsgRes")
                    .unwrap_or_else(|| "unspecified".to_string());
                let code = response_field(&response, "dCodRes")
                    .unwrap_or_else(|| STATUS_SUBMIT_ERROR.to_string());
                let description = format!("Falha no envio: {msg}");
                self.store
                    .update_emission(
                        id,
                        EmissionUpdate::status(code.clone(), description.clone())
                            .with_response(response),
                    )
                    .await?;
                self.store
                    .update_header(id, numeric_code(&code), Some(&description))
                    .await?;
                warn!("document {id}: batch refused ({code}): {msg}");
            }
        }
        Ok(())
    }

    //--- poll

    /// Query the batch and settle it, or park another poll.
    async fn handle_poll(
        &self,
        emission: &EmissionRecord,
        attempts: u32,
    ) -> Result<(), HandlerError> {
        let id = emission.document_id;
        if emission.protocol.is_empty() {
            warn!("document {id}: poll requested without a protocol; dropping");
            return Ok(());
        }

        let credentials =
            Credentials::load(&emission.cert_path, &emission.cert_password)?;
        let response = self
            .sifen
            .query_batch(&emission.protocol, &credentials)
            .await?;

        let state = response_field(&response, "dEstRes");
        let message = response_field(&response, "dMsgResLot")
            .or_else(|| response_field(&response, "dMsgRes"));
        let code = response_field(&response, "dCodRes")
            .or_else(|| response_field(&response, "dCodResLot"));

        // Transient bad-parse mode: not a rejection, poll again.
        if code.as_deref() == Some(TRANSIENT_MALFORMED_CODE)
            && message.as_deref() == Some(TRANSIENT_MALFORMED_MSG)
        {
            if attempts < self.max_poll_attempts {
                self.store
                    .update_emission(
                        id,
                        EmissionUpdate::status(STATUS_SUBMITTED, DESC_REPROCESSING)
                            .with_response(response),
                    )
                    .await?;
                self.scheduler.schedule_poll(id, attempts + 1).await?;
                info!("document {id}: transient malformed batch, poll reparked");
            } else {
                self.store
                    .update_emission(
                        id,
                        EmissionUpdate::status(STATUS_EXHAUSTED, DESC_EXHAUSTED)
                            .with_response(response),
                    )
                    .await?;
                warn!("document {id}: gave up after {attempts} polls");
            }
            return Ok(());
        }

        let message = message.unwrap_or_default();
        if state.as_deref() == Some("Aprobado") {
            let code = code.unwrap_or_else(|| STATUS_APPROVED_DEFAULT.to_string());
            self.store
                .update_emission(
                    id,
                    EmissionUpdate::status(code.clone(), DESC_APPROVED)
                        .with_response(response),
                )
                .await?;
            self.store
                .update_header(id, numeric_code(&code), Some(DESC_APPROVED))
                .await?;
            info!("document {id}: approved ({code})");
        } else if state.as_deref() == Some("Rechazado")
            || message.contains("Cancelado")
            || message.contains("Rechazado")
        {
            let code = code.unwrap_or_else(|| STATUS_REJECTED_DEFAULT.to_string());
            let description = format!("Rechazado: {message}");
            self.store
                .update_emission(
                    id,
                    EmissionUpdate::status(code.clone(), description.clone())
                        .with_response(response),
                )
                .await?;
            self.store
                .update_header(id, numeric_code(&code), Some(&description))
                .await?;
            warn!("document {id}: rejected ({code}): {message}");
        } else if attempts < self.max_poll_attempts {
            self.scheduler.schedule_poll(id, attempts + 1).await?;
            info!("document {id}: batch still in progress, poll #{} parked", attempts + 1);
        } else {
            self.store
                .update_emission(
                    id,
                    EmissionUpdate::status(STATUS_EXHAUSTED, DESC_EXHAUSTED)
                        .with_response(response),
                )
                .await?;
            warn!("document {id}: gave up after {attempts} polls");
        }
        Ok(())
    }

    //--- cancel

    /// Build and submit the signed cancellation event.
    async fn handle_cancel(
        &self,
        emission: &EmissionRecord,
        reason: &str,
    ) -> Result<(), HandlerError> {
        let id = emission.document_id;
        let cdc = extract_cdc(&emission.xml_signed)?;
        let credentials =
            Credentials::load(&emission.cert_path, &emission.cert_password)?;
        let event_xml = build_cancel_event(&cdc, reason, &credentials)?;

        let response = self.sifen.submit_event(&event_xml, &credentials).await?;

        let code = response_field(&response, "dCodRes");
        let msg = response_field(&response, "dMsgRes")
            .unwrap_or_else(|| "unspecified".to_string());
        let state = response_field(&response, "dEstRes");

        let approved = state.as_deref() == Some("Aprobado")
            || matches!(code.as_deref(), Some(code) if CANCEL_SUCCESS_CODES.contains(&code));

        if approved {
            let code = code.unwrap_or_else(|| HEADER_CANCELLED.to_string());
            let update = EmissionUpdate {
                xml_cancel_request: Some(event_xml),
                xml_cancel_response: Some(response),
                status_code: Some(code.clone()),
                status_description: Some(DESC_CANCELLED.to_string()),
                ..Default::default()
            };
            self.store.update_emission(id, update).await?;
            self.store
                .update_header(id, Some(HEADER_CANCELLED), Some(DESC_CANCELLED))
                .await?;
            info!("document {id}: cancelled ({code})");
        } else {
            let code = code.unwrap_or_else(|| STATUS_SUBMIT_ERROR.to_string());
            let description = format!("Fallo en la cancelacion: {msg}");
            let update = EmissionUpdate {
                xml_cancel_request: Some(event_xml),
                xml_cancel_response: Some(response),
                status_code: Some(code.clone()),
                status_description: Some(description),
                ..Default::default()
            };
            self.store.update_emission(id, update).await?;
            warn!("document {id}: cancellation refused ({code}): {msg}");
        }
        Ok(())
    }
}

//------------ helpers -------------------------------------------------------

/// Read the text of the first element with the given local name, whatever
/// namespace the response put it in.
fn response_field(xml: &str, local: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    doc.descendants()
        .find(|node| node.tag_name().name() == local)
        .and_then(|node| node.text())
        .map(str::to_string)
}

/// The header stores codes numerically; `"0260"` becomes `260`.
fn numeric_code(code: &str) -> Option<i64> {
    code.trim().parse().ok()
}

/// Pack the batch into a one-entry deflate ZIP and base64 it.
fn zip_base64(xml: &str) -> Result<String, HandlerError> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer
        .start_file("documento.xml", options)
        .map_err(|err| HandlerError::Archive(err.to_string()))?;
    writer
        .write_all(xml.as_bytes())
        .map_err(|err| HandlerError::Archive(err.to_string()))?;
    let cursor = writer
        .finish()
        .map_err(|err| HandlerError::Archive(err.to_string()))?;
    Ok(BASE64.encode(cursor.into_inner()))
}

//------------ HandlerError --------------------------------------------------

/// A handler failed; the message must be rejected without requeueing.
#[derive(Clone, Debug)]
pub enum HandlerError {
    Credential(CredentialError),
    Sign(SignError),
    Transport(TransportError),
    Store(StoreError),
    Queue(QueueError),
    Archive(String),
}

impl From<CredentialError> for HandlerError {
    fn from(err: CredentialError) -> Self {
        Self::Credential(err)
    }
}

impl From<SignError> for HandlerError {
    fn from(err: SignError) -> Self {
        Self::Sign(err)
    }
}

impl From<TransportError> for HandlerError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

impl std::error::Error for HandlerError {}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential(err) => err.fmt(f),
            Self::Sign(err) => err.fmt(f),
            Self::Transport(err) => err.fmt(f),
            Self::Store(err) => err.fmt(f),
            Self::Queue(err) => err.fmt(f),
            Self::Archive(reason) => write!(f, "cannot pack the batch archive: {reason}"),
        }
    }
}
