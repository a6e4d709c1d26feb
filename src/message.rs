//! Action messages carried by the broker.
//!
//! The wire format is a small JSON object: `id_fatura` names the fiscal
//! document, `acao` selects the action, `tentativas` carries the poll
//! attempt counter, and `motivo` holds a cancellation reason.  A missing
//! `acao` means submission, because the original publishing application
//! sends bare `{"id_fatura": N}` messages for that case.

use std::fmt;

use serde::Deserialize;

use crate::store::FiscalDocumentId;

/// A cancellation reason must carry at least this many characters.
pub const MIN_REASON_LEN: usize = 5;

//------------ ActionMessage -------------------------------------------------

/// A parsed broker message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionMessage {
    pub id: FiscalDocumentId,
    pub action: Action,
}

/// The requested lifecycle action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Sign and submit the document batch.
    Submit,

    /// Query the batch state; `attempts` counts this poll in its chain.
    Poll { attempts: u32 },

    /// Cancel an approved document.
    Cancel { reason: String },
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id_fatura: Option<FiscalDocumentId>,
    #[serde(default)]
    acao: Option<String>,
    #[serde(default)]
    tentativas: Option<u32>,
    #[serde(default)]
    motivo: Option<String>,
}

impl ActionMessage {
    /// Parse a broker payload.
    ///
    /// Anything that fails here is not retryable and the caller drops the
    /// message.
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let raw: RawMessage = serde_json::from_slice(payload)
            .map_err(|err| MessageError::Json(err.to_string()))?;
        let id = raw.id_fatura.ok_or(MessageError::MissingId)?;

        let action = match raw.acao.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("enviar") => Action::Submit,
            Some("consultar") => Action::Poll {
                attempts: raw.tentativas.unwrap_or(1).max(1),
            },
            Some("cancelar") => {
                let reason = raw.motivo.unwrap_or_default();
                if reason.trim().chars().count() < MIN_REASON_LEN {
                    return Err(MessageError::ShortReason);
                }
                Action::Cancel { reason }
            }
            Some(other) => return Err(MessageError::UnknownAction(other.to_string())),
        };

        Ok(Self { id, action })
    }
}

//------------ MessageError --------------------------------------------------

/// A broker payload that cannot be acted upon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageError {
    /// The payload is not the expected JSON.
    Json(String),

    /// No document id.
    MissingId,

    /// An action this worker does not know.
    UnknownAction(String),

    /// A cancellation without a usable reason.
    ShortReason,
}

impl std::error::Error for MessageError {}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(reason) => write!(f, "unreadable message: {reason}"),
            Self::MissingId => f.write_str("message carries no document id"),
            Self::UnknownAction(action) => write!(f, "unknown action '{action}'"),
            Self::ShortReason => write!(
                f,
                "cancellation reason shorter than {MIN_REASON_LEN} characters"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_id_means_submit() {
        let msg = ActionMessage::parse(br#"{"id_fatura": 7}"#).unwrap();
        assert_eq!(msg.id, 7);
        assert_eq!(msg.action, Action::Submit);
    }

    #[test]
    fn action_is_case_insensitive() {
        let msg =
            ActionMessage::parse(br#"{"id_fatura": 7, "acao": "ENVIAR"}"#).unwrap();
        assert_eq!(msg.action, Action::Submit);

        let msg = ActionMessage::parse(
            br#"{"id_fatura": 7, "acao": "Consultar", "tentativas": 3}"#,
        )
        .unwrap();
        assert_eq!(msg.action, Action::Poll { attempts: 3 });
    }

    #[test]
    fn poll_defaults_to_first_attempt() {
        let msg =
            ActionMessage::parse(br#"{"id_fatura": 7, "acao": "consultar"}"#).unwrap();
        assert_eq!(msg.action, Action::Poll { attempts: 1 });
    }

    #[test]
    fn cancel_requires_a_reason() {
        let msg = ActionMessage::parse(
            br#"{"id_fatura": 7, "acao": "cancelar", "motivo": "Duplicado en sistema"}"#,
        )
        .unwrap();
        assert_eq!(
            msg.action,
            Action::Cancel {
                reason: "Duplicado en sistema".to_string()
            }
        );

        let err = ActionMessage::parse(
            br#"{"id_fatura": 7, "acao": "cancelar", "motivo": "foo"}"#,
        )
        .unwrap_err();
        assert_eq!(err, MessageError::ShortReason);

        let err =
            ActionMessage::parse(br#"{"id_fatura": 7, "acao": "cancelar"}"#).unwrap_err();
        assert_eq!(err, MessageError::ShortReason);
    }

    #[test]
    fn junk_is_rejected() {
        assert!(matches!(
            ActionMessage::parse(b"not json"),
            Err(MessageError::Json(_))
        ));
        assert_eq!(
            ActionMessage::parse(br#"{"acao": "enviar"}"#).unwrap_err(),
            MessageError::MissingId
        );
        assert_eq!(
            ActionMessage::parse(br#"{"id_fatura": 7, "acao": "foobar"}"#).unwrap_err(),
            MessageError::UnknownAction("foobar".to_string())
        );
    }
}
