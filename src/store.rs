//! The gateway to the relational document store.
//!
//! Two tables hold everything the lifecycle touches: `tb_de_emissao`, the
//! working state of an emission attempt, and `tb_de_documento`, the
//! external-facing status record.  Both are keyed by the fiscal document
//! id; when several emission rows share an id, the newest one (largest
//! primary key) wins.  Updates are single-row, field-level overwrites, so
//! re-running a handler after a crash re-writes the same values.

use std::fmt;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};

/// The opaque identifier of a business document.
pub type FiscalDocumentId = i64;

//------------ EmissionRecord ------------------------------------------------

/// The working state of one emission attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmissionRecord {
    /// Primary key of the row itself.
    pub row_id: i64,

    pub document_id: FiscalDocumentId,

    /// The unsigned document, as supplied upstream.
    pub xml_original: String,

    /// The signed document wrapped in its batch envelope; written on
    /// submission.
    pub xml_signed: String,

    /// The most recent raw SIFEN response.
    pub xml_response: String,

    pub xml_cancel_request: String,
    pub xml_cancel_response: String,

    /// The batch receipt SIFEN issued on submission.
    pub protocol: String,

    pub status_code: String,
    pub status_description: String,

    /// PKCS#12 bundle location and passphrase.
    pub cert_path: String,
    pub cert_password: String,

    /// QR sealing secret and its identifier.
    pub csc: String,
    pub csc_id: String,

    pub document_type: Option<i32>,
}

//------------ DocumentHeader ------------------------------------------------

/// The external-facing status record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DocumentHeader {
    pub document_id: FiscalDocumentId,
    pub status_code: Option<i64>,
    pub status_description: Option<String>,
}

//------------ EmissionUpdate ------------------------------------------------

/// A field-level patch for an emission row.  Unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmissionUpdate {
    pub xml_signed: Option<String>,
    pub xml_response: Option<String>,
    pub xml_cancel_request: Option<String>,
    pub xml_cancel_response: Option<String>,
    pub protocol: Option<String>,
    pub status_code: Option<String>,
    pub status_description: Option<String>,
}

impl EmissionUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn status(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status_code: Some(code.into()),
            status_description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn with_response(mut self, xml: impl Into<String>) -> Self {
        self.xml_response = Some(xml.into());
        self
    }
}

//------------ Store ---------------------------------------------------------

/// The persistence seam the dispatcher and handlers write through.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_emission(
        &self,
        id: FiscalDocumentId,
    ) -> Result<Option<EmissionRecord>, StoreError>;

    async fn load_header(
        &self,
        id: FiscalDocumentId,
    ) -> Result<Option<DocumentHeader>, StoreError>;

    async fn update_emission(
        &self,
        id: FiscalDocumentId,
        update: EmissionUpdate,
    ) -> Result<(), StoreError>;

    async fn update_header(
        &self,
        id: FiscalDocumentId,
        code: Option<i64>,
        description: Option<&str>,
    ) -> Result<(), StoreError>;
}

//------------ SqlStore ------------------------------------------------------

/// The shipped [`Store`] over a SQL pool.
#[derive(Clone, Debug)]
pub struct SqlStore {
    pool: PgPool,
}

impl SqlStore {
    /// Connect with a single pooled connection, matching the
    /// one-connection-per-process model.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Connect(err.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn load_emission(
        &self,
        id: FiscalDocumentId,
    ) -> Result<Option<EmissionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, id_docfis, xml, xml_retorno, cod_status, desc_status, \
                    caminho_certificado, senha, id_csc, csc, protocolo, \
                    xml_assinado, xml_cancelamento_envio, xml_cancelamento_retorno, \
                    tipo_docto \
             FROM tb_de_emissao WHERE id_docfis = $1 \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let text = |name: &str| -> Result<String, StoreError> {
            row.try_get::<Option<String>, _>(name)
                .map(Option::unwrap_or_default)
                .map_err(|err| StoreError::Query(err.to_string()))
        };

        Ok(Some(EmissionRecord {
            row_id: row
                .try_get("id")
                .map_err(|err| StoreError::Query(err.to_string()))?,
            document_id: id,
            xml_original: text("xml")?,
            xml_signed: text("xml_assinado")?,
            xml_response: text("xml_retorno")?,
            xml_cancel_request: text("xml_cancelamento_envio")?,
            xml_cancel_response: text("xml_cancelamento_retorno")?,
            protocol: text("protocolo")?,
            status_code: text("cod_status")?,
            status_description: text("desc_status")?,
            cert_path: text("caminho_certificado")?,
            cert_password: text("senha")?,
            csc: text("csc")?,
            csc_id: text("id_csc")?,
            document_type: row
                .try_get("tipo_docto")
                .map_err(|err| StoreError::Query(err.to_string()))?,
        }))
    }

    async fn load_header(
        &self,
        id: FiscalDocumentId,
    ) -> Result<Option<DocumentHeader>, StoreError> {
        let row = sqlx::query(
            "SELECT id_doc, cod_status, desc_status \
             FROM tb_de_documento WHERE id_doc = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(DocumentHeader {
            document_id: id,
            status_code: row
                .try_get("cod_status")
                .map_err(|err| StoreError::Query(err.to_string()))?,
            status_description: row
                .try_get("desc_status")
                .map_err(|err| StoreError::Query(err.to_string()))?,
        }))
    }

    async fn update_emission(
        &self,
        id: FiscalDocumentId,
        update: EmissionUpdate,
    ) -> Result<(), StoreError> {
        if update.is_empty() {
            return Ok(());
        }

        // Assemble the SET list from whichever fields the patch carries,
        // mapped onto the legacy column names.
        let mut builder = QueryBuilder::new("UPDATE tb_de_emissao SET ");
        let mut set = builder.separated(", ");
        let columns = [
            ("xml_assinado", &update.xml_signed),
            ("xml_retorno", &update.xml_response),
            ("xml_cancelamento_envio", &update.xml_cancel_request),
            ("xml_cancelamento_retorno", &update.xml_cancel_response),
            ("protocolo", &update.protocol),
            ("cod_status", &update.status_code),
            ("desc_status", &update.status_description),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                set.push(format!("{column} = "));
                set.push_bind_unseparated(value.clone());
            }
        }
        builder.push(" WHERE id_docfis = ");
        builder.push_bind(id);

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Query(err.to_string()))?;
        Ok(())
    }

    async fn update_header(
        &self,
        id: FiscalDocumentId,
        code: Option<i64>,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        if code.is_none() && description.is_none() {
            return Ok(());
        }

        let mut builder = QueryBuilder::new("UPDATE tb_de_documento SET ");
        let mut set = builder.separated(", ");
        if let Some(code) = code {
            set.push("cod_status = ");
            set.push_bind_unseparated(code);
        }
        if let Some(description) = description {
            set.push("desc_status = ");
            set.push_bind_unseparated(description.to_string());
        }
        builder.push(" WHERE id_doc = ");
        builder.push_bind(id);

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Query(err.to_string()))?;
        Ok(())
    }
}

//------------ StoreError ----------------------------------------------------

/// The store could not be reached or a statement failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    Connect(String),
    Query(String),
}

impl std::error::Error for StoreError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(reason) => write!(f, "cannot reach the document store: {reason}"),
            Self::Query(reason) => write!(f, "document store query failed: {reason}"),
        }
    }
}
