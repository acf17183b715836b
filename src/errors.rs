//! Typed error hierarchy for NurtureFlow.
//!
//! Two top-level enums cover the two layers:
//! - `GhlError`: failures talking to the GoHighLevel API
//! - `CrmError`: domain, storage and request failures surfaced by the API

use thiserror::Error;

/// Errors from the GoHighLevel HTTP client.
///
/// Upstream bodies are carried verbatim (JSON) or as a 200-char snippet so the
/// user sees what GoHighLevel actually said.
#[derive(Debug, Error)]
pub enum GhlError {
    #[error("GoHighLevel credentials not configured")]
    MissingCredentials,

    #[error("Request to GoHighLevel failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API Error (status {status}): {body}")]
    Status { status: u16, body: String },

    #[error("Received non-JSON response (status {status}). First 200 chars: {snippet}")]
    NonJson { status: u16, snippet: String },

    #[error(
        "Received HTML response (status {status}). Check if redirect URI and credentials are properly configured."
    )]
    Html { status: u16 },

    #[error("Invalid response from GoHighLevel: missing {field}")]
    MissingField { field: &'static str },

    #[error("Unexpected response body from GoHighLevel: {0}")]
    UnexpectedBody(String),

    #[error("Invalid GoHighLevel URL: {0}")]
    InvalidUrl(String),
}

/// Errors from the CRM domain and API layer.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("Installation {id} not found")]
    InstallationNotFound { id: i64 },

    #[error("No GoHighLevel installation found")]
    NoInstallation,

    #[error("Lead {id} not found")]
    LeadNotFound { id: i64 },

    #[error("Message {id} not found")]
    MessageNotFound { id: i64 },

    #[error("Document {id} not found")]
    DocumentNotFound { id: i64 },

    #[error("Webhook event {id} not found")]
    WebhookEventNotFound { id: i64 },

    #[error("Message {id} cannot move from '{from}' to '{to}'")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("Message {id} is {status} and can no longer be edited")]
    MessageLocked { id: i64, status: String },

    #[error("Invalid OAuth state: {0}")]
    InvalidState(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Ghl(#[from] GhlError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl CrmError {
    /// Recover a `CrmError` raised inside a database closure, or wrap the
    /// failure as a database error.
    pub fn from_db(err: anyhow::Error) -> Self {
        match err.downcast::<CrmError>() {
            Ok(crm) => crm,
            Err(other) => CrmError::Database(other),
        }
    }
}
