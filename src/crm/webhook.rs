use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::db::{DbHandle, NurtureDb};
use super::ghl::GhlContact;
use super::models::{Installation, WebhookEvent};
use crate::errors::CrmError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-ghl-signature";

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid HMAC key: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check `signature` (hex, optionally `sha256=`-prefixed) against the raw
/// body. The comparison is constant-time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// What a webhook asks us to do with our lead data.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAction {
    UpsertContact,
    DeleteContact,
    /// Opportunity events are stored for audit only.
    RecordOnly,
    Unhandled,
}

/// The event name, from `event` or (older payloads) `type`.
pub fn event_type(payload: &Value) -> String {
    payload
        .get("event")
        .or_else(|| payload.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

pub fn classify(payload: &Value) -> WebhookAction {
    let event = event_type(payload);
    match event.as_str() {
        "contact.created" | "contact.updated" | "ContactCreate" | "ContactUpdate" => {
            WebhookAction::UpsertContact
        }
        "contact" if payload.get("contact").is_some_and(Value::is_object) => {
            WebhookAction::UpsertContact
        }
        "contact.deleted" | "ContactDelete" => WebhookAction::DeleteContact,
        e if e.starts_with("opportunity.") || e.starts_with("Opportunity") => {
            WebhookAction::RecordOnly
        }
        _ => WebhookAction::Unhandled,
    }
}

/// Pull the contact out of a payload. GoHighLevel has sent it as a
/// `contact` object, as `data`, and as top-level fields.
pub fn extract_contact(payload: &Value) -> Option<GhlContact> {
    let contact_id = payload.get("contactId").and_then(Value::as_str);
    let candidates = [payload.get("contact"), payload.get("data"), Some(payload)];
    for candidate in candidates.into_iter().flatten() {
        let Some(obj) = candidate.as_object() else {
            continue;
        };
        let mut obj = obj.clone();
        if !obj.get("id").is_some_and(Value::is_string) {
            match contact_id {
                Some(id) => {
                    obj.insert("id".to_string(), Value::String(id.to_string()));
                }
                None => continue,
            }
        }
        if let Ok(contact) = serde_json::from_value::<GhlContact>(Value::Object(obj)) {
            if !contact.id.is_empty() {
                return Some(contact);
            }
        }
    }
    None
}

fn contact_id_of(payload: &Value) -> Option<String> {
    payload
        .get("contactId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| extract_contact(payload).map(|c| c.id))
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub event_id: i64,
    pub event_type: String,
    pub installation_id: Option<i64>,
    pub processed: bool,
    pub processing_error: Option<String>,
}

/// Verifies, records and applies GoHighLevel webhooks.
#[derive(Clone)]
pub struct WebhookProcessor {
    db: DbHandle,
    secret: Option<String>,
}

impl WebhookProcessor {
    pub fn new(db: DbHandle, secret: Option<String>) -> Self {
        Self {
            db,
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Signatures are checked only when a secret is configured and the
    /// request carries the header.
    pub fn verify(&self, signature: Option<&str>, body: &[u8]) -> Result<(), CrmError> {
        match (&self.secret, signature) {
            (Some(secret), Some(sig)) => {
                if verify_signature(secret, body, sig) {
                    Ok(())
                } else {
                    warn!("Webhook signature mismatch");
                    Err(CrmError::InvalidSignature)
                }
            }
            (Some(_), None) => {
                debug!("Webhook arrived without a signature header");
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    /// Parse, audit and apply one webhook body. Only malformed input is an
    /// error; a failed lead mutation is stored on the event row instead.
    pub async fn ingest(&self, body: &[u8]) -> Result<IngestOutcome, CrmError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| CrmError::BadRequest(format!("Invalid JSON payload: {}", e)))?;
        if !payload.is_object() {
            return Err(CrmError::BadRequest(
                "Webhook payload must be a JSON object".to_string(),
            ));
        }
        let location_id = payload
            .get("locationId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CrmError::BadRequest("Missing locationId".to_string()))?;
        let company_id = payload
            .get("companyId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let event = event_type(&payload);
        info!(event = %event, location_id = %location_id, "Webhook received");

        let outcome = self
            .db
            .call(move |db| {
                let installation = resolve_installation(db, company_id.as_deref(), &location_id)?;
                let installation_id = installation.as_ref().map(|i| i.id);
                let row = db.insert_webhook_event(installation_id, &event, &payload)?;
                let (processed, processing_error) =
                    settle(db, row.id, installation.as_ref(), &payload)?;
                Ok(IngestOutcome {
                    event_id: row.id,
                    event_type: event,
                    installation_id,
                    processed,
                    processing_error,
                })
            })
            .await
            .map_err(CrmError::from_db)?;

        match &outcome.processing_error {
            Some(err) => warn!(event_id = outcome.event_id, error = %err, "Webhook processing failed"),
            None => debug!(event_id = outcome.event_id, processed = outcome.processed, "Webhook stored"),
        }
        Ok(outcome)
    }

    /// Re-run the lead mutation for a stored event.
    pub async fn replay(&self, event_id: i64) -> Result<WebhookEvent, CrmError> {
        self.db
            .call(move |db| {
                let event = db
                    .get_webhook_event(event_id)?
                    .ok_or(CrmError::WebhookEventNotFound { id: event_id })?;
                let installation = match event.installation_id {
                    Some(id) => db.get_installation(id)?,
                    None => {
                        let location = event.payload.get("locationId").and_then(Value::as_str);
                        let company = event.payload.get("companyId").and_then(Value::as_str);
                        match location {
                            Some(loc) => resolve_installation(db, company, loc)?,
                            None => None,
                        }
                    }
                };
                settle(db, event.id, installation.as_ref(), &event.payload)?;
                db.get_webhook_event(event.id)?
                    .ok_or_else(|| CrmError::WebhookEventNotFound { id: event_id }.into())
            })
            .await
            .map_err(CrmError::from_db)
    }
}

/// Installation for (company, location), falling back to location alone.
fn resolve_installation(
    db: &NurtureDb,
    company_id: Option<&str>,
    location_id: &str,
) -> anyhow::Result<Option<Installation>> {
    if let Some(company) = company_id.filter(|c| !c.is_empty()) {
        if let Some(found) = db.find_installation(company, location_id)? {
            return Ok(Some(found));
        }
    }
    db.find_installation_by_location(location_id)
}

/// Apply the event and record the result on its row. Returns
/// `(processed, processing_error)`.
fn settle(
    db: &NurtureDb,
    event_id: i64,
    installation: Option<&Installation>,
    payload: &Value,
) -> anyhow::Result<(bool, Option<String>)> {
    match apply(db, installation, payload) {
        Ok(true) => {
            db.mark_webhook_processed(event_id)?;
            Ok((true, None))
        }
        Ok(false) => Ok((false, None)),
        Err(message) => {
            db.mark_webhook_failed(event_id, &message)?;
            Ok((false, Some(message)))
        }
    }
}

/// `Ok(true)` when the event was handled, `Ok(false)` when there was
/// nothing to do, `Err` with a message when a lead mutation failed.
fn apply(db: &NurtureDb, installation: Option<&Installation>, payload: &Value) -> Result<bool, String> {
    let action = classify(payload);
    let needs_installation = matches!(
        action,
        WebhookAction::UpsertContact | WebhookAction::DeleteContact
    );
    let installation = match (installation, needs_installation) {
        (Some(i), _) => i,
        (None, false) => return Ok(action == WebhookAction::RecordOnly),
        (None, true) => {
            let location = payload
                .get("locationId")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(format!("No installation found for location {}", location));
        }
    };

    match action {
        WebhookAction::UpsertContact => {
            let contact = extract_contact(payload)
                .ok_or_else(|| "Contact event has no contact id".to_string())?;
            db.upsert_lead(&contact.to_lead_upsert(installation.id))
                .map_err(|e| format!("Failed to upsert lead: {:#}", e))?;
            Ok(true)
        }
        WebhookAction::DeleteContact => {
            let contact_id =
                contact_id_of(payload).ok_or_else(|| "Delete event has no contact id".to_string())?;
            db.delete_lead_by_contact(installation.id, &contact_id)
                .map_err(|e| format!("Failed to delete lead: {:#}", e))?;
            Ok(true)
        }
        WebhookAction::RecordOnly => Ok(true),
        WebhookAction::Unhandled => Ok(false),
    }
}
