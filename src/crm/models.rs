use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Installations ─────────────────────────────────────────────────────

/// One GoHighLevel location connection. Tokens never leave the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub location_id: String,
    pub company_id: String,
    pub location_name: Option<String>,
    pub company_name: Option<String>,
    #[serde(skip_serializing, default)]
    pub access_token: String,
    #[serde(skip_serializing, default)]
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values written by an OAuth callback upsert.
#[derive(Debug, Clone)]
pub struct NewInstallation {
    pub location_id: String,
    pub company_id: String,
    pub location_name: Option<String>,
    pub company_name: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub state: String,
    pub location_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Leads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Converted,
    Lost,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::Converted => "converted",
            Self::Lost => "lost",
        }
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "contacted" => Ok(Self::Contacted),
            "qualified" => Ok(Self::Qualified),
            "converted" => Ok(Self::Converted),
            "lost" => Ok(Self::Lost),
            _ => Err(format!("Invalid lead status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub installation_id: i64,
    pub ghl_contact_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: LeadStatus,
    pub tags: Vec<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn display_name(&self) -> String {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        if name.is_empty() {
            self.email.clone().unwrap_or_else(|| self.ghl_contact_id.clone())
        } else {
            name.to_string()
        }
    }
}

/// Contact data merged into a lead keyed by (installation, contact id).
/// `None` fields keep whatever the stored lead already has.
#[derive(Debug, Clone, Default)]
pub struct LeadUpsert {
    pub installation_id: i64,
    pub ghl_contact_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tags: Option<Vec<String>>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct LeadUpdate {
    pub status: Option<LeadStatus>,
    pub tags: Option<Vec<String>>,
    pub last_activity: Option<DateTime<Utc>>,
}

// ── Messages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Approved,
    Rejected,
    Scheduled,
    Sent,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Scheduled => "scheduled",
            Self::Sent => "sent",
        }
    }

    /// States from which a move into `self` is accepted. Each target lists
    /// itself, so repeating a transition leaves the same end state.
    pub fn allowed_sources(&self) -> &'static [MessageStatus] {
        use MessageStatus::*;
        match self {
            Pending => &[],
            Approved => &[Pending, Approved],
            Rejected => &[Pending, Rejected],
            Scheduled => &[Pending, Scheduled],
            Sent => &[Approved, Scheduled, Sent],
        }
    }

    pub fn can_transition_from(&self, from: MessageStatus) -> bool {
        self.allowed_sources().contains(&from)
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "scheduled" => Ok(Self::Scheduled),
            "sent" => Ok(Self::Sent),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub lead_id: i64,
    pub content: String,
    pub status: MessageStatus,
    pub approval_needed: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageWithLead {
    #[serde(flatten)]
    pub message: Message,
    pub lead: Lead,
}

// ── Knowledge base ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Complete,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid document status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: i64,
    pub installation_id: i64,
    pub title: String,
    pub content: String,
    pub source: Option<String>,
    pub file_url: Option<String>,
    pub file_type: Option<String>,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    pub installation_id: i64,
    pub title: Option<String>,
    pub content: String,
    pub source: Option<String>,
    pub file_url: Option<String>,
    pub file_type: Option<String>,
}

/// A contiguous slice of a document's text. Offsets count chars, not bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_index: i64,
    pub start: i64,
    pub end: i64,
    pub content: String,
}

// ── Webhook & billing events ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub installation_id: Option<i64>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: i64,
    pub installation_id: i64,
    pub event_type: String,
    pub credits_used: i64,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ── API view types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<NamedRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<NamedRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            location: None,
            company: None,
            last_connected: None,
        }
    }

    pub fn from_installation(installation: &Installation) -> Self {
        Self {
            connected: true,
            location: Some(NamedRef {
                id: installation.location_id.clone(),
                name: installation
                    .location_name
                    .clone()
                    .unwrap_or_else(|| "Unknown Location".to_string()),
            }),
            company: Some(NamedRef {
                id: installation.company_id.clone(),
                name: installation
                    .company_name
                    .clone()
                    .unwrap_or_else(|| "Unknown Company".to_string()),
            }),
            last_connected: Some(installation.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub installation_count: i64,
    pub lead_count: i64,
    pub tables: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_status_roundtrip_str() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Approved,
            MessageStatus::Rejected,
            MessageStatus::Scheduled,
            MessageStatus::Sent,
        ] {
            assert_eq!(MessageStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(MessageStatus::from_str("archived").is_err());
    }

    #[test]
    fn test_pending_moves_to_review_outcomes() {
        for to in [
            MessageStatus::Approved,
            MessageStatus::Rejected,
            MessageStatus::Scheduled,
        ] {
            assert!(to.can_transition_from(MessageStatus::Pending));
            // Repeating the same transition is accepted
            assert!(to.can_transition_from(to));
        }
    }

    #[test]
    fn test_decided_messages_cannot_flip() {
        assert!(!MessageStatus::Approved.can_transition_from(MessageStatus::Rejected));
        assert!(!MessageStatus::Rejected.can_transition_from(MessageStatus::Approved));
        assert!(!MessageStatus::Scheduled.can_transition_from(MessageStatus::Sent));
        assert!(!MessageStatus::Pending.can_transition_from(MessageStatus::Approved));
    }

    #[test]
    fn test_sent_requires_approval_or_schedule() {
        assert!(MessageStatus::Sent.can_transition_from(MessageStatus::Approved));
        assert!(MessageStatus::Sent.can_transition_from(MessageStatus::Scheduled));
        assert!(!MessageStatus::Sent.can_transition_from(MessageStatus::Pending));
        assert!(!MessageStatus::Sent.can_transition_from(MessageStatus::Rejected));
    }

    #[test]
    fn test_lead_status_serde() {
        let json = serde_json::to_string(&LeadStatus::Qualified).unwrap();
        assert_eq!(json, "\"qualified\"");
        assert_eq!(LeadStatus::from_str("lost").unwrap(), LeadStatus::Lost);
        assert!(LeadStatus::from_str("LOST").is_err());
    }

    #[test]
    fn test_installation_serialization_hides_tokens() {
        let now = Utc::now();
        let inst = Installation {
            id: 1,
            location_id: "loc".into(),
            company_id: "comp".into(),
            location_name: None,
            company_name: None,
            access_token: "secret-access".into(),
            refresh_token: "secret-refresh".into(),
            token_expires_at: now,
            scope: None,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&inst).unwrap();
        assert!(!json.contains("secret-access"));
        assert!(!json.contains("secret-refresh"));
        assert!(json.contains("\"location_id\":\"loc\""));
    }

    #[test]
    fn test_connection_status_names_fall_back() {
        let now = Utc::now();
        let inst = Installation {
            id: 1,
            location_id: "loc".into(),
            company_id: "comp".into(),
            location_name: None,
            company_name: Some("Acme".into()),
            access_token: String::new(),
            refresh_token: String::new(),
            token_expires_at: now,
            scope: None,
            created_at: now,
            updated_at: now,
        };
        let status = ConnectionStatus::from_installation(&inst);
        assert!(status.connected);
        assert_eq!(status.location.unwrap().name, "Unknown Location");
        assert_eq!(status.company.unwrap().name, "Acme");
    }

    #[test]
    fn test_lead_display_name() {
        let now = Utc::now();
        let mut lead = Lead {
            id: 1,
            installation_id: 1,
            ghl_contact_id: "c1".into(),
            first_name: Some("Jane".into()),
            last_name: None,
            email: Some("jane@example.com".into()),
            phone: None,
            status: LeadStatus::New,
            tags: vec![],
            last_activity: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(lead.display_name(), "Jane");
        lead.first_name = None;
        assert_eq!(lead.display_name(), "jane@example.com");
    }
}
