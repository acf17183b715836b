use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::CrmError;

/// Async-safe handle to the CRM database.
///
/// Wraps `NurtureDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<NurtureDb>>,
}

impl DbHandle {
    pub fn new(db: NurtureDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&NurtureDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// commands and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, NurtureDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct NurtureDb {
    conn: Connection,
}

const INSTALLATION_COLUMNS: &str = "id, location_id, company_id, location_name, company_name, access_token, refresh_token, token_expires_at, scope, created_at, updated_at";
const LEAD_COLUMNS: &str = "id, installation_id, ghl_contact_id, first_name, last_name, email, phone, status, tags, last_activity, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, lead_id, content, status, approval_needed, scheduled_for, sent_at, created_at, updated_at";
const DOCUMENT_COLUMNS: &str = "id, installation_id, title, content, source, file_url, file_type, status, chunk_count, error, created_at, updated_at";
const WEBHOOK_EVENT_COLUMNS: &str = "id, installation_id, event_type, payload, processed, processed_at, processing_error, created_at";

impl NurtureDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS ghl_installations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    location_id TEXT NOT NULL,
                    company_id TEXT NOT NULL,
                    location_name TEXT,
                    company_name TEXT,
                    access_token TEXT NOT NULL,
                    refresh_token TEXT NOT NULL,
                    token_expires_at TEXT NOT NULL,
                    scope TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(company_id, location_id)
                );

                CREATE TABLE IF NOT EXISTS oauth_states (
                    state TEXT PRIMARY KEY,
                    location_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS leads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    installation_id INTEGER NOT NULL REFERENCES ghl_installations(id) ON DELETE CASCADE,
                    ghl_contact_id TEXT NOT NULL,
                    first_name TEXT,
                    last_name TEXT,
                    email TEXT,
                    phone TEXT,
                    status TEXT NOT NULL DEFAULT 'new',
                    tags TEXT NOT NULL DEFAULT '[]',
                    last_activity TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(installation_id, ghl_contact_id)
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lead_id INTEGER NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    approval_needed INTEGER NOT NULL DEFAULT 1,
                    scheduled_for TEXT,
                    sent_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS knowledge_base (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    installation_id INTEGER NOT NULL REFERENCES ghl_installations(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    source TEXT,
                    file_url TEXT,
                    file_type TEXT,
                    status TEXT NOT NULL DEFAULT 'processing',
                    chunk_count INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS knowledge_base_chunks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    document_id INTEGER NOT NULL REFERENCES knowledge_base(id) ON DELETE CASCADE,
                    chunk_index INTEGER NOT NULL,
                    start_offset INTEGER NOT NULL,
                    end_offset INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    UNIQUE(document_id, chunk_index)
                );

                CREATE TABLE IF NOT EXISTS webhook_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    installation_id INTEGER REFERENCES ghl_installations(id) ON DELETE SET NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0,
                    processed_at TEXT,
                    processing_error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS billing_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    installation_id INTEGER NOT NULL REFERENCES ghl_installations(id) ON DELETE CASCADE,
                    event_type TEXT NOT NULL,
                    credits_used INTEGER NOT NULL DEFAULT 0,
                    details TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_installations_location ON ghl_installations(location_id);
                CREATE INDEX IF NOT EXISTS idx_leads_installation ON leads(installation_id);
                CREATE INDEX IF NOT EXISTS idx_messages_lead ON messages(lead_id);
                CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
                CREATE INDEX IF NOT EXISTS idx_knowledge_installation ON knowledge_base(installation_id);
                CREATE INDEX IF NOT EXISTS idx_webhook_events_installation ON webhook_events(installation_id);
                CREATE INDEX IF NOT EXISTS idx_billing_events_installation ON billing_events(installation_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Installations ─────────────────────────────────────────────────

    /// Insert or update the installation for (company_id, location_id).
    /// Names and scope only overwrite stored values when present.
    pub fn upsert_installation(&self, new: &NewInstallation) -> Result<Installation> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO ghl_installations
                    (location_id, company_id, location_name, company_name, access_token, refresh_token, token_expires_at, scope, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(company_id, location_id) DO UPDATE SET
                    location_name = COALESCE(excluded.location_name, ghl_installations.location_name),
                    company_name = COALESCE(excluded.company_name, ghl_installations.company_name),
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    token_expires_at = excluded.token_expires_at,
                    scope = COALESCE(excluded.scope, ghl_installations.scope),
                    updated_at = excluded.updated_at",
                params![
                    new.location_id,
                    new.company_id,
                    new.location_name,
                    new.company_name,
                    new.access_token,
                    new.refresh_token,
                    new.token_expires_at,
                    new.scope,
                    now,
                ],
            )
            .context("Failed to upsert installation")?;
        self.find_installation(&new.company_id, &new.location_id)?
            .context("Installation not found after upsert")
    }

    pub fn get_installation(&self, id: i64) -> Result<Option<Installation>> {
        self.conn
            .query_row(
                &format!("SELECT {INSTALLATION_COLUMNS} FROM ghl_installations WHERE id = ?1"),
                params![id],
                installation_from_row,
            )
            .optional()
            .context("Failed to query installation")
    }

    /// Like `get_installation`, but a missing row is an `InstallationNotFound`.
    pub fn require_installation(&self, id: i64) -> Result<Installation> {
        self.get_installation(id)?
            .ok_or_else(|| CrmError::InstallationNotFound { id }.into())
    }

    pub fn find_installation(
        &self,
        company_id: &str,
        location_id: &str,
    ) -> Result<Option<Installation>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {INSTALLATION_COLUMNS} FROM ghl_installations WHERE company_id = ?1 AND location_id = ?2"
                ),
                params![company_id, location_id],
                installation_from_row,
            )
            .optional()
            .context("Failed to query installation by company/location")
    }

    /// Newest installation for a location, regardless of company.
    pub fn find_installation_by_location(&self, location_id: &str) -> Result<Option<Installation>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {INSTALLATION_COLUMNS} FROM ghl_installations WHERE location_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![location_id],
                installation_from_row,
            )
            .optional()
            .context("Failed to query installation by location")
    }

    /// The most recently created installation.
    pub fn latest_installation(&self) -> Result<Option<Installation>> {
        self.conn
            .query_row(
                &format!("SELECT {INSTALLATION_COLUMNS} FROM ghl_installations ORDER BY id DESC LIMIT 1"),
                [],
                installation_from_row,
            )
            .optional()
            .context("Failed to query latest installation")
    }

    pub fn list_installations(&self) -> Result<Vec<Installation>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {INSTALLATION_COLUMNS} FROM ghl_installations ORDER BY id DESC"
            ))
            .context("Failed to prepare list_installations")?;
        let rows = stmt
            .query_map([], installation_from_row)
            .context("Failed to query installations")?;
        let mut installations = Vec::new();
        for row in rows {
            installations.push(row.context("Failed to read installation row")?);
        }
        Ok(installations)
    }

    pub fn update_installation_tokens(
        &self,
        id: i64,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Installation> {
        let count = self
            .conn
            .execute(
                "UPDATE ghl_installations
                 SET access_token = ?1, refresh_token = ?2, token_expires_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![access_token, refresh_token, expires_at, Utc::now(), id],
            )
            .context("Failed to update installation tokens")?;
        if count == 0 {
            return Err(CrmError::InstallationNotFound { id }.into());
        }
        self.require_installation(id)
    }

    pub fn delete_installation(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM ghl_installations WHERE id = ?1", params![id])
            .context("Failed to delete installation")?;
        Ok(count > 0)
    }

    pub fn count_installations(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM ghl_installations", [], |row| row.get(0))
            .context("Failed to count installations")
    }

    // ── OAuth states ──────────────────────────────────────────────────

    pub fn create_oauth_state(&self, state: &str, location_id: Option<&str>) -> Result<OAuthState> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO oauth_states (state, location_id, created_at) VALUES (?1, ?2, ?3)",
                params![state, location_id, now],
            )
            .context("Failed to insert OAuth state")?;
        Ok(OAuthState {
            state: state.to_string(),
            location_id: location_id.map(str::to_string),
            created_at: now,
        })
    }

    /// Look up and delete a state in one transaction, so a state can be
    /// consumed at most once.
    pub fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let found = tx
            .query_row(
                "SELECT state, location_id, created_at FROM oauth_states WHERE state = ?1",
                params![state],
                |row| {
                    Ok(OAuthState {
                        state: row.get(0)?,
                        location_id: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query OAuth state")?;
        if found.is_some() {
            tx.execute("DELETE FROM oauth_states WHERE state = ?1", params![state])
                .context("Failed to consume OAuth state")?;
        }
        tx.commit().context("Failed to commit OAuth state lookup")?;
        Ok(found)
    }

    pub fn purge_expired_oauth_states(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM oauth_states WHERE created_at < ?1",
                params![cutoff],
            )
            .context("Failed to purge expired OAuth states")
    }

    // ── Leads ─────────────────────────────────────────────────────────

    /// Insert or merge a lead keyed by (installation_id, ghl_contact_id).
    /// New leads start as `new`; an existing lead keeps its status.
    pub fn upsert_lead(&self, lead: &LeadUpsert) -> Result<Lead> {
        let tags = lead
            .tags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize lead tags")?;
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO leads
                    (installation_id, ghl_contact_id, first_name, last_name, email, phone, status, tags, last_activity, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'new', COALESCE(?7, '[]'), ?8, ?9, ?9)
                 ON CONFLICT(installation_id, ghl_contact_id) DO UPDATE SET
                    first_name = COALESCE(excluded.first_name, leads.first_name),
                    last_name = COALESCE(excluded.last_name, leads.last_name),
                    email = COALESCE(excluded.email, leads.email),
                    phone = COALESCE(excluded.phone, leads.phone),
                    tags = COALESCE(?7, leads.tags),
                    last_activity = COALESCE(excluded.last_activity, leads.last_activity),
                    updated_at = excluded.updated_at",
                params![
                    lead.installation_id,
                    lead.ghl_contact_id,
                    lead.first_name,
                    lead.last_name,
                    lead.email,
                    lead.phone,
                    tags,
                    lead.last_activity,
                    now,
                ],
            )
            .context("Failed to upsert lead")?;
        self.find_lead(lead.installation_id, &lead.ghl_contact_id)?
            .context("Lead not found after upsert")
    }

    pub fn get_lead(&self, id: i64) -> Result<Option<Lead>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id],
                |row| LeadRow::from_row(row, 0),
            )
            .optional()
            .context("Failed to query lead")?;
        row.map(LeadRow::into_lead).transpose()
    }

    pub fn find_lead(&self, installation_id: i64, ghl_contact_id: &str) -> Result<Option<Lead>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE installation_id = ?1 AND ghl_contact_id = ?2"
                ),
                params![installation_id, ghl_contact_id],
                |row| LeadRow::from_row(row, 0),
            )
            .optional()
            .context("Failed to query lead by contact")?;
        row.map(LeadRow::into_lead).transpose()
    }

    pub fn list_leads(
        &self,
        installation_id: Option<i64>,
        status: Option<LeadStatus>,
    ) -> Result<Vec<Lead>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {LEAD_COLUMNS} FROM leads
                 WHERE (?1 IS NULL OR installation_id = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY id DESC"
            ))
            .context("Failed to prepare list_leads")?;
        let rows = stmt
            .query_map(
                params![installation_id, status.map(|s| s.as_str())],
                |row| LeadRow::from_row(row, 0),
            )
            .context("Failed to query leads")?;
        let mut leads = Vec::new();
        for row in rows {
            let r = row.context("Failed to read lead row")?;
            leads.push(r.into_lead()?);
        }
        Ok(leads)
    }

    pub fn update_lead(&self, id: i64, update: &LeadUpdate) -> Result<Lead> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = Utc::now();

        let count = tx
            .execute(
                "UPDATE leads SET updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to touch lead")?;
        if count == 0 {
            return Err(CrmError::LeadNotFound { id }.into());
        }
        if let Some(status) = update.status {
            tx.execute(
                "UPDATE leads SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update lead status")?;
        }
        if let Some(tags) = &update.tags {
            let tags = serde_json::to_string(tags).context("Failed to serialize lead tags")?;
            tx.execute("UPDATE leads SET tags = ?1 WHERE id = ?2", params![tags, id])
                .context("Failed to update lead tags")?;
        }
        if let Some(last_activity) = update.last_activity {
            tx.execute(
                "UPDATE leads SET last_activity = ?1 WHERE id = ?2",
                params![last_activity, id],
            )
            .context("Failed to update lead last_activity")?;
        }

        tx.commit().context("Failed to commit lead update")?;
        self.get_lead(id)?.context("Lead not found after update")
    }

    pub fn delete_lead_by_contact(&self, installation_id: i64, ghl_contact_id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM leads WHERE installation_id = ?1 AND ghl_contact_id = ?2",
                params![installation_id, ghl_contact_id],
            )
            .context("Failed to delete lead")?;
        Ok(count > 0)
    }

    pub fn count_leads(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM leads", [], |row| row.get(0))
            .context("Failed to count leads")
    }

    // ── Messages ──────────────────────────────────────────────────────

    /// Create a pending draft for an existing lead.
    pub fn create_message(
        &self,
        lead_id: i64,
        content: &str,
        approval_needed: bool,
    ) -> Result<Message> {
        if self.get_lead(lead_id)?.is_none() {
            return Err(CrmError::LeadNotFound { id: lead_id }.into());
        }
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO messages (lead_id, content, status, approval_needed, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?4)",
                params![lead_id, content, approval_needed, now],
            )
            .context("Failed to insert message")?;
        let id = self.conn.last_insert_rowid();
        self.get_message(id)?
            .context("Message not found after insert")
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                |row| MessageRow::from_row(row, 0),
            )
            .optional()
            .context("Failed to query message")?;
        row.map(MessageRow::into_message).transpose()
    }

    pub fn get_message_with_lead(&self, id: i64) -> Result<Option<MessageWithLead>> {
        let mut found = self.query_messages_with_leads("m.id = ?1", params![id])?;
        Ok(found.pop())
    }

    /// Messages joined with their lead, newest first.
    pub fn list_messages(
        &self,
        status: Option<MessageStatus>,
        lead_id: Option<i64>,
    ) -> Result<Vec<MessageWithLead>> {
        self.query_messages_with_leads(
            "(?1 IS NULL OR m.status = ?1) AND (?2 IS NULL OR m.lead_id = ?2)",
            params![status.map(|s| s.as_str()), lead_id],
        )
    }

    fn query_messages_with_leads(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MessageWithLead>> {
        let sql = format!(
            "SELECT m.id, m.lead_id, m.content, m.status, m.approval_needed, m.scheduled_for, m.sent_at, m.created_at, m.updated_at,
                    l.id, l.installation_id, l.ghl_contact_id, l.first_name, l.last_name, l.email, l.phone, l.status, l.tags, l.last_activity, l.created_at, l.updated_at
             FROM messages m JOIN leads l ON l.id = m.lead_id
             WHERE {filter}
             ORDER BY m.id DESC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((MessageRow::from_row(row, 0)?, LeadRow::from_row(row, 9)?))
            })
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let (m, l) = row.context("Failed to read message row")?;
            messages.push(MessageWithLead {
                message: m.into_message()?,
                lead: l.into_lead()?,
            });
        }
        Ok(messages)
    }

    /// Replace the draft text. Only pending messages can be edited.
    pub fn update_message_content(&self, id: i64, content: &str) -> Result<Message> {
        let count = self
            .conn
            .execute(
                "UPDATE messages SET content = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'pending'",
                params![content, Utc::now(), id],
            )
            .context("Failed to update message content")?;
        if count == 0 {
            return match self.get_message(id)? {
                None => Err(CrmError::MessageNotFound { id }.into()),
                Some(m) => Err(CrmError::MessageLocked {
                    id,
                    status: m.status.as_str().to_string(),
                }
                .into()),
            };
        }
        self.get_message(id)?
            .context("Message not found after update")
    }

    /// Move a message to `to` in a single conditional UPDATE. The row only
    /// changes when its current status is one of `to.allowed_sources()`, so
    /// of two racing decisions exactly one lands.
    pub fn transition_message(
        &self,
        id: i64,
        to: MessageStatus,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Message> {
        let sources = to
            .allowed_sources()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let count = if sources.is_empty() {
            0
        } else {
            self.conn
                .execute(
                    &format!(
                        "UPDATE messages SET
                            status = ?1,
                            updated_at = ?2,
                            scheduled_for = CASE WHEN ?1 = 'scheduled' THEN COALESCE(?3, scheduled_for) ELSE scheduled_for END,
                            sent_at = CASE WHEN ?1 = 'sent' THEN COALESCE(sent_at, ?2) ELSE sent_at END
                         WHERE id = ?4 AND status IN ({sources})"
                    ),
                    params![to.as_str(), Utc::now(), scheduled_for, id],
                )
                .context("Failed to transition message")?
        };
        let current = self.get_message(id)?;
        match current {
            None => Err(CrmError::MessageNotFound { id }.into()),
            Some(m) if count == 0 => Err(CrmError::InvalidTransition {
                id,
                from: m.status.as_str().to_string(),
                to: to.as_str().to_string(),
            }
            .into()),
            Some(m) => Ok(m),
        }
    }

    // ── Knowledge base ────────────────────────────────────────────────

    pub fn create_document(&self, doc: &NewDocument, title: &str) -> Result<KnowledgeDocument> {
        if self.get_installation(doc.installation_id)?.is_none() {
            return Err(CrmError::InstallationNotFound {
                id: doc.installation_id,
            }
            .into());
        }
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO knowledge_base
                    (installation_id, title, content, source, file_url, file_type, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'processing', ?7, ?7)",
                params![
                    doc.installation_id,
                    title,
                    doc.content,
                    doc.source,
                    doc.file_url,
                    doc.file_type,
                    now,
                ],
            )
            .context("Failed to insert document")?;
        let id = self.conn.last_insert_rowid();
        self.get_document(id)?
            .context("Document not found after insert")
    }

    pub fn get_document(&self, id: i64) -> Result<Option<KnowledgeDocument>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM knowledge_base WHERE id = ?1"),
                params![id],
                DocumentRow::from_row,
            )
            .optional()
            .context("Failed to query document")?;
        row.map(DocumentRow::into_document).transpose()
    }

    /// List documents, optionally filtered by installation and a
    /// case-insensitive substring of title or content.
    pub fn list_documents(
        &self,
        installation_id: Option<i64>,
        query: Option<&str>,
    ) -> Result<Vec<KnowledgeDocument>> {
        let needle = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM knowledge_base
                 WHERE (?1 IS NULL OR installation_id = ?1)
                   AND (?2 IS NULL OR instr(lower(title), ?2) > 0 OR instr(lower(content), ?2) > 0)
                 ORDER BY id DESC"
            ))
            .context("Failed to prepare list_documents")?;
        let rows = stmt
            .query_map(params![installation_id, needle], DocumentRow::from_row)
            .context("Failed to query documents")?;
        let mut docs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read document row")?;
            docs.push(r.into_document()?);
        }
        Ok(docs)
    }

    /// Swap a document's chunks for `chunks` atomically.
    pub fn replace_chunks(&self, document_id: i64, chunks: &[Chunk]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM knowledge_base_chunks WHERE document_id = ?1",
            params![document_id],
        )
        .context("Failed to clear chunks")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO knowledge_base_chunks (document_id, chunk_index, start_offset, end_offset, content)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("Failed to prepare chunk insert")?;
            for chunk in chunks {
                stmt.execute(params![
                    document_id,
                    chunk.chunk_index,
                    chunk.start,
                    chunk.end,
                    chunk.content
                ])
                .context("Failed to insert chunk")?;
            }
        }
        tx.commit().context("Failed to commit chunks")?;
        Ok(())
    }

    pub fn get_chunks(&self, document_id: i64) -> Result<Vec<Chunk>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT chunk_index, start_offset, end_offset, content FROM knowledge_base_chunks
                 WHERE document_id = ?1 ORDER BY chunk_index",
            )
            .context("Failed to prepare get_chunks")?;
        let rows = stmt
            .query_map(params![document_id], |row| {
                Ok(Chunk {
                    chunk_index: row.get(0)?,
                    start: row.get(1)?,
                    end: row.get(2)?,
                    content: row.get(3)?,
                })
            })
            .context("Failed to query chunks")?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.context("Failed to read chunk row")?);
        }
        Ok(chunks)
    }

    pub fn set_document_status(
        &self,
        id: i64,
        status: DocumentStatus,
        chunk_count: i64,
        error: Option<&str>,
    ) -> Result<KnowledgeDocument> {
        let count = self
            .conn
            .execute(
                "UPDATE knowledge_base SET status = ?1, chunk_count = ?2, error = ?3, updated_at = ?4 WHERE id = ?5",
                params![status.as_str(), chunk_count, error, Utc::now(), id],
            )
            .context("Failed to update document status")?;
        if count == 0 {
            return Err(CrmError::DocumentNotFound { id }.into());
        }
        self.get_document(id)?
            .context("Document not found after status update")
    }

    pub fn delete_document(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM knowledge_base WHERE id = ?1", params![id])
            .context("Failed to delete document")?;
        Ok(count > 0)
    }

    // ── Webhook events ────────────────────────────────────────────────

    pub fn insert_webhook_event(
        &self,
        installation_id: Option<i64>,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookEvent> {
        let payload = serde_json::to_string(payload).context("Failed to serialize payload")?;
        self.conn
            .execute(
                "INSERT INTO webhook_events (installation_id, event_type, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![installation_id, event_type, payload, Utc::now()],
            )
            .context("Failed to insert webhook event")?;
        let id = self.conn.last_insert_rowid();
        self.get_webhook_event(id)?
            .context("Webhook event not found after insert")
    }

    pub fn mark_webhook_processed(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE webhook_events SET processed = 1, processed_at = ?1, processing_error = NULL WHERE id = ?2",
                params![Utc::now(), id],
            )
            .context("Failed to mark webhook event processed")?;
        Ok(())
    }

    pub fn mark_webhook_failed(&self, id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE webhook_events SET processed = 0, processing_error = ?1 WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to record webhook processing error")?;
        Ok(())
    }

    pub fn get_webhook_event(&self, id: i64) -> Result<Option<WebhookEvent>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events WHERE id = ?1"),
                params![id],
                WebhookEventRow::from_row,
            )
            .optional()
            .context("Failed to query webhook event")?;
        row.map(WebhookEventRow::into_event).transpose()
    }

    pub fn list_webhook_events(
        &self,
        installation_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<WebhookEvent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events
                 WHERE (?1 IS NULL OR installation_id = ?1)
                 ORDER BY id DESC LIMIT ?2"
            ))
            .context("Failed to prepare list_webhook_events")?;
        let rows = stmt
            .query_map(params![installation_id, limit], WebhookEventRow::from_row)
            .context("Failed to query webhook events")?;
        let mut events = Vec::new();
        for row in rows {
            let r = row.context("Failed to read webhook event row")?;
            events.push(r.into_event()?);
        }
        Ok(events)
    }

    // ── Billing events ────────────────────────────────────────────────

    pub fn record_billing_event(
        &self,
        installation_id: i64,
        event_type: &str,
        credits_used: i64,
        details: Option<&serde_json::Value>,
    ) -> Result<BillingEvent> {
        let details_text = details
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize billing details")?;
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO billing_events (installation_id, event_type, credits_used, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![installation_id, event_type, credits_used, details_text, now],
            )
            .context("Failed to insert billing event")?;
        Ok(BillingEvent {
            id: self.conn.last_insert_rowid(),
            installation_id,
            event_type: event_type.to_string(),
            credits_used,
            details: details.cloned(),
            created_at: now,
        })
    }

    pub fn list_billing_events(
        &self,
        installation_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<BillingEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, installation_id, event_type, credits_used, details, created_at FROM billing_events
                 WHERE (?1 IS NULL OR installation_id = ?1)
                 ORDER BY id DESC LIMIT ?2",
            )
            .context("Failed to prepare list_billing_events")?;
        let rows = stmt
            .query_map(params![installation_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, DateTime<Utc>>(5)?,
                ))
            })
            .context("Failed to query billing events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, installation_id, event_type, credits_used, details, created_at) =
                row.context("Failed to read billing event row")?;
            let details = details
                .map(|d| serde_json::from_str(&d))
                .transpose()
                .context("Failed to parse billing details JSON")?;
            events.push(BillingEvent {
                id,
                installation_id,
                event_type,
                credits_used,
                details,
                created_at,
            });
        }
        Ok(events)
    }

    // ── Diagnostics ───────────────────────────────────────────────────

    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .context("Failed to prepare table_names")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query table names")?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.context("Failed to read table name")?);
        }
        Ok(names)
    }

    pub fn diagnostics(&self) -> Result<Diagnostics> {
        Ok(Diagnostics {
            installation_count: self.count_installations()?,
            lead_count: self.count_leads()?,
            tables: self.table_names()?,
        })
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn installation_from_row(row: &Row<'_>) -> rusqlite::Result<Installation> {
    Ok(Installation {
        id: row.get(0)?,
        location_id: row.get(1)?,
        company_id: row.get(2)?,
        location_name: row.get(3)?,
        company_name: row.get(4)?,
        access_token: row.get(5)?,
        refresh_token: row.get(6)?,
        token_expires_at: row.get(7)?,
        scope: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Intermediate row struct for leads; `status` and `tags` are stored as text.
struct LeadRow {
    id: i64,
    installation_id: i64,
    ghl_contact_id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    status: String,
    tags: String,
    last_activity: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LeadRow {
    fn from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(base)?,
            installation_id: row.get(base + 1)?,
            ghl_contact_id: row.get(base + 2)?,
            first_name: row.get(base + 3)?,
            last_name: row.get(base + 4)?,
            email: row.get(base + 5)?,
            phone: row.get(base + 6)?,
            status: row.get(base + 7)?,
            tags: row.get(base + 8)?,
            last_activity: row.get(base + 9)?,
            created_at: row.get(base + 10)?,
            updated_at: row.get(base + 11)?,
        })
    }

    fn into_lead(self) -> Result<Lead> {
        let status = LeadStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse lead status")?;
        let tags: Vec<String> =
            serde_json::from_str(&self.tags).context("Failed to parse lead tags JSON")?;
        Ok(Lead {
            id: self.id,
            installation_id: self.installation_id,
            ghl_contact_id: self.ghl_contact_id,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone: self.phone,
            status,
            tags,
            last_activity: self.last_activity,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct MessageRow {
    id: i64,
    lead_id: i64,
    content: String,
    status: String,
    approval_needed: bool,
    scheduled_for: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MessageRow {
    fn from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(base)?,
            lead_id: row.get(base + 1)?,
            content: row.get(base + 2)?,
            status: row.get(base + 3)?,
            approval_needed: row.get(base + 4)?,
            scheduled_for: row.get(base + 5)?,
            sent_at: row.get(base + 6)?,
            created_at: row.get(base + 7)?,
            updated_at: row.get(base + 8)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let status = MessageStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message status")?;
        Ok(Message {
            id: self.id,
            lead_id: self.lead_id,
            content: self.content,
            status,
            approval_needed: self.approval_needed,
            scheduled_for: self.scheduled_for,
            sent_at: self.sent_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct DocumentRow {
    id: i64,
    installation_id: i64,
    title: String,
    content: String,
    source: Option<String>,
    file_url: Option<String>,
    file_type: Option<String>,
    status: String,
    chunk_count: i64,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            installation_id: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            source: row.get(4)?,
            file_url: row.get(5)?,
            file_type: row.get(6)?,
            status: row.get(7)?,
            chunk_count: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_document(self) -> Result<KnowledgeDocument> {
        let status = DocumentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse document status")?;
        Ok(KnowledgeDocument {
            id: self.id,
            installation_id: self.installation_id,
            title: self.title,
            content: self.content,
            source: self.source,
            file_url: self.file_url,
            file_type: self.file_type,
            status,
            chunk_count: self.chunk_count,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct WebhookEventRow {
    id: i64,
    installation_id: Option<i64>,
    event_type: String,
    payload: String,
    processed: bool,
    processed_at: Option<DateTime<Utc>>,
    processing_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl WebhookEventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            installation_id: row.get(1)?,
            event_type: row.get(2)?,
            payload: row.get(3)?,
            processed: row.get(4)?,
            processed_at: row.get(5)?,
            processing_error: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_event(self) -> Result<WebhookEvent> {
        let payload =
            serde_json::from_str(&self.payload).context("Failed to parse webhook payload JSON")?;
        Ok(WebhookEvent {
            id: self.id,
            installation_id: self.installation_id,
            event_type: self.event_type,
            payload,
            processed: self.processed,
            processed_at: self.processed_at,
            processing_error: self.processing_error,
            created_at: self.created_at,
        })
    }
}
