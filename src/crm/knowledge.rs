use serde_json::json;
use tracing::{info, warn};

use super::db::{DbHandle, NurtureDb};
use super::models::{Chunk, DocumentStatus, KnowledgeDocument, NewDocument};
use crate::errors::CrmError;

pub const CHUNK_SIZE: usize = 1000;
const TITLE_MAX_CHARS: usize = 80;

/// Split `content` into consecutive slices of at most `size` chars.
/// Offsets are char positions, so multi-byte text never splits mid-char.
pub fn chunk_content(content: &str, size: usize) -> Vec<Chunk> {
    let size = size.max(1);
    let chars: Vec<char> = content.chars().collect();
    chars
        .chunks(size)
        .enumerate()
        .map(|(index, piece)| {
            let start = index * size;
            Chunk {
                chunk_index: index as i64,
                start: start as i64,
                end: (start + piece.len()) as i64,
                content: piece.iter().collect(),
            }
        })
        .collect()
}

/// Title for an upload that did not name itself.
pub fn derive_title(content: &str) -> String {
    let first_line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first_line.is_empty() {
        return "Untitled document".to_string();
    }
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

/// Stores documents and keeps their chunks in step with their content.
#[derive(Clone)]
pub struct KnowledgeBase {
    db: DbHandle,
}

impl KnowledgeBase {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewDocument) -> Result<KnowledgeDocument, CrmError> {
        let title = new
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| derive_title(&new.content));
        self.db
            .call(move |db| {
                let doc = db.create_document(&new, &title)?;
                process(db, doc.id)
            })
            .await
            .map_err(CrmError::from_db)
    }

    /// Re-chunk a stored document from its current content.
    pub async fn reprocess(&self, id: i64) -> Result<KnowledgeDocument, CrmError> {
        self.db
            .call(move |db| {
                db.set_document_status(id, DocumentStatus::Processing, 0, None)?;
                process(db, id)
            })
            .await
            .map_err(CrmError::from_db)
    }
}

fn process(db: &NurtureDb, id: i64) -> anyhow::Result<KnowledgeDocument> {
    let doc = db
        .get_document(id)?
        .ok_or(CrmError::DocumentNotFound { id })?;
    if doc.content.trim().is_empty() {
        warn!(document_id = id, "Document has no text to index");
        db.replace_chunks(id, &[])?;
        return db.set_document_status(
            id,
            DocumentStatus::Error,
            0,
            Some("Document has no extractable text"),
        );
    }

    let chunks = chunk_content(&doc.content, CHUNK_SIZE);
    db.replace_chunks(id, &chunks)?;
    let doc = db.set_document_status(id, DocumentStatus::Complete, chunks.len() as i64, None)?;
    db.record_billing_event(
        doc.installation_id,
        "document_processed",
        1,
        Some(&json!({"document_id": id, "chunks": chunks.len()})),
    )?;
    info!(document_id = id, chunks = chunks.len(), "Document processed");
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::models::NewInstallation;
    use chrono::Utc;

    fn kb_with_installation() -> (DbHandle, KnowledgeBase, i64) {
        let db = DbHandle::new(NurtureDb::new_in_memory().unwrap());
        let inst = db
            .lock_sync()
            .unwrap()
            .upsert_installation(&NewInstallation {
                location_id: "loc".into(),
                company_id: "comp".into(),
                location_name: None,
                company_name: None,
                access_token: "a".into(),
                refresh_token: "r".into(),
                token_expires_at: Utc::now(),
                scope: None,
            })
            .unwrap();
        (db.clone(), KnowledgeBase::new(db), inst.id)
    }

    fn doc(installation_id: i64, title: Option<&str>, content: &str) -> NewDocument {
        NewDocument {
            installation_id,
            title: title.map(str::to_string),
            content: content.to_string(),
            source: None,
            file_url: None,
            file_type: None,
        }
    }

    #[test]
    fn test_chunk_exact_multiple() {
        let text = "a".repeat(2000);
        let chunks = chunk_content(&text, 1000);
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[1].start, chunks[1].end), (1000, 2000));
    }

    #[test]
    fn test_chunk_remainder_and_offsets() {
        let text = "x".repeat(2500);
        let chunks = chunk_content(&text, 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].chunk_index, 2);
        assert_eq!((chunks[2].start, chunks[2].end), (2000, 2500));
        assert_eq!(chunks[2].content.len(), 500);
    }

    #[test]
    fn test_chunk_multibyte_text() {
        let text = "héllo wörld ✓ ".repeat(100);
        let chunks = chunk_content(&text, 7);
        let rebuilt: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rebuilt, text);
        assert!(chunks.iter().all(|c| c.content.chars().count() <= 7));
        assert_eq!(chunks.last().unwrap().end as usize, text.chars().count());
    }

    #[test]
    fn test_chunk_empty() {
        assert!(chunk_content("", 1000).is_empty());
    }

    #[test]
    fn test_derive_title() {
        assert_eq!(derive_title("\n\n  Refund policy \nbody"), "Refund policy");
        assert_eq!(derive_title("   "), "Untitled document");
        let long = "w".repeat(100);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));
    }

    #[tokio::test]
    async fn test_create_chunks_and_completes() {
        let (db, kb, inst) = kb_with_installation();
        let content = "z".repeat(2100);
        let created = kb.create(doc(inst, Some("Pricing"), &content)).await.unwrap();
        assert_eq!(created.status, DocumentStatus::Complete);
        assert_eq!(created.chunk_count, 3);
        assert_eq!(created.title, "Pricing");

        let guard = db.lock_sync().unwrap();
        assert_eq!(guard.get_chunks(created.id).unwrap().len(), 3);
        let billing = guard.list_billing_events(Some(inst), 10).unwrap();
        assert_eq!(billing[0].event_type, "document_processed");
    }

    #[tokio::test]
    async fn test_empty_content_marks_error() {
        let (_db, kb, inst) = kb_with_installation();
        let created = kb.create(doc(inst, None, "  \n ")).await.unwrap();
        assert_eq!(created.status, DocumentStatus::Error);
        assert_eq!(created.chunk_count, 0);
        assert!(created.error.is_some());
        assert_eq!(created.title, "Untitled document");
    }

    #[tokio::test]
    async fn test_reprocess() {
        let (_db, kb, inst) = kb_with_installation();
        let created = kb.create(doc(inst, None, "Hours: 9-5")).await.unwrap();
        let again = kb.reprocess(created.id).await.unwrap();
        assert_eq!(again.status, DocumentStatus::Complete);
        assert_eq!(again.chunk_count, 1);

        assert!(matches!(
            kb.reprocess(999).await,
            Err(CrmError::DocumentNotFound { id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_create_for_unknown_installation() {
        let (_db, kb, _) = kb_with_installation();
        assert!(matches!(
            kb.create(doc(4242, None, "text")).await,
            Err(CrmError::InstallationNotFound { id: 4242 })
        ));
    }
}
