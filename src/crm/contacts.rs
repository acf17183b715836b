use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::db::DbHandle;
use super::ghl::{GhlClient, GhlContact};
use super::models::{Installation, NewInstallation};
use super::tokens::TokenManager;
use crate::errors::CrmError;

pub const DEMO_CONTACT_COUNT: usize = 10;
const DEMO_TOKEN_TTL_DAYS: i64 = 7;

const DEMO_FIRST_NAMES: [&str; 10] = [
    "Olivia", "Liam", "Emma", "Noah", "Ava", "Elijah", "Sophia", "James", "Isabella", "Lucas",
];
const DEMO_LAST_NAMES: [&str; 10] = [
    "Martinez", "Chen", "Johnson", "Patel", "Okafor", "Nguyen", "Schmidt", "Rossi", "Kowalski",
    "Haddad",
];

/// Stable sample contacts for trying the app without a live location.
pub fn demo_contacts(count: usize) -> Vec<GhlContact> {
    (0..count)
        .map(|i| {
            let first = DEMO_FIRST_NAMES[i % DEMO_FIRST_NAMES.len()];
            let last = DEMO_LAST_NAMES[(i * 3) % DEMO_LAST_NAMES.len()];
            GhlContact {
                id: format!("demo-contact-{}", i + 1),
                first_name: Some(first.to_string()),
                last_name: Some(last.to_string()),
                email: Some(format!(
                    "{}.{}@example.com",
                    first.to_lowercase(),
                    last.to_lowercase()
                )),
                phone: Some(format!("+1555{:07}", 100 + i)),
                tags: Some(vec!["demo".to_string()]),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub success: bool,
    pub message: String,
    pub imported: usize,
    pub errors: usize,
    pub force_mode: bool,
    pub installation_id: i64,
}

/// Pulls contacts into leads for the most recent installation.
#[derive(Clone)]
pub struct ContactImporter {
    db: DbHandle,
    ghl: GhlClient,
    tokens: TokenManager,
}

impl ContactImporter {
    pub fn new(db: DbHandle, ghl: GhlClient, tokens: TokenManager) -> Self {
        Self { db, ghl, tokens }
    }

    /// Import contacts. With `force`, a demo installation is created when
    /// none exists and generated contacts replace the GoHighLevel fetch.
    pub async fn import(&self, force: bool) -> Result<ImportResult, CrmError> {
        let installation = self
            .db
            .call(|db| db.latest_installation())
            .await
            .map_err(CrmError::from_db)?;

        let (installation, contacts) = match (installation, force) {
            (None, false) => return Err(CrmError::NoInstallation),
            (None, true) => {
                let demo = self.create_demo_installation().await?;
                (demo, demo_contacts(DEMO_CONTACT_COUNT))
            }
            (Some(inst), true) => (inst, demo_contacts(DEMO_CONTACT_COUNT)),
            (Some(inst), false) => {
                let token = self.tokens.access_token(inst.id).await?;
                let contacts = self.ghl.list_contacts(&token, &inst.location_id).await?;
                (inst, contacts)
            }
        };

        let installation_id = installation.id;
        let total = contacts.len();
        let (imported, errors) = self
            .db
            .call(move |db| {
                let mut imported = 0usize;
                let mut errors = 0usize;
                for contact in &contacts {
                    match db.upsert_lead(&contact.to_lead_upsert(installation_id)) {
                        Ok(_) => imported += 1,
                        Err(e) => {
                            warn!(contact_id = %contact.id, error = %e, "Failed to import contact");
                            errors += 1;
                        }
                    }
                }
                db.record_billing_event(
                    installation_id,
                    "contacts_imported",
                    imported as i64,
                    Some(&json!({
                        "imported": imported,
                        "errors": errors,
                        "force_mode": force,
                    })),
                )?;
                Ok((imported, errors))
            })
            .await
            .map_err(CrmError::from_db)?;

        info!(installation_id, total, imported, errors, force, "Contact import finished");
        let mode = if force { " (demo data)" } else { "" };
        Ok(ImportResult {
            success: true,
            message: format!("Imported {} of {} contacts{}", imported, total, mode),
            imported,
            errors,
            force_mode: force,
            installation_id,
        })
    }

    async fn create_demo_installation(&self) -> Result<Installation, CrmError> {
        info!("No installation found, creating a temporary demo installation");
        let new = NewInstallation {
            location_id: "demo-location".to_string(),
            company_id: "demo-company".to_string(),
            location_name: Some("Demo Location".to_string()),
            company_name: Some("Demo Company".to_string()),
            access_token: "demo-access-token".to_string(),
            refresh_token: "demo-refresh-token".to_string(),
            token_expires_at: Utc::now() + Duration::days(DEMO_TOKEN_TTL_DAYS),
            scope: None,
        };
        self.db
            .call(move |db| db.upsert_installation(&new))
            .await
            .map_err(CrmError::from_db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::db::NurtureDb;
    use crate::crm::mock_ghl::{MockBehavior, MockGhl, MockResponse};
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn importer(mock: &MockGhl) -> (DbHandle, ContactImporter) {
        let db = DbHandle::new(NurtureDb::new_in_memory().unwrap());
        let client = mock.client();
        let tokens = TokenManager::new(db.clone(), client.clone(), 600);
        (db.clone(), ContactImporter::new(db, client, tokens))
    }

    fn seed(db: &DbHandle, expires_in: Duration) -> Installation {
        db.lock_sync()
            .unwrap()
            .upsert_installation(&NewInstallation {
                location_id: "loc-1".into(),
                company_id: "comp-1".into(),
                location_name: None,
                company_name: None,
                access_token: "live-access".into(),
                refresh_token: "live-refresh".into(),
                token_expires_at: Utc::now() + expires_in,
                scope: None,
            })
            .unwrap()
    }

    #[test]
    fn test_demo_contacts_are_unique_and_stable() {
        let a = demo_contacts(DEMO_CONTACT_COUNT);
        let b = demo_contacts(DEMO_CONTACT_COUNT);
        assert_eq!(a.len(), 10);
        let ids: HashSet<_> = a.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 10);
        let emails: HashSet<_> = a.iter().map(|c| c.email.clone()).collect();
        assert_eq!(emails.len(), 10);
        assert_eq!(a[3].email, b[3].email);
    }

    #[tokio::test]
    async fn test_import_without_installation_fails() {
        let mock = MockGhl::start().await;
        let (_db, importer) = importer(&mock);
        assert!(matches!(
            importer.import(false).await,
            Err(CrmError::NoInstallation)
        ));
    }

    #[tokio::test]
    async fn test_force_import_creates_demo_installation() {
        let mock = MockGhl::start().await;
        let (db, importer) = importer(&mock);
        let result = importer.import(true).await.unwrap();
        assert!(result.force_mode);
        assert_eq!(result.imported, 10);
        assert_eq!(result.errors, 0);

        let guard = db.lock_sync().unwrap();
        let inst = guard.get_installation(result.installation_id).unwrap().unwrap();
        assert_eq!(inst.location_id, "demo-location");
        assert!(inst.token_expires_at > Utc::now() + Duration::days(6));
        assert_eq!(guard.count_leads().unwrap(), 10);
        let billing = guard.list_billing_events(Some(inst.id), 10).unwrap();
        assert_eq!(billing[0].event_type, "contacts_imported");
        assert_eq!(billing[0].credits_used, 10);
        drop(guard);
        // Nothing went upstream in force mode
        assert_eq!(mock.calls.contacts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_import_fetches_from_ghl() {
        let mock = MockGhl::start().await;
        let (db, importer) = importer(&mock);
        let inst = seed(&db, Duration::hours(5));

        let result = importer.import(false).await.unwrap();
        assert_eq!(result.imported, 2);
        assert_eq!(result.installation_id, inst.id);
        assert_eq!(mock.token_calls(), 0);
        assert_eq!(
            mock.calls.auth_headers.lock().unwrap().as_slice(),
            ["Bearer live-access".to_string()]
        );

        let leads = db.lock_sync().unwrap().list_leads(Some(inst.id), None).unwrap();
        assert_eq!(leads.len(), 2);

        // Re-importing merges instead of duplicating
        importer.import(false).await.unwrap();
        assert_eq!(db.lock_sync().unwrap().count_leads().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_import_refreshes_stale_token_first() {
        let mock = MockGhl::start().await;
        let (db, importer) = importer(&mock);
        seed(&db, Duration::minutes(2));

        importer.import(false).await.unwrap();
        assert_eq!(mock.token_calls(), 1);
        assert_eq!(
            mock.calls.auth_headers.lock().unwrap().as_slice(),
            ["Bearer mock-access".to_string()]
        );
    }

    #[tokio::test]
    async fn test_import_upstream_failure() {
        let mock = MockGhl::start_with(MockBehavior {
            contacts: MockResponse::json(403, serde_json::json!({"message": "scope missing"})),
            ..MockBehavior::default()
        })
        .await;
        let (db, importer) = importer(&mock);
        seed(&db, Duration::hours(5));
        let err = importer.import(false).await.unwrap_err();
        assert!(matches!(err, CrmError::Ghl(_)));
        assert!(err.to_string().contains("scope missing"));
    }
}
