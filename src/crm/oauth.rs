use chrono::{Duration, Utc};
use reqwest::Url;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::db::DbHandle;
use super::ghl::{GhlClient, LocationInfo};
use super::models::{Installation, NewInstallation};
use crate::errors::CrmError;

/// Query string of `GET /oauth/callback`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "locationId")]
    pub location_id: Option<String>,
    #[serde(rename = "companyId")]
    pub company_id: Option<String>,
}

/// Authorization-code flow: issue a state, then turn the callback into a
/// stored installation.
#[derive(Clone)]
pub struct OAuthFlow {
    db: DbHandle,
    ghl: GhlClient,
    frontend_base: String,
    state_ttl: Duration,
}

impl OAuthFlow {
    pub fn new(db: DbHandle, ghl: GhlClient, frontend_base: &str, state_ttl_secs: i64) -> Self {
        Self {
            db,
            ghl,
            frontend_base: frontend_base.trim_end_matches('/').to_string(),
            state_ttl: Duration::seconds(state_ttl_secs),
        }
    }

    /// Persist a fresh state and return the marketplace URL to redirect to.
    pub async fn begin(&self, location_hint: Option<String>) -> Result<String, CrmError> {
        if !self.ghl.has_client_id() {
            return Err(CrmError::Config("GHL_CLIENT_ID is not configured".to_string()));
        }
        let state = Uuid::new_v4().to_string();
        let cutoff = Utc::now() - self.state_ttl;
        let stored = state.clone();
        self.db
            .call(move |db| {
                db.purge_expired_oauth_states(cutoff)?;
                db.create_oauth_state(&stored, location_hint.as_deref())
            })
            .await
            .map_err(CrmError::from_db)?;
        let url = self.ghl.authorize_url(&state)?;
        info!("Redirecting to GoHighLevel authorization");
        Ok(url)
    }

    /// Validate the callback, exchange the code and upsert the installation.
    pub async fn complete(&self, params: CallbackParams) -> Result<Installation, CrmError> {
        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CrmError::BadRequest("Missing authorization code".to_string()))?;
        let state = params
            .state
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CrmError::InvalidState("missing state parameter".to_string()))?;

        let stored = self
            .db
            .call(move |db| db.take_oauth_state(&state))
            .await
            .map_err(CrmError::from_db)?
            .ok_or_else(|| CrmError::InvalidState("unknown or already used state".to_string()))?;
        if stored.created_at + self.state_ttl < Utc::now() {
            return Err(CrmError::InvalidState("state has expired".to_string()));
        }

        let grant = self.ghl.exchange_code(code).await?;
        info!(
            access_token = "present",
            refresh_token = "present",
            expires_in = grant.expires_in,
            "Authorization code exchanged"
        );

        let mut location_id = grant
            .location_id
            .clone()
            .or_else(|| params.location_id.clone().filter(|s| !s.is_empty()));
        let mut company_id = grant
            .company_id
            .clone()
            .or_else(|| params.company_id.clone().filter(|s| !s.is_empty()));
        let mut location_name = None;

        if location_id.is_none() || company_id.is_none() {
            match self.ghl.current_location(&grant.access_token).await {
                Ok(LocationInfo {
                    id,
                    company_id: company,
                    name,
                }) => {
                    location_id = location_id.or(id);
                    company_id = company_id.or(company);
                    location_name = name;
                }
                Err(e) => warn!(error = %e, "Location lookup failed"),
            }
        }
        let location_id = location_id
            .or(stored.location_id)
            .ok_or_else(|| CrmError::BadRequest("Missing location ID in OAuth response".to_string()))?;
        let company_id = company_id
            .ok_or_else(|| CrmError::BadRequest("Missing company ID in OAuth response".to_string()))?;

        let new = NewInstallation {
            location_id,
            company_id,
            location_name,
            company_name: None,
            token_expires_at: grant.expires_at(Utc::now())?,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            scope: grant.scope,
        };
        let installation = self
            .db
            .call(move |db| db.upsert_installation(&new))
            .await
            .map_err(CrmError::from_db)?;
        info!(
            installation_id = installation.id,
            location_id = %installation.location_id,
            company_id = %installation.company_id,
            "Installation stored"
        );
        Ok(installation)
    }

    /// Where the browser goes after the callback.
    pub fn redirect_for(&self, result: &Result<Installation, CrmError>) -> String {
        match result {
            Ok(installation) => settings_url(
                &self.frontend_base,
                &[
                    ("integration", "success"),
                    ("location", installation.location_id.as_str()),
                ],
            ),
            Err(e) => {
                let message = e.to_string();
                settings_url(
                    &self.frontend_base,
                    &[("integration", "error"), ("message", message.as_str())],
                )
            }
        }
    }
}

fn settings_url(frontend_base: &str, pairs: &[(&str, &str)]) -> String {
    let base = format!("{}/settings", frontend_base);
    match Url::parse_with_params(&base, pairs) {
        Ok(url) => url.into(),
        Err(_) => {
            let query = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, percent_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            format!("{}?{}", base, query)
        }
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::db::NurtureDb;
    use crate::crm::mock_ghl::{MockBehavior, MockGhl, MockResponse};
    use crate::errors::GhlError;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn flow(mock: &MockGhl) -> (DbHandle, OAuthFlow) {
        let db = DbHandle::new(NurtureDb::new_in_memory().unwrap());
        let flow = OAuthFlow::new(db.clone(), mock.client(), "http://app.test/", 600);
        (db, flow)
    }

    fn query_of(url: &str) -> HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    async fn issued_state(flow: &OAuthFlow) -> String {
        let url = flow.begin(None).await.unwrap();
        query_of(&url)["state"].clone()
    }

    fn params(code: &str, state: &str) -> CallbackParams {
        CallbackParams {
            code: Some(code.to_string()),
            state: Some(state.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_begin_persists_state() {
        let mock = MockGhl::start().await;
        let (db, flow) = flow(&mock);
        let url = flow.begin(Some("loc-9".into())).await.unwrap();
        assert!(url.starts_with(&format!("{}/oauth/chooselocation?", mock.base_url)));
        let state = query_of(&url)["state"].clone();
        let stored = db.lock_sync().unwrap().take_oauth_state(&state).unwrap();
        assert_eq!(stored.unwrap().location_id.as_deref(), Some("loc-9"));
    }

    #[tokio::test]
    async fn test_begin_without_client_id() {
        let mock = MockGhl::start().await;
        let db = DbHandle::new(NurtureDb::new_in_memory().unwrap());
        let mut section = mock.ghl_section();
        section.client_id = None;
        let flow = OAuthFlow::new(db, GhlClient::with_http(&section, reqwest::Client::new()), "http://app.test", 600);
        assert!(matches!(flow.begin(None).await, Err(CrmError::Config(_))));
    }

    #[tokio::test]
    async fn test_callback_success_upserts_installation() {
        let mock = MockGhl::start().await;
        let (db, flow) = flow(&mock);
        let state = issued_state(&flow).await;

        let result = flow.complete(params("code-1", &state)).await;
        let redirect = flow.redirect_for(&result);
        let inst = result.unwrap();
        assert_eq!(inst.location_id, "loc-1");
        assert_eq!(inst.company_id, "comp-1");
        assert_eq!(
            redirect,
            "http://app.test/settings?integration=success&location=loc-1"
        );
        // Ids came from the token payload, so no lookup happened
        assert_eq!(mock.calls.location.load(Ordering::SeqCst), 0);
        assert_eq!(db.lock_sync().unwrap().count_installations().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_callback_falls_back_to_location_lookup() {
        let mock = MockGhl::start_with(MockBehavior {
            token: MockResponse::json(
                200,
                json!({"access_token": "a", "refresh_token": "r", "expires_in": 3600}),
            ),
            ..MockBehavior::default()
        })
        .await;
        let (_db, flow) = flow(&mock);
        let state = issued_state(&flow).await;
        let inst = flow.complete(params("c", &state)).await.unwrap();
        assert_eq!(inst.location_id, "loc-1");
        assert_eq!(inst.company_id, "comp-1");
        assert_eq!(inst.location_name.as_deref(), Some("Mock Location"));
        assert_eq!(mock.calls.location.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_query_ids_used_when_token_lacks_them() {
        let mock = MockGhl::start_with(MockBehavior {
            token: MockResponse::json(200, json!({"access_token": "a", "refresh_token": "r"})),
            ..MockBehavior::default()
        })
        .await;
        let (_db, flow) = flow(&mock);
        let state = issued_state(&flow).await;
        let mut p = params("c", &state);
        p.location_id = Some("loc-q".into());
        p.company_id = Some("comp-q".into());
        let inst = flow.complete(p).await.unwrap();
        assert_eq!(inst.location_id, "loc-q");
        assert_eq!(inst.company_id, "comp-q");
        assert_eq!(mock.calls.location.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_callback_missing_ids_everywhere_fails() {
        let mock = MockGhl::start_with(MockBehavior {
            token: MockResponse::json(200, json!({"access_token": "a", "refresh_token": "r"})),
            location: MockResponse::json(404, json!({"message": "not found"})),
            ..MockBehavior::default()
        })
        .await;
        let (db, flow) = flow(&mock);
        let state = issued_state(&flow).await;
        let result = flow.complete(params("c", &state)).await;
        assert!(flow.redirect_for(&result).contains("integration=error"));
        assert_eq!(db.lock_sync().unwrap().count_installations().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_callback_missing_code_or_state() {
        let mock = MockGhl::start().await;
        let (_db, flow) = flow(&mock);
        for p in [
            CallbackParams::default(),
            params("", "s"),
            params("c", ""),
            CallbackParams {
                code: Some("c".into()),
                ..Default::default()
            },
        ] {
            let result = flow.complete(p).await;
            let redirect = flow.redirect_for(&result);
            assert!(redirect.starts_with("http://app.test/settings?integration=error&message="));
        }
        assert_eq!(mock.token_calls(), 0);
    }

    #[tokio::test]
    async fn test_callback_state_is_single_use() {
        let mock = MockGhl::start().await;
        let (_db, flow) = flow(&mock);
        let state = issued_state(&flow).await;
        flow.complete(params("c", &state)).await.unwrap();
        let replay = flow.complete(params("c", &state)).await;
        assert!(matches!(replay, Err(CrmError::InvalidState(_))));
        assert_eq!(mock.token_calls(), 1);
    }

    #[tokio::test]
    async fn test_callback_unknown_state() {
        let mock = MockGhl::start().await;
        let (_db, flow) = flow(&mock);
        let result = flow.complete(params("c", "forged")).await;
        assert!(matches!(result, Err(CrmError::InvalidState(_))));
        assert_eq!(mock.token_calls(), 0);
    }

    #[tokio::test]
    async fn test_callback_expired_state() {
        let mock = MockGhl::start().await;
        let db = DbHandle::new(NurtureDb::new_in_memory().unwrap());
        let flow = OAuthFlow::new(db.clone(), mock.client(), "http://app.test", -1);
        db.lock_sync().unwrap().create_oauth_state("old", None).unwrap();
        let result = flow.complete(params("c", "old")).await;
        match result {
            Err(CrmError::InvalidState(msg)) => assert!(msg.contains("expired")),
            other => panic!("Expected expired state, got {:?}", other.map(|i| i.id)),
        }
        assert_eq!(mock.token_calls(), 0);
    }

    #[tokio::test]
    async fn test_callback_token_error_surfaces_upstream_body() {
        let mock = MockGhl::start_with(MockBehavior {
            token: MockResponse::text(500, "text/html", "<html><body>oops</body></html>"),
            ..MockBehavior::default()
        })
        .await;
        let (_db, flow) = flow(&mock);
        let state = issued_state(&flow).await;
        let result = flow.complete(params("c", &state)).await;
        let redirect = flow.redirect_for(&result);
        let q = query_of(&redirect);
        assert_eq!(q["integration"], "error");
        assert!(q["message"].contains("redirect URI"));
    }

    #[tokio::test]
    async fn test_callback_absurd_expiry_redirects_with_error() {
        let mock = MockGhl::start_with(MockBehavior {
            token: MockResponse::json(
                200,
                json!({
                    "access_token": "a",
                    "refresh_token": "r",
                    "expires_in": 9_000_000_000_000_000_000_i64,
                    "locationId": "loc-1",
                    "companyId": "comp-1"
                }),
            ),
            ..MockBehavior::default()
        })
        .await;
        let (db, flow) = flow(&mock);
        let state = issued_state(&flow).await;
        let result = flow.complete(params("c", &state)).await;
        assert!(matches!(result, Err(CrmError::Ghl(GhlError::UnexpectedBody(_)))));
        let q = query_of(&flow.redirect_for(&result));
        assert_eq!(q["integration"], "error");
        assert!(q["message"].contains("expires_in"));
        assert_eq!(db.lock_sync().unwrap().count_installations().unwrap(), 0);
    }

    #[test]
    fn test_settings_url_encodes_message() {
        let url = settings_url(
            "http://app.test",
            &[("integration", "error"), ("message", "a&b=c")],
        );
        let q = query_of(&url);
        assert_eq!(q["message"], "a&b=c");
    }

    #[test]
    fn test_settings_url_relative_base_fallback() {
        let url = settings_url("", &[("integration", "error"), ("message", "bad state")]);
        assert_eq!(url, "/settings?integration=error&message=bad%20state");
    }
}
