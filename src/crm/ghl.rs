use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url, header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::LeadUpsert;
use crate::config::GhlSection;
use crate::errors::GhlError;

/// Seconds assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_EXPIRES_IN: i64 = 86_400;
/// Longest token lifetime accepted from the token endpoint (one year).
pub const MAX_EXPIRES_IN: i64 = 365 * 86_400;

/// Raw body of GoHighLevel's `/oauth/token` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(rename = "access_token")]
    pub access_token: Option<String>,
    #[serde(rename = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expires_in")]
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub location_id: Option<String>,
    pub company_id: Option<String>,
    pub user_type: Option<String>,
}

/// A token response that carried both tokens.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub scope: Option<String>,
    pub location_id: Option<String>,
    pub company_id: Option<String>,
}

impl TokenGrant {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, GhlError> {
        chrono::Duration::try_seconds(self.expires_in)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| expires_in_out_of_range(self.expires_in))
    }
}

fn expires_in_out_of_range(expires_in: i64) -> GhlError {
    GhlError::UnexpectedBody(format!("expires_in out of range: {}", expires_in))
}

impl TryFrom<TokenResponse> for TokenGrant {
    type Error = GhlError;

    fn try_from(resp: TokenResponse) -> Result<Self, Self::Error> {
        let access_token = resp
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(GhlError::MissingField {
                field: "access_token",
            })?;
        let refresh_token = resp
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or(GhlError::MissingField {
                field: "refresh_token",
            })?;
        let expires_in = resp.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        if !(0..=MAX_EXPIRES_IN).contains(&expires_in) {
            return Err(expires_in_out_of_range(expires_in));
        }
        Ok(Self {
            access_token,
            refresh_token,
            expires_in,
            scope: resp.scope,
            location_id: resp.location_id.filter(|s| !s.is_empty()),
            company_id: resp.company_id.filter(|s| !s.is_empty()),
        })
    }
}

/// Location details from the "current location" lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationInfo {
    pub id: Option<String>,
    pub company_id: Option<String>,
    pub name: Option<String>,
}

/// A GoHighLevel contact (subset of fields). Also the shape of the
/// `contact` object carried by contact webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GhlContact {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl GhlContact {
    pub fn to_lead_upsert(&self, installation_id: i64) -> LeadUpsert {
        LeadUpsert {
            installation_id,
            ghl_contact_id: self.id.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            tags: self.tags.clone(),
            last_activity: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContactsPage {
    #[serde(default)]
    contacts: Vec<GhlContact>,
}

/// HTTP client for GoHighLevel's OAuth and REST endpoints.
#[derive(Clone)]
pub struct GhlClient {
    http: reqwest::Client,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: String,
    marketplace_url: String,
    services_url: String,
    scopes: Vec<String>,
    api_version: String,
    user_type: String,
}

impl GhlClient {
    pub fn from_config(config: &GhlSection) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("nurtureflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self::with_http(config, http))
    }

    pub fn with_http(config: &GhlSection, http: reqwest::Client) -> Self {
        Self {
            http,
            client_id: config.client_id.clone().filter(|s| !s.is_empty()),
            client_secret: config.client_secret.clone().filter(|s| !s.is_empty()),
            redirect_uri: config.redirect_uri.clone(),
            marketplace_url: config.marketplace_url.trim_end_matches('/').to_string(),
            services_url: config.services_url.trim_end_matches('/').to_string(),
            scopes: config.scopes.clone(),
            api_version: config.api_version.clone(),
            user_type: config.user_type.clone(),
        }
    }

    pub fn has_client_id(&self) -> bool {
        self.client_id.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str), GhlError> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => Err(GhlError::MissingCredentials),
        }
    }

    /// The marketplace "choose location" URL the user is sent to.
    pub fn authorize_url(&self, state: &str) -> Result<String, GhlError> {
        let client_id = self.client_id.as_deref().ok_or(GhlError::MissingCredentials)?;
        let scope = self.scopes.join(" ");
        let url = Url::parse_with_params(
            &format!("{}/oauth/chooselocation", self.marketplace_url),
            &[
                ("response_type", "code"),
                ("client_id", client_id),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| GhlError::InvalidUrl(e.to_string()))?;
        Ok(url.into())
    }

    /// Trade an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, GhlError> {
        let (client_id, client_secret) = self.credentials()?;
        debug!(code = "present", "Exchanging authorization code");
        let resp = self
            .http
            .post(format!("{}/oauth/token", self.services_url))
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("user_type", self.user_type.as_str()),
            ])
            .send()
            .await?;
        let body: TokenResponse = decode(resp).await?;
        TokenGrant::try_from(body)
    }

    /// Run a refresh-token grant.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, GhlError> {
        let (client_id, client_secret) = self.credentials()?;
        debug!(refresh_token = "present", "Refreshing access token");
        let resp = self
            .http
            .post(format!("{}/oauth/token", self.services_url))
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("user_type", self.user_type.as_str()),
            ])
            .send()
            .await?;
        let body: TokenResponse = decode(resp).await?;
        TokenGrant::try_from(body)
    }

    /// Look up the location the access token belongs to.
    pub async fn current_location(&self, access_token: &str) -> Result<LocationInfo, GhlError> {
        let resp = self
            .http
            .get(format!("{}/locations/v1/location", self.services_url))
            .bearer_auth(access_token)
            .header("Version", self.api_version.as_str())
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let body: serde_json::Value = decode(resp).await?;
        // Accept both `{location: {...}}` and a bare location object
        let location = body.get("location").cloned().unwrap_or(body);
        serde_json::from_value(location).map_err(|e| GhlError::UnexpectedBody(e.to_string()))
    }

    /// First page (up to 100) of a location's contacts.
    pub async fn list_contacts(
        &self,
        access_token: &str,
        location_id: &str,
    ) -> Result<Vec<GhlContact>, GhlError> {
        let resp = self
            .http
            .get(format!("{}/contacts/", self.services_url))
            .bearer_auth(access_token)
            .header("Version", self.api_version.as_str())
            .header(header::ACCEPT, "application/json")
            .query(&[("locationId", location_id), ("limit", "100")])
            .send()
            .await?;
        let page: ContactsPage = decode(resp).await?;
        debug!(count = page.contacts.len(), "Fetched contacts");
        Ok(page.contacts)
    }
}

/// Decode a GoHighLevel response, keeping enough of a failed body for the
/// user to see what went wrong.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, GhlError> {
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let body = resp.text().await?;
    classify_body(status, &content_type, &body)
}

fn classify_body<T: DeserializeOwned>(
    status: StatusCode,
    content_type: &str,
    body: &str,
) -> Result<T, GhlError> {
    let code = status.as_u16();
    if looks_like_html(content_type, body) {
        return Err(GhlError::Html { status: code });
    }
    let json: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => {
            return Err(GhlError::NonJson {
                status: code,
                snippet: snippet(body),
            });
        }
    };
    if !status.is_success() {
        return Err(GhlError::Status {
            status: code,
            body: body.to_string(),
        });
    }
    serde_json::from_value(json).map_err(|e| GhlError::UnexpectedBody(e.to_string()))
}

fn looks_like_html(content_type: &str, body: &str) -> bool {
    if content_type.contains("text/html") {
        return true;
    }
    let head: String = body.trim_start().chars().take(64).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// First 200 chars of a body.
pub fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
