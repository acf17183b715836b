use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::db::DbHandle;
use super::ghl::GhlClient;
use super::models::Installation;
use crate::errors::CrmError;

/// Whether a token expiring at `expires_at` must be refreshed at `now`.
/// Tokens count as stale once they are within `skew` of expiring.
pub fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>, skew: Duration) -> bool {
    expires_at <= now + skew
}

#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The stored token was still fresh; nothing was sent upstream.
    Fresh(Installation),
    /// A refresh grant ran and the new tokens were stored.
    Refreshed(Installation),
}

impl RefreshOutcome {
    pub fn installation(&self) -> &Installation {
        match self {
            Self::Fresh(i) | Self::Refreshed(i) => i,
        }
    }

    pub fn into_installation(self) -> Installation {
        match self {
            Self::Fresh(i) | Self::Refreshed(i) => i,
        }
    }

    pub fn was_refreshed(&self) -> bool {
        matches!(self, Self::Refreshed(_))
    }
}

/// Keeps installation tokens fresh. Refreshes for one installation are
/// serialized; the expiry is re-checked after the lock is taken so
/// concurrent callers share a single upstream refresh.
#[derive(Clone)]
pub struct TokenManager {
    db: DbHandle,
    ghl: GhlClient,
    skew: Duration,
    locks: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl TokenManager {
    pub fn new(db: DbHandle, ghl: GhlClient, skew_secs: i64) -> Self {
        Self {
            db,
            ghl,
            skew: Duration::seconds(skew_secs),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, installation_id: i64) -> Result<Arc<tokio::sync::Mutex<()>>, CrmError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| CrmError::Database(anyhow::anyhow!("Refresh lock map poisoned: {}", e)))?;
        Ok(locks.entry(installation_id).or_default().clone())
    }

    async fn load(&self, installation_id: i64) -> Result<Installation, CrmError> {
        self.db
            .call(move |db| db.require_installation(installation_id))
            .await
            .map_err(CrmError::from_db)
    }

    /// Refresh the installation's tokens if they expire within the skew
    /// window. A fresh token is returned untouched with no HTTP call.
    pub async fn ensure_fresh(&self, installation_id: i64) -> Result<RefreshOutcome, CrmError> {
        let installation = self.load(installation_id).await?;
        if !needs_refresh(installation.token_expires_at, Utc::now(), self.skew) {
            return Ok(RefreshOutcome::Fresh(installation));
        }

        let lock = self.lock_for(installation_id)?;
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let installation = self.load(installation_id).await?;
        if !needs_refresh(installation.token_expires_at, Utc::now(), self.skew) {
            return Ok(RefreshOutcome::Fresh(installation));
        }
        self.refresh_locked(installation).await
    }

    /// Refresh regardless of expiry.
    pub async fn force_refresh(&self, installation_id: i64) -> Result<RefreshOutcome, CrmError> {
        let lock = self.lock_for(installation_id)?;
        let _guard = lock.lock().await;
        let installation = self.load(installation_id).await?;
        self.refresh_locked(installation).await
    }

    /// A usable access token, refreshed first if needed.
    pub async fn access_token(&self, installation_id: i64) -> Result<String, CrmError> {
        let outcome = self.ensure_fresh(installation_id).await?;
        Ok(outcome.into_installation().access_token)
    }

    async fn refresh_locked(&self, installation: Installation) -> Result<RefreshOutcome, CrmError> {
        let id = installation.id;
        info!(
            installation_id = id,
            location_id = %installation.location_id,
            expires_at = %installation.token_expires_at,
            "Refreshing GoHighLevel token"
        );
        let grant = match self.ghl.refresh(&installation.refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(installation_id = id, error = %e, "Token refresh failed");
                return Err(e.into());
            }
        };
        let expires_at = grant.expires_at(Utc::now())?;
        let updated = self
            .db
            .call(move |db| {
                db.update_installation_tokens(id, &grant.access_token, &grant.refresh_token, expires_at)
            })
            .await
            .map_err(CrmError::from_db)?;
        info!(installation_id = id, expires_at = %updated.token_expires_at, "Token refreshed");
        Ok(RefreshOutcome::Refreshed(updated))
    }
}
