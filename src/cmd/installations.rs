//! Installation management: `nurtureflow installations`.

use anyhow::{Context, Result};
use chrono::Utc;

use nurtureflow::config::NurtureConfig;
use nurtureflow::crm::db::DbHandle;
use nurtureflow::crm::ghl::GhlClient;
use nurtureflow::crm::server::open_database;
use nurtureflow::crm::tokens::TokenManager;

use super::super::InstallationsCommands;

pub async fn cmd_installations(
    config: &NurtureConfig,
    command: InstallationsCommands,
) -> Result<()> {
    let db = DbHandle::new(open_database(&config.server.db_path)?);

    match command {
        InstallationsCommands::List => {
            let installations = db.lock_sync()?.list_installations()?;
            if installations.is_empty() {
                println!("No installations found.");
                return Ok(());
            }
            let now = Utc::now();
            println!(
                "{:<5} {:<24} {:<24} {:<26} TOKEN",
                "ID", "LOCATION", "COMPANY", "EXPIRES"
            );
            for inst in installations {
                let state = if inst.token_expires_at > now {
                    "valid"
                } else {
                    "expired"
                };
                println!(
                    "{:<5} {:<24} {:<24} {:<26} {}",
                    inst.id,
                    inst.location_name.as_deref().unwrap_or(&inst.location_id),
                    inst.company_name.as_deref().unwrap_or(&inst.company_id),
                    inst.token_expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    state
                );
            }
        }
        InstallationsCommands::Refresh { id, force } => {
            let ghl = GhlClient::from_config(&config.ghl)?;
            let tokens = TokenManager::new(db, ghl, config.ghl.refresh_skew_secs);
            let outcome = if force {
                tokens.force_refresh(id).await
            } else {
                tokens.ensure_fresh(id).await
            }
            .with_context(|| format!("Failed to refresh installation {}", id))?;
            let expires = outcome.installation().token_expires_at;
            if outcome.was_refreshed() {
                println!("Installation {} refreshed; token expires at {}", id, expires);
            } else {
                println!("Installation {} token still valid until {}", id, expires);
            }
        }
        InstallationsCommands::Disconnect { id } => {
            if db.lock_sync()?.delete_installation(id)? {
                println!("Installation {} disconnected", id);
            } else {
                anyhow::bail!("Installation {} not found", id);
            }
        }
    }

    Ok(())
}
