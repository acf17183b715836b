//! Server and database setup commands: `nurtureflow serve`, `nurtureflow init-db`.

use anyhow::Result;
use nurtureflow::config::NurtureConfig;
use nurtureflow::crm::server;

pub async fn cmd_serve(config: NurtureConfig) -> Result<()> {
    server::start_server(config).await
}

pub fn cmd_init_db(config: &NurtureConfig) -> Result<()> {
    let db = server::open_database(&config.server.db_path)?;
    let tables = db.table_names()?;
    println!(
        "Database initialized at {} ({} tables)",
        config.server.db_path.display(),
        tables.len()
    );
    Ok(())
}
