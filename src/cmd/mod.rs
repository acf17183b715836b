//! CLI command implementations.
//!
//! | Module          | Commands handled                  |
//! |-----------------|-----------------------------------|
//! | `serve`         | `Serve`, `InitDb`                 |
//! | `installations` | `Installations`                   |

pub mod installations;
pub mod serve;

pub use installations::cmd_installations;
pub use serve::{cmd_init_db, cmd_serve};

use anyhow::Result;
use nurtureflow::config::NurtureConfig;

use super::Cli;

/// Resolve configuration: file, then environment, then global CLI flags.
pub fn load_config(cli: &Cli) -> Result<NurtureConfig> {
    let mut config = NurtureConfig::load(cli.config.as_deref())?;
    if let Some(db_path) = &cli.db_path {
        config.server.db_path = db_path.clone();
    }
    Ok(config)
}
