//! NurtureFlow CRM back-end for GoHighLevel.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  HTTP  ┌──────────────────────────────────────────────────┐
//! │ Frontend │ ─────> │  server.rs  (router, TraceLayer, CORS)           │
//! │   / GHL  │ <───── │    └─ api.rs  (handlers, AppState, ApiError)     │
//! └──────────┘        │         │                                        │
//!                     │         ├─ oauth.rs     authorize / callback     │
//!                     │         ├─ tokens.rs    refresh, per-install lock│
//!                     │         ├─ webhook.rs   HMAC + event handling    │
//!                     │         ├─ contacts.rs  contact import           │
//!                     │         └─ knowledge.rs chunking                 │
//!                     │                  │                               │
//!                     │   ghl.rs (reqwest client)    db.rs (SQLite)      │
//!                     └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Rows and view types: `Installation`, `Lead`, `Message`  |
//! | `db`       | SQLite access via `DbHandle` (`Arc<Mutex<_>>`)          |
//! | `ghl`      | GoHighLevel OAuth token and REST calls                  |
//!
//! ## Message approval flow
//!
//! 1. `POST /api/leads/{id}/messages` stores a `pending` draft.
//! 2. `approve`, `reject` or `schedule` move it out of `pending`; each is a
//!    single conditional UPDATE so two reviewers cannot both win.
//! 3. `sent` closes out an approved or scheduled message.

pub mod api;
pub mod contacts;
pub mod db;
pub mod ghl;
pub mod knowledge;
pub mod models;
pub mod oauth;
pub mod server;
pub mod tokens;
pub mod webhook;

#[cfg(test)]
mod mock_ghl;
