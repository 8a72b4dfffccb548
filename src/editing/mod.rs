//! Live editing sessions for automated form flows.
//!
//! ## Overview
//!
//! A subject (a task or an analysis) carries a correction set: ordered steps,
//! each with fields, describing how to fill a multi-page web form. A human
//! corrects it by driving a live browser session hosted by a remote
//! automation engine, saving drafts as they go, and finally confirming the
//! draft into persisted steps and fields with sensitive values sealed.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Editor  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │   (UI)   │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!      ^     (ws.rs)    │         v                                        │
//!      │                │  lifecycle.rs  (SessionManager)                  │
//!      │                │    ├─ login.rs   (LoginOrchestrator)             │
//!      │                │    ├─ commit.rs  (ConfirmationCommitter)         │
//!      │                │    └─ sweeper.rs (ExpirySweeper)                 │
//!      │                │         │                                        │
//!      │                │         v                                        │
//! ┌──────────┐ callbacks│  remote.rs  (AutomationEngine trait, HTTP proxy) │
//! │  Engine  │ <──────> │                                                  │
//! └──────────┘          └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | `EditableSubject`, `PersistedStep`, `LoginMetadata`         |
//! | `db`      | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `draft`   | `DraftStore`: last-write-wins draft persistence             |
//! | `graph`   | Dependency and field-order validation with violation detail |
//! | `sealer`  | `SecretSealer` trait, ChaCha20-Poly1305 implementation      |
//! | `ws`      | `EditingEvent` enum + `broadcast_event()` helper            |
//!
//! ## Typical Flow
//!
//! 1. `POST /api/subjects/{id}/editing/start` opens a remote session seeded
//!    with the draft (or the initial result) and broadcasts `session-started`.
//! 2. The editor issues commands and autosaves with
//!    `PUT /api/subjects/{id}/editing/draft`.
//! 3. If the session sits on a login page,
//!    `POST /api/subjects/{id}/editing/execute-login` submits it; progress
//!    streams back over the subject's channel and discovered steps are
//!    appended to the draft.
//! 4. `POST /api/subjects/{id}/editing/confirm` validates, seals, and replaces
//!    all persisted steps in one transaction, then closes the remote session.
//! 5. Sessions left open past their expiry are cancelled by the sweeper.

pub mod api;
pub mod commit;
pub mod db;
pub mod draft;
pub mod graph;
pub mod lifecycle;
pub mod login;
pub mod models;
pub mod remote;
pub mod sealer;
pub mod server;
pub mod sweeper;
pub mod ws;
