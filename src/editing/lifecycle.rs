//! Session lifecycle: start, resume, save draft, cancel and the proxied
//! live-editing commands.
//!
//! State machine: `idle -> active -> {confirmed | cancelled}`, with expiry
//! also moving `active` to `cancelled`. At most one remote session exists
//! per subject; a new one is only opened after the previous one has been
//! asked to close (stop-before-start). The close is best-effort.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use stepwright_common::{CorrectionSet, LoginPhase, Step};

use super::db::DbHandle;
use super::draft::DraftStore;
use super::login::LoginRegistry;
use super::models::{EditableSubject, SessionOpened};
use super::remote::{AutomationEngine, OpenSession, SelectorMatch};
use super::ws::{EditingEvent, EventSender, broadcast_event};
use crate::errors::{EditingError, RemoteError};

/// Timing knobs for editing sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ttl: chrono::Duration,
    pub open_timeout: Duration,
    pub command_timeout: Duration,
    pub login_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::minutes(30),
            open_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
            login_timeout: Duration::from_secs(3600),
        }
    }
}

/// Run an engine call under a deadline.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::timeout(operation)),
    }
}

#[derive(Clone)]
pub struct SessionManager {
    pub(crate) db: DbHandle,
    pub(crate) drafts: DraftStore,
    pub(crate) engine: Arc<dyn AutomationEngine>,
    pub(crate) events: EventSender,
    pub(crate) settings: Arc<SessionSettings>,
    pub(crate) logins: LoginRegistry,
}

impl SessionManager {
    pub fn new(
        db: DbHandle,
        engine: Arc<dyn AutomationEngine>,
        events: EventSender,
        settings: SessionSettings,
    ) -> Self {
        Self {
            drafts: DraftStore::new(db.clone()),
            db,
            engine,
            events,
            settings: Arc::new(settings),
            logins: LoginRegistry::default(),
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub async fn load(&self, subject_id: i64) -> Result<EditableSubject, EditingError> {
        self.db
            .call(move |db| db.get_subject(subject_id))
            .await?
            .ok_or(EditingError::SubjectNotFound { id: subject_id })
    }

    /// Load a subject, rejecting callers that do not own it.
    pub async fn load_owned(&self, user_id: i64, subject_id: i64) -> Result<EditableSubject, EditingError> {
        let subject = self.load(subject_id).await?;
        if subject.owner_id != user_id {
            return Err(EditingError::Forbidden { subject_id, user_id });
        }
        Ok(subject)
    }

    pub(crate) fn require_session(subject: &EditableSubject) -> Result<(), EditingError> {
        if subject.is_editing() && subject.remote_session_id.is_some() {
            Ok(())
        } else {
            Err(EditingError::NoActiveSession {
                subject_id: subject.id,
            })
        }
    }

    // ── Remote plumbing ──────────────────────────────────────────────

    /// Proxy call under the command deadline. A missing remote session is
    /// turned into the reset signal and the local handle is dropped.
    pub(crate) async fn remote<T, F>(&self, subject_id: i64, operation: &str, fut: F) -> Result<T, EditingError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match with_timeout(operation, self.settings.command_timeout, fut).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e == RemoteError::NotFound {
                    self.on_session_lost(subject_id).await;
                } else {
                    tracing::warn!(subject_id, operation, error = %e, "remote call failed");
                }
                Err(EditingError::from_remote(subject_id, e))
            }
        }
    }

    async fn on_session_lost(&self, subject_id: i64) {
        tracing::warn!(subject_id, "remote session lost; editor must restart");
        if let Err(e) = self.db.call(move |db| db.clear_remote_session(subject_id)).await {
            tracing::error!(subject_id, error = %e, "failed to clear remote session handle");
        }
        broadcast_event(
            &self.events,
            subject_id,
            EditingEvent::SessionLost {
                message: "The live session ended on the automation engine. Restart editing.".into(),
            },
        );
    }

    /// Ask the engine to close the subject's session. Failures are logged.
    pub(crate) async fn close_best_effort(&self, subject_id: i64) {
        match with_timeout("close", self.settings.command_timeout, self.engine.close(subject_id)).await {
            Ok(()) => tracing::debug!(subject_id, "remote session closed"),
            Err(RemoteError::NotFound) => tracing::debug!(subject_id, "remote session already gone"),
            Err(e) => tracing::warn!(subject_id, error = %e, "failed to close remote session"),
        }
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Open a session seeded with the draft, or the detected result when
    /// there is no draft yet.
    pub async fn start(
        &self,
        user_id: i64,
        subject_id: i64,
        url_override: Option<String>,
    ) -> Result<EditableSubject, EditingError> {
        let subject = self.load_owned(user_id, subject_id).await?;
        if !subject.status.can_start_editing() {
            return Err(EditingError::InvalidState(format!(
                "cannot start editing a subject in status '{}'",
                subject.status
            )));
        }
        let url = url_override.unwrap_or_else(|| subject.default_editing_url());
        let document = subject.seed_document();
        self.open_session(subject, url, document).await
    }

    /// Re-open a session at the last editing URL from the existing draft.
    pub async fn resume(&self, user_id: i64, subject_id: i64) -> Result<EditableSubject, EditingError> {
        let subject = self.load_owned(user_id, subject_id).await?;
        if !subject.has_draft() {
            return Err(EditingError::InvalidState(
                "no draft to resume; start a new editing session".into(),
            ));
        }
        if !subject.status.can_start_editing() {
            return Err(EditingError::InvalidState(format!(
                "cannot resume editing a subject in status '{}'",
                subject.status
            )));
        }
        let url = subject.default_editing_url();
        let document = subject.draft.clone().unwrap_or_default();
        self.open_session(subject, url, document).await
    }

    async fn open_session(
        &self,
        subject: EditableSubject,
        url: String,
        document: CorrectionSet,
    ) -> Result<EditableSubject, EditingError> {
        let subject_id = subject.id;

        if subject.is_editing() {
            self.logins.abort(subject_id);
            self.close_best_effort(subject_id).await;
        }

        let is_login_step = document.step_for_url(&url).is_some_and(Step::is_login)
            || (subject.requires_login && subject.login_url.as_deref() == Some(url.as_str()));
        let login_phase = if subject.requires_login || document.login_step().is_some() {
            Some(if is_login_step {
                LoginPhase::Login
            } else {
                LoginPhase::Target
            })
        } else {
            None
        };

        let request = OpenSession {
            url: url.clone(),
            document,
            is_login_step,
        };
        let remote = with_timeout(
            "open",
            self.settings.open_timeout,
            self.engine.open(subject_id, request),
        )
        .await
        .map_err(|e| {
            tracing::warn!(subject_id, error = %e, "failed to open remote session");
            EditingError::Remote(e)
        })?;

        let started_at = Utc::now();
        let opened = SessionOpened {
            remote_session_id: remote.session_id,
            editing_url: url,
            started_at,
            expires_at: started_at + self.settings.ttl,
            login_phase,
        };
        let expires_at = opened.expires_at;
        let updated = self
            .db
            .call(move |db| db.mark_session_opened(subject_id, &opened))
            .await?;

        tracing::info!(
            subject_id,
            remote_session_id = updated.remote_session_id.as_deref().unwrap_or_default(),
            is_login_step,
            "editing session started"
        );
        broadcast_event(
            &self.events,
            subject_id,
            EditingEvent::SessionStarted {
                editing_url: updated.default_editing_url(),
                expires_at,
                login_phase,
            },
        );
        Ok(updated)
    }

    /// Overwrite the draft. No validation happens here.
    pub async fn save_draft(
        &self,
        user_id: i64,
        subject_id: i64,
        draft: CorrectionSet,
    ) -> Result<i64, EditingError> {
        self.load_owned(user_id, subject_id).await?;
        let version = self.drafts.save(subject_id, draft).await?;
        broadcast_event(&self.events, subject_id, EditingEvent::DraftSaved { version });
        Ok(version)
    }

    pub async fn load_draft(
        &self,
        user_id: i64,
        subject_id: i64,
    ) -> Result<Option<CorrectionSet>, EditingError> {
        self.load_owned(user_id, subject_id).await?;
        self.drafts.load(subject_id).await
    }

    /// Remove a subject with its persisted steps, closing any live session.
    pub async fn delete(&self, user_id: i64, subject_id: i64) -> Result<(), EditingError> {
        let subject = self.load_owned(user_id, subject_id).await?;
        self.logins.abort(subject_id);
        if subject.remote_session_id.is_some() {
            self.close_best_effort(subject_id).await;
        }
        let deleted = self
            .db
            .call(move |db| db.delete_subject(subject_id))
            .await?;
        if !deleted {
            return Err(EditingError::SubjectNotFound { id: subject_id });
        }
        tracing::info!(subject_id, "subject deleted");
        Ok(())
    }

    pub async fn cancel(&self, user_id: i64, subject_id: i64) -> Result<EditableSubject, EditingError> {
        let subject = self.load_owned(user_id, subject_id).await?;
        if !subject.is_editing() {
            return Err(EditingError::NoActiveSession { subject_id });
        }
        self.logins.abort(subject_id);
        let resting = subject.kind.resting_status();
        let updated = self
            .db
            .call(move |db| db.mark_session_cancelled(subject_id, resting))
            .await?;
        self.close_best_effort(subject_id).await;

        tracing::info!(subject_id, status = %resting, "editing session cancelled");
        broadcast_event(
            &self.events,
            subject_id,
            EditingEvent::SessionCancelled { status: resting },
        );
        Ok(updated)
    }

    // ── Live-editing commands ────────────────────────────────────────

    async fn active_session(&self, user_id: i64, subject_id: i64) -> Result<EditableSubject, EditingError> {
        let subject = self.load_owned(user_id, subject_id).await?;
        Self::require_session(&subject)?;
        Ok(subject)
    }

    pub async fn command(
        &self,
        user_id: i64,
        subject_id: i64,
        name: &str,
        payload: Value,
    ) -> Result<Value, EditingError> {
        self.active_session(user_id, subject_id).await?;
        tracing::debug!(subject_id, command = name, "sending editing command");
        self.remote(subject_id, name, self.engine.send_command(subject_id, name, payload))
            .await
    }

    pub async fn navigate_step(
        &self,
        user_id: i64,
        subject_id: i64,
        step_index: usize,
        url: String,
    ) -> Result<(), EditingError> {
        self.active_session(user_id, subject_id).await?;
        self.remote(
            subject_id,
            "navigate_step",
            self.engine.navigate_step(subject_id, step_index, &url),
        )
        .await?;
        self.db
            .call(move |db| db.set_editing_url(subject_id, &url, None))
            .await?;
        Ok(())
    }

    pub async fn fill_field(
        &self,
        user_id: i64,
        subject_id: i64,
        field_index: usize,
        value: &str,
    ) -> Result<(), EditingError> {
        self.active_session(user_id, subject_id).await?;
        self.remote(
            subject_id,
            "fill_field",
            self.engine.fill_field(subject_id, field_index, value),
        )
        .await
    }

    pub async fn test_selector(
        &self,
        user_id: i64,
        subject_id: i64,
        selector: &str,
    ) -> Result<SelectorMatch, EditingError> {
        self.active_session(user_id, subject_id).await?;
        self.remote(
            subject_id,
            "test_selector",
            self.engine.test_selector(subject_id, selector),
        )
        .await
    }

    pub async fn read_field_value(
        &self,
        user_id: i64,
        subject_id: i64,
        field_index: usize,
    ) -> Result<Option<String>, EditingError> {
        self.active_session(user_id, subject_id).await?;
        self.remote(
            subject_id,
            "read_field_value",
            self.engine.read_field_value(subject_id, field_index),
        )
        .await
    }
}
