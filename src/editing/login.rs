//! Multi-phase login: `login -> login_executing -> target`, or back to
//! `login` on failure so the user can retry.
//!
//! One attempt may be in flight per subject. The registry entry is the
//! in-process guard; the `login_phase` compare-and-set in the database is
//! the persisted one. An attempt consumes the engine's progress stream on a
//! spawned task; `captcha`, `2fa` and `human_breakpoint` pause it, and no
//! further progress (including `done`) is consumed until the user resumes.
//! Every outcome is written with a compare-and-set from `login_executing`,
//! so an abort and a finishing attempt cannot overwrite each other.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use stepwright_common::{CorrectionSet, LoginPhase, Step};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use super::lifecycle::{SessionManager, with_timeout};
use super::models::EditableSubject;
use super::remote::{LoginFieldValue, LoginOutcome, LoginProgressStream, LoginRequest};
use super::ws::{EditingEvent, broadcast_event};
use crate::errors::{EditingError, RemoteError};

struct LoginAttempt {
    attempt_id: Uuid,
    paused: bool,
    resumed: Arc<Notify>,
    task: Option<AbortHandle>,
}

/// In-flight login attempts keyed by subject id.
#[derive(Clone, Default)]
pub struct LoginRegistry {
    attempts: Arc<DashMap<i64, LoginAttempt>>,
}

impl LoginRegistry {
    fn reserve(&self, subject_id: i64) -> Option<(Uuid, Arc<Notify>)> {
        match self.attempts.entry(subject_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let attempt_id = Uuid::new_v4();
                let resumed = Arc::new(Notify::new());
                slot.insert(LoginAttempt {
                    attempt_id,
                    paused: false,
                    resumed: resumed.clone(),
                    task: None,
                });
                Some((attempt_id, resumed))
            }
        }
    }

    fn attach(&self, subject_id: i64, attempt_id: Uuid, task: AbortHandle) {
        if let Some(mut attempt) = self.attempts.get_mut(&subject_id)
            && attempt.attempt_id == attempt_id
        {
            attempt.task = Some(task);
        }
    }

    fn set_paused(&self, subject_id: i64, attempt_id: Uuid, paused: bool) {
        if let Some(mut attempt) = self.attempts.get_mut(&subject_id)
            && attempt.attempt_id == attempt_id
        {
            attempt.paused = paused;
        }
    }

    /// Id of the subject's attempt if it is waiting on a manual step.
    fn paused_attempt(&self, subject_id: i64) -> Option<Uuid> {
        self.attempts
            .get(&subject_id)
            .filter(|a| a.paused)
            .map(|a| a.attempt_id)
    }

    /// Clear the pause of exactly `attempt_id` and wake its progress loop.
    /// Returns false when that attempt is gone or no longer paused.
    fn resume(&self, subject_id: i64, attempt_id: Uuid) -> bool {
        match self.attempts.get_mut(&subject_id) {
            Some(mut attempt) if attempt.attempt_id == attempt_id && attempt.paused => {
                attempt.paused = false;
                attempt.resumed.notify_one();
                true
            }
            _ => false,
        }
    }

    fn release(&self, subject_id: i64, attempt_id: Uuid) {
        self.attempts
            .remove_if(&subject_id, |_, a| a.attempt_id == attempt_id);
    }

    pub fn is_running(&self, subject_id: i64) -> bool {
        self.attempts.contains_key(&subject_id)
    }

    pub fn is_paused(&self, subject_id: i64) -> bool {
        self.attempts
            .get(&subject_id)
            .is_some_and(|a| a.paused)
    }

    /// Stop the subject's attempt, if any. Returns whether one was running.
    pub fn abort(&self, subject_id: i64) -> bool {
        match self.attempts.remove(&subject_id) {
            Some((_, attempt)) => {
                if let Some(task) = attempt.task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }
}

/// The login step for the subject's current page, falling back to the first
/// login step of the document.
fn login_step_for<'a>(subject: &EditableSubject, document: &'a CorrectionSet) -> Option<&'a Step> {
    subject
        .current_editing_url
        .as_deref()
        .and_then(|url| document.step_for_url(url))
        .filter(|s| s.is_login())
        .or_else(|| document.login_step())
}

fn login_request(subject: &EditableSubject, step: &Step) -> LoginRequest {
    LoginRequest {
        fields: step
            .fields
            .iter()
            .map(|f| LoginFieldValue {
                field_name: f.field_name.clone(),
                field_selector: f.field_selector.clone(),
                field_type: f.field_type.clone(),
                value: f.preset_value.clone(),
            })
            .collect(),
        target_url: subject.target_url.clone(),
        submit_selector: step.submit_selector.clone(),
        human_breakpoint: step.human_breakpoint,
    }
}

#[derive(Clone)]
pub struct LoginOrchestrator {
    sessions: SessionManager,
}

impl LoginOrchestrator {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    /// Submit the login step through the engine and follow its progress in
    /// the background. The returned handle completes when the attempt ends.
    pub async fn confirm_login_and_proceed(
        &self,
        user_id: i64,
        subject_id: i64,
    ) -> Result<JoinHandle<()>, EditingError> {
        let subject = self.sessions.load_owned(user_id, subject_id).await?;
        SessionManager::require_session(&subject)?;
        match subject.login_phase {
            Some(LoginPhase::Login) | Some(LoginPhase::LoginExecuting) => {}
            _ => {
                return Err(EditingError::InvalidState(
                    "subject is not waiting at a login step".into(),
                ));
            }
        }

        let document = subject.seed_document();
        let step = login_step_for(&subject, &document)
            .ok_or_else(|| EditingError::InvalidState("draft has no login step".into()))?
            .clone();

        let registry = &self.sessions.logins;
        let (attempt_id, resumed) = registry
            .reserve(subject_id)
            .ok_or(EditingError::LoginInProgress { subject_id })?;

        // No attempt is tracked here, so an executing phase left in the
        // database belongs to a previous process and may be reclaimed.
        let reclaim_stale = subject.login_phase == Some(LoginPhase::LoginExecuting);
        let claimed = match self
            .sessions
            .db
            .call(move |db| db.begin_login_execution(subject_id, reclaim_stale))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                registry.release(subject_id, attempt_id);
                return Err(e.into());
            }
        };
        if !claimed {
            registry.release(subject_id, attempt_id);
            return Err(EditingError::LoginInProgress { subject_id });
        }

        let request = login_request(&subject, &step);
        tracing::info!(subject_id, %attempt_id, fields = request.fields.len(), "executing login");
        let stream = match self
            .sessions
            .remote(
                subject_id,
                "execute_login",
                self.sessions.engine.execute_login(subject_id, request),
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                registry.release(subject_id, attempt_id);
                self.fail(subject_id, &e.to_string()).await;
                return Err(e);
            }
        };

        let this = self.clone();
        let login_step_order = step.step_order;
        let handle = tokio::spawn(async move {
            this.drive(subject_id, attempt_id, login_step_order, stream, &resumed)
                .await;
        });
        registry.attach(subject_id, attempt_id, handle.abort_handle());
        Ok(handle)
    }

    async fn drive(
        &self,
        subject_id: i64,
        attempt_id: Uuid,
        login_step_order: u32,
        stream: LoginProgressStream,
        resumed: &Notify,
    ) {
        let limit = self.sessions.settings.login_timeout;
        let result = with_timeout(
            "execute_login",
            limit,
            self.follow(subject_id, attempt_id, stream, resumed),
        )
        .await;
        match result {
            Ok(outcome) if outcome.success => {
                self.succeed(subject_id, login_step_order, outcome).await;
            }
            Ok(outcome) => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "login was not accepted".to_string());
                self.fail(subject_id, &message).await;
            }
            Err(RemoteError::Timeout { .. }) => {
                let message = format!("login did not finish within {}s", limit.as_secs());
                self.fail(subject_id, &message).await;
            }
            Err(e) => {
                self.fail(subject_id, &e.to_string()).await;
            }
        }
        self.sessions.logins.release(subject_id, attempt_id);
    }

    /// Consume progress until `done`. A stream that ends first is a failure.
    /// After a manual-step event nothing more is read until `resumed` fires.
    async fn follow(
        &self,
        subject_id: i64,
        attempt_id: Uuid,
        mut stream: LoginProgressStream,
        resumed: &Notify,
    ) -> Result<LoginOutcome, RemoteError> {
        while let Some(item) = stream.next().await {
            let progress = item?;
            if let Some(outcome) = progress.outcome {
                return Ok(outcome);
            }
            let paused = progress.phase.needs_human();
            self.sessions.logins.set_paused(subject_id, attempt_id, paused);
            tracing::debug!(subject_id, phase = progress.phase.as_str(), paused, "login progress");
            broadcast_event(
                &self.sessions.events,
                subject_id,
                EditingEvent::LoginExecutionProgress {
                    phase: progress.phase,
                    message: progress.message,
                    paused,
                },
            );
            if paused {
                resumed.notified().await;
                tracing::debug!(subject_id, "login progress continues after resume");
            }
        }
        Err(RemoteError::Transport(
            "login progress stream ended without a result".into(),
        ))
    }

    async fn succeed(&self, subject_id: i64, login_step_order: u32, outcome: LoginOutcome) {
        let sessions = &self.sessions;
        let subject = match sessions.load(subject_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(subject_id, error = %e, "failed to load subject after login");
                return;
            }
        };
        let mut document = subject.seed_document();
        let added = document.append_discovered(outcome.discovered_steps, Some(login_step_order));
        let final_url = outcome
            .final_url
            .clone()
            .unwrap_or_else(|| subject.target_url.clone());

        let url = final_url.clone();
        let stored = sessions
            .db
            .call(move |db| {
                db.finish_login(subject_id, LoginPhase::Target, None, Some(&document), Some(&url))
            })
            .await;
        match stored {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(subject_id, "login phase already moved; success not recorded");
                return;
            }
            Err(e) => {
                tracing::error!(subject_id, error = %e, "failed to record login success");
                return;
            }
        }

        tracing::info!(subject_id, added_steps = added.len(), "login succeeded");
        broadcast_event(
            &sessions.events,
            subject_id,
            EditingEvent::LoginExecutionComplete {
                success: true,
                error: None,
                final_url: Some(final_url),
                added_step_orders: added,
            },
        );
    }

    /// Return to the login phase with `message`. Returns false when the
    /// attempt had already finished.
    async fn fail(&self, subject_id: i64, message: &str) -> bool {
        let error = message.to_string();
        let stored = self
            .sessions
            .db
            .call(move |db| db.finish_login(subject_id, LoginPhase::Login, Some(&error), None, None))
            .await;
        match stored {
            Ok(Some(_)) => {}
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(subject_id, error = %e, "failed to record login failure");
            }
        }
        tracing::warn!(subject_id, error = message, "login failed");
        broadcast_event(
            &self.sessions.events,
            subject_id,
            EditingEvent::LoginExecutionComplete {
                success: false,
                error: Some(message.to_string()),
                final_url: None,
                added_step_orders: Vec::new(),
            },
        );
        true
    }

    /// Continue an attempt paused on a manual step the user has completed.
    pub async fn resume_login(&self, user_id: i64, subject_id: i64) -> Result<(), EditingError> {
        let subject = self.sessions.load_owned(user_id, subject_id).await?;
        SessionManager::require_session(&subject)?;
        let attempt_id = self
            .sessions
            .logins
            .paused_attempt(subject_id)
            .ok_or(EditingError::LoginNotPaused { subject_id })?;
        self.sessions
            .remote(
                subject_id,
                "resume_login",
                self.sessions.engine.resume_login(subject_id),
            )
            .await?;
        if !self.sessions.logins.resume(subject_id, attempt_id) {
            return Err(EditingError::LoginNotPaused { subject_id });
        }
        tracing::info!(subject_id, %attempt_id, "login resumed after manual step");
        Ok(())
    }

    /// Cancel the in-flight attempt and return to the login phase.
    pub async fn abort_login(&self, user_id: i64, subject_id: i64) -> Result<(), EditingError> {
        self.sessions.load_owned(user_id, subject_id).await?;
        self.sessions.logins.abort(subject_id);
        if !self.fail(subject_id, "login aborted by user").await {
            return Err(EditingError::InvalidState(
                "no login attempt in progress".into(),
            ));
        }
        Ok(())
    }
}
