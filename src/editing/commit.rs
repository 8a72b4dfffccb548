//! Turns a validated draft into persisted steps and fields.
//!
//! Fail-closed: validation and sealing both happen before the transaction
//! opens, so any violation or sealing failure leaves storage untouched.
//! Replacing all rows makes re-confirmation idempotent in content (row ids
//! are regenerated).

use std::sync::Arc;

use serde::Serialize;
use stepwright_common::{CorrectionSet, EditingStatus};

use super::graph::validate_correction_set;
use super::lifecycle::SessionManager;
use super::models::{EditableSubject, LoginMetadata, PersistedStep};
use super::sealer::{SecretSealer, seal_sensitive_values};
use super::ws::{EditingEvent, broadcast_event};
use crate::errors::EditingError;

/// Result of a successful confirmation, safe to hand to clients.
#[derive(Debug, Clone, Serialize)]
pub struct Confirmation {
    pub subject: EditableSubject,
    pub steps: Vec<PersistedStep>,
}

#[derive(Clone)]
pub struct ConfirmationCommitter {
    sessions: SessionManager,
    sealer: Arc<dyn SecretSealer>,
}

impl ConfirmationCommitter {
    pub fn new(sessions: SessionManager, sealer: Arc<dyn SecretSealer>) -> Self {
        Self { sessions, sealer }
    }

    pub async fn confirm(
        &self,
        user_id: i64,
        subject_id: i64,
        override_set: Option<CorrectionSet>,
    ) -> Result<Confirmation, EditingError> {
        let subject = self.sessions.load_owned(user_id, subject_id).await?;

        let document = match override_set {
            Some(set) => set,
            None => {
                if subject.editing_status == EditingStatus::Cancelled {
                    return Err(EditingError::InvalidState(
                        "editing was cancelled; save a draft or supply a correction set to confirm"
                            .into(),
                    ));
                }
                subject.draft.clone().unwrap_or_default()
            }
        };
        if document.is_empty() {
            return Err(EditingError::EmptyDraft);
        }

        if let Err(violations) = validate_correction_set(&document) {
            tracing::info!(subject_id, violations = violations.len(), "confirmation rejected");
            return Err(EditingError::Validation(violations));
        }

        let sealed = seal_sensitive_values(self.sealer.as_ref(), &document)?;
        let login = LoginMetadata::derive(&document);
        let ready = subject.kind.ready_status();

        let step_count = document.steps.len();
        let (steps, updated) = self
            .sessions
            .db
            .call(move |db| {
                let steps = db.commit_confirmation(subject_id, &document, &sealed, &login, ready)?;
                let subject = db
                    .get_subject(subject_id)?
                    .ok_or_else(|| anyhow::anyhow!("Subject {} vanished during confirm", subject_id))?;
                Ok((steps, subject))
            })
            .await?;

        self.sessions.logins.abort(subject_id);
        if subject.is_editing() || subject.remote_session_id.is_some() {
            self.sessions.close_best_effort(subject_id).await;
        }

        tracing::info!(subject_id, steps = step_count, status = %ready, "correction set confirmed");
        broadcast_event(
            &self.sessions.events,
            subject_id,
            EditingEvent::SessionConfirmed {
                status: ready,
                step_count,
            },
        );

        Ok(Confirmation {
            subject: updated,
            steps: steps.iter().map(PersistedStep::redacted).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editing::graph::ViolationKind;
    use crate::editing::lifecycle::testing::*;
    use crate::editing::models::NewSubject;
    use crate::editing::sealer::{ChaChaSealer, DisabledSealer};
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use stepwright_common::{Field, FormType, Step, SubjectKind, SubjectStatus};

    fn committer(h: &Harness) -> ConfirmationCommitter {
        let sealer = ChaChaSealer::from_base64_key(&STANDARD.encode([9u8; 32])).unwrap();
        ConfirmationCommitter::new(h.sessions.clone(), Arc::new(sealer))
    }

    async fn stored_steps(h: &Harness, id: i64) -> Vec<PersistedStep> {
        h.sessions.db.call(move |db| db.get_steps(id)).await.unwrap()
    }

    fn step(order: u32, depends_on: Option<u32>) -> Step {
        Step {
            step_order: order,
            depends_on_step_order: depends_on,
            page_url: format!("https://x.test/{}", order),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_confirm_seals_password_and_redacts_output() {
        let h = Harness::new();
        let s = h.task().await;
        h.sessions.start(OWNER, s.id, None).await.unwrap();
        h.sessions.save_draft(OWNER, s.id, target_document()).await.unwrap();

        let confirmed = committer(&h).confirm(OWNER, s.id, None).await.unwrap();
        assert_eq!(confirmed.subject.editing_status, EditingStatus::Confirmed);
        assert_eq!(confirmed.subject.status, SubjectStatus::Draft);
        assert!(confirmed.subject.remote_session_id.is_none());
        assert_eq!(confirmed.steps[0].fields.len(), 2);
        assert_eq!(confirmed.steps[0].fields[0].preset_value.as_deref(), Some("a@b.com"));
        assert!(confirmed.steps[0].fields[1].preset_value.is_none());

        let stored = stored_steps(&h, s.id).await;
        let password = &stored[0].fields[1];
        assert!(password.is_sensitive);
        let sealed = password.preset_value.as_deref().unwrap();
        assert_ne!(sealed, "secret");
        assert!(sealed.starts_with("v1:"));
        assert_eq!(h.engine.closes(), 1);
    }

    #[tokio::test]
    async fn test_confirm_leaves_no_plaintext_secret_on_subject() {
        let h = Harness::new();
        let s = h.task().await;
        h.sessions.start(OWNER, s.id, None).await.unwrap();
        h.sessions.save_draft(OWNER, s.id, target_document()).await.unwrap();

        let confirmed = committer(&h).confirm(OWNER, s.id, None).await.unwrap();
        let body = serde_json::to_string(&confirmed).unwrap();
        assert!(!body.contains("secret"));

        let reloaded = h.sessions.load(s.id).await.unwrap();
        assert!(!serde_json::to_string(&reloaded).unwrap().contains("secret"));
        let draft = h.sessions.load_draft(OWNER, s.id).await.unwrap().unwrap();
        assert_eq!(draft.steps[0].fields[0].preset_value.as_deref(), Some("a@b.com"));
        assert_eq!(draft.steps[0].fields[1].preset_value, None);
    }

    #[tokio::test]
    async fn test_reconfirm_replaces_rows() {
        let h = Harness::new();
        let s = h.task().await;
        let c = committer(&h);
        let first = c.confirm(OWNER, s.id, Some(target_document())).await.unwrap();
        let second = c.confirm(OWNER, s.id, Some(target_document())).await.unwrap();

        assert_eq!(first.steps.len(), second.steps.len());
        assert_ne!(first.steps[0].id, second.steps[0].id);
        let names = |steps: &[PersistedStep]| -> Vec<String> {
            steps[0].fields.iter().map(|f| f.field_name.clone()).collect()
        };
        assert_eq!(names(&first.steps), names(&second.steps));
        let sid = s.id;
        assert_eq!(h.sessions.db.call(move |db| db.count_fields(sid)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_draft_is_rejected() {
        let h = Harness::new();
        let s = h.task().await;
        let c = committer(&h);
        assert!(matches!(
            c.confirm(OWNER, s.id, None).await,
            Err(EditingError::EmptyDraft)
        ));
        assert!(matches!(
            c.confirm(OWNER, s.id, Some(CorrectionSet::default())).await,
            Err(EditingError::EmptyDraft)
        ));
    }

    #[tokio::test]
    async fn test_violations_abort_without_side_effects() {
        let h = Harness::new();
        let s = h.task().await;
        let c = committer(&h);
        c.confirm(OWNER, s.id, Some(target_document())).await.unwrap();

        let cyclic = CorrectionSet::new(vec![step(1, Some(2)), step(2, Some(1))]);
        let err = c.confirm(OWNER, s.id, Some(cyclic)).await.unwrap_err();
        match err {
            EditingError::Validation(v) => {
                assert!(matches!(v[0].kind, ViolationKind::Cycle { .. }));
            }
            other => panic!("Expected Validation, got {:?}", other),
        }

        let mut dup_fields = CorrectionSet::new(vec![step(0, None), step(1, Some(99))]);
        dup_fields.steps[0].fields = vec![Field::default(), Field::default()];
        let err = c.confirm(OWNER, s.id, Some(dup_fields)).await.unwrap_err();
        match err {
            EditingError::Validation(v) => {
                assert_eq!(v.len(), 2);
                assert_eq!(v[0].field_index, Some(1));
                assert_eq!(v[1].position, 1);
            }
            other => panic!("Expected Validation, got {:?}", other),
        }

        // The earlier confirmation is still what is stored.
        let stored = stored_steps(&h, s.id).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].page_url, "https://x.test/apply");
    }

    #[tokio::test]
    async fn test_missing_seal_key_fails_closed() {
        let h = Harness::new();
        let s = h.task().await;
        let c = ConfirmationCommitter::new(h.sessions.clone(), Arc::new(DisabledSealer));
        let err = c.confirm(OWNER, s.id, Some(target_document())).await.unwrap_err();
        assert!(matches!(err, EditingError::Sealing(_)));
        assert!(stored_steps(&h, s.id).await.is_empty());
        assert_eq!(
            h.sessions.load(s.id).await.unwrap().editing_status,
            EditingStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_confirm_after_cancel_needs_reestablished_draft() {
        let h = Harness::new();
        let s = h.task().await;
        let c = committer(&h);
        h.sessions.start(OWNER, s.id, None).await.unwrap();
        h.sessions.save_draft(OWNER, s.id, target_document()).await.unwrap();
        h.sessions.cancel(OWNER, s.id).await.unwrap();

        assert!(matches!(
            c.confirm(OWNER, s.id, None).await,
            Err(EditingError::InvalidState(_))
        ));

        h.sessions.save_draft(OWNER, s.id, target_document()).await.unwrap();
        assert!(c.confirm(OWNER, s.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_login_metadata_and_ready_status() {
        let h = Harness::new();
        let analysis = h
            .subject(NewSubject {
                kind: SubjectKind::Analysis,
                name: "probe".into(),
                target_url: "https://x.test/apply".into(),
                ..Default::default()
            })
            .await;
        let mut doc = login_document();
        doc.steps.push(Step {
            step_order: 1,
            depends_on_step_order: Some(0),
            page_url: "https://x.test/apply".into(),
            form_type: FormType::Target,
            ..Default::default()
        });

        let confirmed = committer(&h).confirm(OWNER, analysis.id, Some(doc)).await.unwrap();
        assert_eq!(confirmed.subject.status, SubjectStatus::Confirmed);
        assert!(confirmed.subject.requires_login);
        assert_eq!(confirmed.subject.login_url.as_deref(), Some("https://x.test/login"));
        // No session was open, so nothing to close.
        assert_eq!(h.engine.closes(), 0);
    }

    #[tokio::test]
    async fn test_failed_close_does_not_fail_confirm() {
        let h = Harness::new();
        let s = h.task().await;
        h.sessions.start(OWNER, s.id, None).await.unwrap();
        h.engine
            .fail_next("close", crate::errors::RemoteError::Transport("down".into()));
        assert!(committer(&h).confirm(OWNER, s.id, Some(target_document())).await.is_ok());
    }

    #[tokio::test]
    async fn test_non_owner_is_rejected_before_side_effects() {
        let h = Harness::new();
        let s = h.task().await;
        let err = committer(&h)
            .confirm(OWNER + 1, s.id, Some(target_document()))
            .await
            .unwrap_err();
        assert!(matches!(err, EditingError::Forbidden { .. }));
        assert!(stored_steps(&h, s.id).await.is_empty());
    }
}
