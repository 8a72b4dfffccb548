use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepwright_common::{
    CorrectionSet, EditingStatus, FormType, LoginPhase, SubjectKind, SubjectStatus,
};

/// A task or analysis being configured through an editing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditableSubject {
    pub id: i64,
    pub owner_id: i64,
    pub kind: SubjectKind,
    pub name: String,
    pub target_url: String,
    pub status: SubjectStatus,
    pub editing_status: EditingStatus,
    pub current_editing_url: Option<String>,
    pub editing_started_at: Option<DateTime<Utc>>,
    pub editing_expires_at: Option<DateTime<Utc>>,
    pub remote_session_id: Option<String>,
    pub draft: Option<CorrectionSet>,
    pub draft_version: i64,
    /// Result of the upstream form detection, used to seed the first session.
    pub initial_result: Option<CorrectionSet>,
    pub requires_login: bool,
    pub login_url: Option<String>,
    pub login_phase: Option<LoginPhase>,
    pub login_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl EditableSubject {
    pub fn has_draft(&self) -> bool {
        self.draft.as_ref().is_some_and(|d| !d.is_empty())
    }

    /// The document a new session is seeded with: the draft if one exists,
    /// otherwise the detected result.
    pub fn seed_document(&self) -> CorrectionSet {
        self.draft
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| self.initial_result.clone())
            .unwrap_or_default()
    }

    /// URL an editing session opens at when none is given.
    pub fn default_editing_url(&self) -> String {
        if let Some(url) = &self.current_editing_url {
            return url.clone();
        }
        if self.requires_login
            && let Some(url) = &self.login_url
        {
            return url.clone();
        }
        self.target_url.clone()
    }

    pub fn is_editing(&self) -> bool {
        self.editing_status == EditingStatus::Active
    }
}

/// Input for creating a subject.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSubject {
    #[serde(default)]
    pub kind: SubjectKind,
    pub name: String,
    pub target_url: String,
    #[serde(default)]
    pub initial_result: Option<CorrectionSet>,
    #[serde(default)]
    pub requires_login: bool,
    #[serde(default)]
    pub login_url: Option<String>,
}

/// State written when a remote session opens.
#[derive(Debug, Clone)]
pub struct SessionOpened {
    pub remote_session_id: String,
    pub editing_url: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub login_phase: Option<LoginPhase>,
}

/// A confirmed step as persisted after confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStep {
    pub id: i64,
    pub subject_id: i64,
    pub step_order: u32,
    pub depends_on_step_order: Option<u32>,
    pub page_url: String,
    pub form_type: FormType,
    pub form_selector: String,
    pub submit_selector: Option<String>,
    pub human_breakpoint: bool,
    pub fields: Vec<PersistedField>,
}

/// A confirmed field. `preset_value` of a sensitive field holds the sealed
/// value in storage and is never handed out by read paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedField {
    pub id: i64,
    pub step_id: i64,
    pub field_name: String,
    pub field_type: String,
    pub field_selector: String,
    pub field_purpose: Option<String>,
    pub preset_value: Option<String>,
    pub is_sensitive: bool,
    pub is_required: bool,
    pub is_file_upload: bool,
    pub options: Option<Vec<String>>,
    pub sort_order: u32,
}

impl PersistedField {
    /// Copy safe to return to clients: sensitive values are nulled.
    pub fn redacted(&self) -> Self {
        let mut field = self.clone();
        if field.is_sensitive {
            field.preset_value = None;
        }
        field
    }
}

impl PersistedStep {
    pub fn redacted(&self) -> Self {
        Self {
            fields: self.fields.iter().map(PersistedField::redacted).collect(),
            ..self.clone()
        }
    }
}

/// Subject-level login metadata derived from a confirmed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginMetadata {
    pub requires_login: bool,
    pub login_url: Option<String>,
}

impl LoginMetadata {
    pub fn derive(set: &CorrectionSet) -> Self {
        match set.login_step() {
            Some(step) => Self {
                requires_login: true,
                login_url: Some(step.page_url.clone()),
            },
            None => Self {
                requires_login: false,
                login_url: None,
            },
        }
    }
}
