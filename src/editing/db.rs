use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use stepwright_common::{CorrectionSet, EditingStatus, LoginPhase, SubjectStatus};

use super::models::*;

/// Async-safe handle to the editing database.
///
/// Wraps `EditingDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EditingDb>>,
}

impl DbHandle {
    pub fn new(db: EditingDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EditingDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Format a timestamp the way it is stored: RFC 3339, UTC, millisecond
/// precision. Fixed width keeps stored values lexicographically ordered.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| anyhow::anyhow!("invalid timestamp in database '{}': {}", s, e))
        })
        .transpose()
}

fn parse_document(value: Option<String>, column: &str) -> Result<Option<CorrectionSet>> {
    value
        .map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| anyhow::anyhow!("corrupt {} JSON in database: {}", column, e))
        })
        .transpose()
}

const SUBJECT_COLUMNS: &str = "id, owner_id, kind, name, target_url, status, editing_status, \
     current_editing_url, editing_started_at, editing_expires_at, remote_session_id, draft, \
     draft_version, initial_result, requires_login, login_url, login_phase, login_error, \
     created_at, updated_at";

pub struct EditingDb {
    conn: Connection,
}

impl EditingDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS subjects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id INTEGER NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'task',
                    name TEXT NOT NULL,
                    target_url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    editing_status TEXT NOT NULL DEFAULT 'idle',
                    current_editing_url TEXT,
                    editing_started_at TEXT,
                    editing_expires_at TEXT,
                    remote_session_id TEXT,
                    draft TEXT,
                    draft_version INTEGER NOT NULL DEFAULT 0,
                    initial_result TEXT,
                    requires_login INTEGER NOT NULL DEFAULT 0,
                    login_url TEXT,
                    login_phase TEXT,
                    login_error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS form_steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    subject_id INTEGER NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
                    step_order INTEGER NOT NULL,
                    depends_on_step_order INTEGER,
                    page_url TEXT NOT NULL,
                    form_type TEXT NOT NULL,
                    form_selector TEXT NOT NULL DEFAULT '',
                    submit_selector TEXT,
                    human_breakpoint INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(subject_id, step_order)
                );

                CREATE TABLE IF NOT EXISTS form_fields (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    step_id INTEGER NOT NULL REFERENCES form_steps(id) ON DELETE CASCADE,
                    field_name TEXT NOT NULL,
                    field_type TEXT NOT NULL,
                    field_selector TEXT NOT NULL,
                    field_purpose TEXT,
                    preset_value TEXT,
                    is_sensitive INTEGER NOT NULL DEFAULT 0,
                    is_required INTEGER NOT NULL DEFAULT 0,
                    is_file_upload INTEGER NOT NULL DEFAULT 0,
                    options TEXT,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(step_id, sort_order)
                );

                CREATE INDEX IF NOT EXISTS idx_subjects_owner ON subjects(owner_id);
                CREATE INDEX IF NOT EXISTS idx_subjects_editing
                    ON subjects(editing_status, editing_expires_at);
                CREATE INDEX IF NOT EXISTS idx_form_steps_subject ON form_steps(subject_id);
                CREATE INDEX IF NOT EXISTS idx_form_fields_step ON form_fields(step_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Subject CRUD ──────────────────────────────────────────────────

    pub fn create_subject(&self, owner_id: i64, new: &NewSubject) -> Result<EditableSubject> {
        let initial = new
            .initial_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize initial result")?;
        self.conn
            .execute(
                "INSERT INTO subjects (owner_id, kind, name, target_url, status, initial_result, requires_login, login_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    owner_id,
                    new.kind.as_str(),
                    new.name,
                    new.target_url,
                    new.kind.resting_status().as_str(),
                    initial,
                    new.requires_login,
                    new.login_url,
                ],
            )
            .context("Failed to insert subject")?;
        let id = self.conn.last_insert_rowid();
        self.get_subject(id)?.context("Subject not found after insert")
    }

    pub fn get_subject(&self, id: i64) -> Result<Option<EditableSubject>> {
        let sql = format!("SELECT {} FROM subjects WHERE id = ?1", SUBJECT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], SubjectRow::from_row)
            .optional()
            .context("Failed to query subject")?;
        row.map(SubjectRow::into_subject).transpose()
    }

    pub fn list_subjects(&self, owner_id: i64) -> Result<Vec<EditableSubject>> {
        let sql = format!(
            "SELECT {} FROM subjects WHERE owner_id = ?1 ORDER BY id",
            SUBJECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_subjects")?;
        let rows = stmt
            .query_map(params![owner_id], SubjectRow::from_row)
            .context("Failed to query subjects")?;
        let mut subjects = Vec::new();
        for row in rows {
            let r = row.context("Failed to read subject row")?;
            subjects.push(r.into_subject()?);
        }
        Ok(subjects)
    }

    /// Subjects with an active session whose expiry is strictly before `now`.
    pub fn list_expired(&self, now: &DateTime<Utc>) -> Result<Vec<EditableSubject>> {
        let sql = format!(
            "SELECT {} FROM subjects
             WHERE editing_status = 'active' AND editing_expires_at IS NOT NULL AND editing_expires_at < ?1
             ORDER BY id",
            SUBJECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_expired")?;
        let rows = stmt
            .query_map(params![format_ts(now)], SubjectRow::from_row)
            .context("Failed to query expired subjects")?;
        let mut subjects = Vec::new();
        for row in rows {
            let r = row.context("Failed to read subject row")?;
            subjects.push(r.into_subject()?);
        }
        Ok(subjects)
    }

    // ── Draft ─────────────────────────────────────────────────────────

    /// Overwrite the draft (last write wins) and bump its version. A draft
    /// saved after a cancellation re-establishes the subject as idle.
    /// Returns the new version, or `None` if the subject does not exist.
    pub fn save_draft(&self, id: i64, draft: &CorrectionSet) -> Result<Option<i64>> {
        let json = serde_json::to_string(draft).context("Failed to serialize draft")?;
        let count = self
            .conn
            .execute(
                "UPDATE subjects SET draft = ?1, draft_version = draft_version + 1,
                    editing_status = CASE WHEN editing_status = 'cancelled' THEN 'idle' ELSE editing_status END,
                    updated_at = datetime('now')
                 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to save draft")?;
        if count == 0 {
            return Ok(None);
        }
        let version: i64 = self
            .conn
            .query_row(
                "SELECT draft_version FROM subjects WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to read draft version")?;
        Ok(Some(version))
    }

    // ── Session state ─────────────────────────────────────────────────

    pub fn mark_session_opened(&self, id: i64, opened: &SessionOpened) -> Result<EditableSubject> {
        self.conn
            .execute(
                "UPDATE subjects SET editing_status = 'active', status = 'editing',
                    remote_session_id = ?1, current_editing_url = ?2,
                    editing_started_at = ?3, editing_expires_at = ?4,
                    login_phase = ?5, login_error = NULL, updated_at = datetime('now')
                 WHERE id = ?6",
                params![
                    opened.remote_session_id,
                    opened.editing_url,
                    format_ts(&opened.started_at),
                    format_ts(&opened.expires_at),
                    opened.login_phase.map(|p| p.as_str()),
                    id,
                ],
            )
            .context("Failed to mark session opened")?;
        self.get_subject(id)?.context("Subject not found after session open")
    }

    /// Cancel the session and restore `resting` as the main status.
    pub fn mark_session_cancelled(&self, id: i64, resting: SubjectStatus) -> Result<EditableSubject> {
        self.conn
            .execute(
                "UPDATE subjects SET editing_status = 'cancelled', status = ?1,
                    remote_session_id = NULL, login_phase = NULL, updated_at = datetime('now')
                 WHERE id = ?2",
                params![resting.as_str(), id],
            )
            .context("Failed to mark session cancelled")?;
        self.get_subject(id)?.context("Subject not found after cancel")
    }

    /// Cancel only if the session is still active and already expired at
    /// `now`. Returns whether this call did the cancellation.
    pub fn expire_session(&self, id: i64, resting: SubjectStatus, now: &DateTime<Utc>) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE subjects SET editing_status = 'cancelled', status = ?1,
                    remote_session_id = NULL, login_phase = NULL, updated_at = datetime('now')
                 WHERE id = ?2 AND editing_status = 'active' AND editing_expires_at < ?3",
                params![resting.as_str(), id, format_ts(now)],
            )
            .context("Failed to expire session")?;
        Ok(count > 0)
    }

    /// Drop the local handle to a remote session the engine no longer has.
    pub fn clear_remote_session(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE subjects SET remote_session_id = NULL, updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to clear remote session")?;
        Ok(())
    }

    pub fn set_editing_url(&self, id: i64, url: &str, phase: Option<LoginPhase>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE subjects SET current_editing_url = ?1, login_phase = COALESCE(?2, login_phase),
                    updated_at = datetime('now')
                 WHERE id = ?3",
                params![url, phase.map(|p| p.as_str()), id],
            )
            .context("Failed to set editing url")?;
        Ok(())
    }

    // ── Login phase ───────────────────────────────────────────────────

    /// Move the login phase to `login_executing`. Succeeds only from `login`,
    /// or from a stale `login_executing` when `reclaim_stale` is set.
    pub fn begin_login_execution(&self, id: i64, reclaim_stale: bool) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE subjects SET login_phase = 'login_executing', login_error = NULL,
                    updated_at = datetime('now')
                 WHERE id = ?1 AND editing_status = 'active'
                   AND (login_phase = 'login' OR (?2 AND login_phase = 'login_executing'))",
                params![id, reclaim_stale],
            )
            .context("Failed to begin login execution")?;
        Ok(count > 0)
    }

    /// Record the login outcome. On success the extended draft and new
    /// editing URL are stored in the same statement. Applies only while the
    /// phase is `login_executing`; returns `None` when another path (abort,
    /// a finished attempt) already moved it.
    pub fn finish_login(
        &self,
        id: i64,
        phase: LoginPhase,
        error: Option<&str>,
        draft: Option<&CorrectionSet>,
        editing_url: Option<&str>,
    ) -> Result<Option<EditableSubject>> {
        let draft_json = draft
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize draft")?;
        let count = self
            .conn
            .execute(
                "UPDATE subjects SET login_phase = ?1, login_error = ?2,
                    draft = COALESCE(?3, draft),
                    draft_version = draft_version + (CASE WHEN ?3 IS NULL THEN 0 ELSE 1 END),
                    current_editing_url = COALESCE(?4, current_editing_url),
                    updated_at = datetime('now')
                 WHERE id = ?5 AND login_phase = 'login_executing'",
                params![phase.as_str(), error, draft_json, editing_url, id],
            )
            .context("Failed to finish login")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_subject(id)
    }

    // ── Confirmation ──────────────────────────────────────────────────

    /// Replace every persisted step/field of the subject with `sealed` and
    /// mark the subject confirmed, in one transaction. `document` becomes the
    /// subject's working copy with sensitive values removed; the detected
    /// result is redacted the same way.
    pub fn commit_confirmation(
        &self,
        id: i64,
        document: &CorrectionSet,
        sealed: &CorrectionSet,
        login: &LoginMetadata,
        ready: SubjectStatus,
    ) -> Result<Vec<PersistedStep>> {
        let draft_json =
            serde_json::to_string(&document.redacted()).context("Failed to serialize draft")?;

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let detected: Option<String> = tx
            .query_row(
                "SELECT initial_result FROM subjects WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read detected result")?
            .flatten();
        let detected_json = parse_document(detected, "initial_result")?
            .map(|set| serde_json::to_string(&set.redacted()))
            .transpose()
            .context("Failed to serialize detected result")?;

        tx.execute("DELETE FROM form_steps WHERE subject_id = ?1", params![id])
            .context("Failed to delete previous steps")?;

        for step in &sealed.steps {
            tx.execute(
                "INSERT INTO form_steps (subject_id, step_order, depends_on_step_order, page_url, form_type, form_selector, submit_selector, human_breakpoint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    step.step_order,
                    step.depends_on_step_order,
                    step.page_url,
                    step.form_type.as_str(),
                    step.form_selector,
                    step.submit_selector,
                    step.human_breakpoint,
                ],
            )
            .with_context(|| format!("Failed to insert step {}", step.step_order))?;
            let step_id = tx.last_insert_rowid();

            for field in &step.fields {
                let options = field
                    .options
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("Failed to serialize field options")?;
                tx.execute(
                    "INSERT INTO form_fields (step_id, field_name, field_type, field_selector, field_purpose, preset_value, is_sensitive, is_required, is_file_upload, options, sort_order)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        step_id,
                        field.field_name,
                        field.field_type,
                        field.field_selector,
                        field.field_purpose,
                        field.preset_value,
                        field.is_sensitive,
                        field.is_required,
                        field.is_file_upload,
                        options,
                        field.sort_order,
                    ],
                )
                .with_context(|| {
                    format!("Failed to insert field '{}' of step {}", field.field_name, step.step_order)
                })?;
            }
        }

        let count = tx
            .execute(
                "UPDATE subjects SET editing_status = 'confirmed', status = ?1,
                    requires_login = ?2, login_url = ?3, draft = ?4, initial_result = ?5,
                    remote_session_id = NULL, login_phase = NULL, login_error = NULL,
                    updated_at = datetime('now')
                 WHERE id = ?6",
                params![
                    ready.as_str(),
                    login.requires_login,
                    login.login_url,
                    draft_json,
                    detected_json,
                    id
                ],
            )
            .context("Failed to mark subject confirmed")?;
        if count == 0 {
            anyhow::bail!("Subject {} not found during confirmation", id);
        }

        tx.commit().context("Failed to commit confirmation")?;
        self.get_steps(id)
    }

    /// Persisted steps with their fields, in step order. Sensitive values are
    /// returned sealed; callers that hand data out must redact.
    pub fn get_steps(&self, subject_id: i64) -> Result<Vec<PersistedStep>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, subject_id, step_order, depends_on_step_order, page_url, form_type, form_selector, submit_selector, human_breakpoint
                 FROM form_steps WHERE subject_id = ?1 ORDER BY step_order",
            )
            .context("Failed to prepare get_steps")?;
        let rows = stmt
            .query_map(params![subject_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Option<u32>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, bool>(8)?,
                ))
            })
            .context("Failed to query steps")?;

        let mut steps = Vec::new();
        for row in rows {
            let (id, subject_id, step_order, depends_on, page_url, form_type_str, form_selector, submit_selector, human_breakpoint) =
                row.context("Failed to read step row")?;
            steps.push(PersistedStep {
                id,
                subject_id,
                step_order,
                depends_on_step_order: depends_on,
                page_url,
                form_type: form_type_str.parse().map_err(|_| {
                    anyhow::anyhow!("invalid form_type in database: '{}'", form_type_str)
                })?,
                form_selector,
                submit_selector,
                human_breakpoint,
                fields: self.get_fields(id)?,
            });
        }
        Ok(steps)
    }

    fn get_fields(&self, step_id: i64) -> Result<Vec<PersistedField>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, step_id, field_name, field_type, field_selector, field_purpose, preset_value, is_sensitive, is_required, is_file_upload, options, sort_order
                 FROM form_fields WHERE step_id = ?1 ORDER BY sort_order, id",
            )
            .context("Failed to prepare get_fields")?;
        let rows = stmt
            .query_map(params![step_id], |row| {
                Ok((
                    PersistedField {
                        id: row.get(0)?,
                        step_id: row.get(1)?,
                        field_name: row.get(2)?,
                        field_type: row.get(3)?,
                        field_selector: row.get(4)?,
                        field_purpose: row.get(5)?,
                        preset_value: row.get(6)?,
                        is_sensitive: row.get(7)?,
                        is_required: row.get(8)?,
                        is_file_upload: row.get(9)?,
                        options: None,
                        sort_order: row.get(11)?,
                    },
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .context("Failed to query fields")?;
        let mut fields = Vec::new();
        for row in rows {
            let (mut field, options) = row.context("Failed to read field row")?;
            field.options = match options {
                Some(s) => Some(
                    serde_json::from_str(&s)
                        .map_err(|e| anyhow::anyhow!("corrupt options JSON '{}': {}", s, e))?,
                ),
                None => None,
            };
            fields.push(field);
        }
        Ok(fields)
    }

    pub fn count_fields(&self, subject_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM form_fields f JOIN form_steps s ON f.step_id = s.id WHERE s.subject_id = ?1",
                params![subject_id],
                |row| row.get(0),
            )
            .context("Failed to count fields")
    }

    pub fn delete_subject(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM subjects WHERE id = ?1", params![id])
            .context("Failed to delete subject")?;
        Ok(count > 0)
    }
}

// ── Row helpers ──────────────────────────────────────────────────────

struct SubjectRow {
    id: i64,
    owner_id: i64,
    kind: String,
    name: String,
    target_url: String,
    status: String,
    editing_status: String,
    current_editing_url: Option<String>,
    editing_started_at: Option<String>,
    editing_expires_at: Option<String>,
    remote_session_id: Option<String>,
    draft: Option<String>,
    draft_version: i64,
    initial_result: Option<String>,
    requires_login: bool,
    login_url: Option<String>,
    login_phase: Option<String>,
    login_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SubjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            kind: row.get(2)?,
            name: row.get(3)?,
            target_url: row.get(4)?,
            status: row.get(5)?,
            editing_status: row.get(6)?,
            current_editing_url: row.get(7)?,
            editing_started_at: row.get(8)?,
            editing_expires_at: row.get(9)?,
            remote_session_id: row.get(10)?,
            draft: row.get(11)?,
            draft_version: row.get(12)?,
            initial_result: row.get(13)?,
            requires_login: row.get(14)?,
            login_url: row.get(15)?,
            login_phase: row.get(16)?,
            login_error: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }

    fn into_subject(self) -> Result<EditableSubject> {
        let login_phase = match self.login_phase {
            Some(p) => Some(
                p.parse::<LoginPhase>()
                    .map_err(|_| anyhow::anyhow!("invalid login_phase in database: '{}'", p))?,
            ),
            None => None,
        };
        Ok(EditableSubject {
            id: self.id,
            owner_id: self.owner_id,
            kind: self
                .kind
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid kind in database: '{}'", self.kind))?,
            name: self.name,
            target_url: self.target_url,
            status: self
                .status
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid status in database: '{}'", self.status))?,
            editing_status: self.editing_status.parse::<EditingStatus>().map_err(|_| {
                anyhow::anyhow!("invalid editing_status in database: '{}'", self.editing_status)
            })?,
            current_editing_url: self.current_editing_url,
            editing_started_at: parse_ts(self.editing_started_at)?,
            editing_expires_at: parse_ts(self.editing_expires_at)?,
            remote_session_id: self.remote_session_id,
            draft: parse_document(self.draft, "draft")?,
            draft_version: self.draft_version,
            initial_result: parse_document(self.initial_result, "initial_result")?,
            requires_login: self.requires_login,
            login_url: self.login_url,
            login_phase,
            login_error: self.login_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use stepwright_common::{Field, FormType, Step, SubjectKind};

    fn new_task() -> NewSubject {
        NewSubject {
            kind: SubjectKind::Task,
            name: "apply".into(),
            target_url: "https://x.test/apply".into(),
            ..Default::default()
        }
    }

    fn opened(now: DateTime<Utc>, ttl_minutes: i64) -> SessionOpened {
        SessionOpened {
            remote_session_id: "rs-1".into(),
            editing_url: "https://x.test/apply".into(),
            started_at: now,
            expires_at: now + Duration::minutes(ttl_minutes),
            login_phase: None,
        }
    }

    fn document() -> CorrectionSet {
        CorrectionSet::new(vec![Step {
            step_order: 0,
            page_url: "https://x.test/apply".into(),
            form_selector: "form#apply".into(),
            fields: vec![
                Field {
                    field_name: "email".into(),
                    field_selector: "#email".into(),
                    preset_value: Some("a@b.com".into()),
                    sort_order: 0,
                    ..Default::default()
                },
                Field {
                    field_name: "color".into(),
                    field_type: "select".into(),
                    field_selector: "#color".into(),
                    options: Some(vec!["red".into(), "blue".into()]),
                    sort_order: 1,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }])
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        assert_eq!(tables, vec!["form_fields", "form_steps", "subjects"]);
        // Migrations are re-runnable.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_create_subject_uses_kind_resting_status() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let task = db.create_subject(10, &new_task())?;
        assert_eq!(task.status, SubjectStatus::Draft);
        assert_eq!(task.editing_status, EditingStatus::Idle);
        assert_eq!(task.owner_id, 10);

        let analysis = db.create_subject(
            10,
            &NewSubject {
                kind: SubjectKind::Analysis,
                initial_result: Some(document()),
                ..new_task()
            },
        )?;
        assert_eq!(analysis.status, SubjectStatus::Completed);
        assert_eq!(analysis.initial_result, Some(document()));
        Ok(())
    }

    #[test]
    fn test_list_subjects_filters_by_owner() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        db.create_subject(1, &new_task())?;
        db.create_subject(2, &new_task())?;
        db.create_subject(1, &new_task())?;
        assert_eq!(db.list_subjects(1)?.len(), 2);
        assert_eq!(db.list_subjects(2)?.len(), 1);
        assert!(db.list_subjects(3)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_save_draft_bumps_version_and_overwrites() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        assert_eq!(db.save_draft(s.id, &document())?, Some(1));
        assert_eq!(db.save_draft(s.id, &CorrectionSet::default())?, Some(2));
        let loaded = db.get_subject(s.id)?.unwrap();
        assert_eq!(loaded.draft, Some(CorrectionSet::default()));
        assert_eq!(db.save_draft(999, &document())?, None);
        Ok(())
    }

    #[test]
    fn test_session_open_and_cancel_round_trip() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        let now = Utc::now();
        let active = db.mark_session_opened(s.id, &opened(now, 30))?;
        assert_eq!(active.editing_status, EditingStatus::Active);
        assert_eq!(active.status, SubjectStatus::Editing);
        assert_eq!(active.remote_session_id.as_deref(), Some("rs-1"));
        assert_eq!(
            active.editing_expires_at.unwrap().timestamp_millis(),
            (now + Duration::minutes(30)).timestamp_millis()
        );

        let cancelled = db.mark_session_cancelled(s.id, SubjectStatus::Draft)?;
        assert_eq!(cancelled.editing_status, EditingStatus::Cancelled);
        assert_eq!(cancelled.status, SubjectStatus::Draft);
        assert!(cancelled.remote_session_id.is_none());
        Ok(())
    }

    #[test]
    fn test_save_draft_after_cancel_reestablishes_idle() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        db.mark_session_opened(s.id, &opened(Utc::now(), 30))?;
        db.mark_session_cancelled(s.id, SubjectStatus::Draft)?;
        db.save_draft(s.id, &document())?;
        assert_eq!(db.get_subject(s.id)?.unwrap().editing_status, EditingStatus::Idle);
        Ok(())
    }

    #[test]
    fn test_list_expired_and_conditional_expire() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let stale = db.create_subject(1, &new_task())?;
        let fresh = db.create_subject(1, &new_task())?;
        let now = Utc::now();
        db.mark_session_opened(stale.id, &opened(now - Duration::minutes(45), 30))?;
        db.mark_session_opened(fresh.id, &opened(now, 30))?;

        let expired = db.list_expired(&now)?;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);

        assert!(!db.expire_session(fresh.id, SubjectStatus::Draft, &now)?);
        assert!(db.expire_session(stale.id, SubjectStatus::Draft, &now)?);
        // Second attempt is a no-op: the session is no longer active.
        assert!(!db.expire_session(stale.id, SubjectStatus::Draft, &now)?);
        assert!(db.list_expired(&now)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_begin_login_execution_is_exclusive() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        let mut open = opened(Utc::now(), 30);
        open.login_phase = Some(LoginPhase::Login);
        db.mark_session_opened(s.id, &open)?;

        assert!(db.begin_login_execution(s.id, false)?);
        assert!(!db.begin_login_execution(s.id, false)?);
        assert!(db.begin_login_execution(s.id, true)?);

        let done = db
            .finish_login(s.id, LoginPhase::Login, Some("bad password"), None, None)?
            .unwrap();
        assert_eq!(done.login_phase, Some(LoginPhase::Login));
        assert_eq!(done.login_error.as_deref(), Some("bad password"));
        Ok(())
    }

    #[test]
    fn test_finish_login_success_stores_draft_and_url() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        let mut open = opened(Utc::now(), 30);
        open.login_phase = Some(LoginPhase::Login);
        db.mark_session_opened(s.id, &open)?;
        assert!(db.begin_login_execution(s.id, false)?);
        let done = db
            .finish_login(
                s.id,
                LoginPhase::Target,
                None,
                Some(&document()),
                Some("https://x.test/apply"),
            )?
            .unwrap();
        assert_eq!(done.login_phase, Some(LoginPhase::Target));
        assert_eq!(done.draft, Some(document()));
        assert_eq!(done.draft_version, 1);
        Ok(())
    }

    #[test]
    fn test_finish_login_only_applies_while_executing() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        let mut open = opened(Utc::now(), 30);
        open.login_phase = Some(LoginPhase::Login);
        db.mark_session_opened(s.id, &open)?;
        assert!(db.begin_login_execution(s.id, false)?);

        assert!(db.finish_login(s.id, LoginPhase::Target, None, None, None)?.is_some());
        // A late failure must not move a finished login back.
        assert!(db.finish_login(s.id, LoginPhase::Login, Some("aborted"), None, None)?.is_none());
        let subject = db.get_subject(s.id)?.unwrap();
        assert_eq!(subject.login_phase, Some(LoginPhase::Target));
        assert_eq!(subject.login_error, None);
        Ok(())
    }

    #[test]
    fn test_commit_confirmation_replaces_all_steps() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        let doc = document();
        let meta = LoginMetadata::derive(&doc);

        let first = db.commit_confirmation(s.id, &doc, &doc, &meta, SubjectStatus::Draft)?;
        let second = db.commit_confirmation(s.id, &doc, &doc, &meta, SubjectStatus::Draft)?;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(db.count_fields(s.id)?, 2);
        assert_eq!(second[0].fields[1].options.as_deref(), Some(&["red".to_string(), "blue".to_string()][..]));

        let subject = db.get_subject(s.id)?.unwrap();
        assert_eq!(subject.editing_status, EditingStatus::Confirmed);
        assert!(!subject.requires_login);
        Ok(())
    }

    #[test]
    fn test_commit_confirmation_redacts_stored_documents() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let mut doc = document();
        doc.steps[0].fields[0].is_sensitive = true;
        let s = db.create_subject(
            1,
            &NewSubject {
                initial_result: Some(doc.clone()),
                ..new_task()
            },
        )?;
        db.save_draft(s.id, &doc)?;

        db.commit_confirmation(s.id, &doc, &doc, &LoginMetadata::derive(&doc), SubjectStatus::Draft)?;
        let subject = db.get_subject(s.id)?.unwrap();
        assert_eq!(subject.draft, Some(doc.redacted()));
        assert_eq!(subject.initial_result, Some(doc.redacted()));
        assert_eq!(subject.draft.unwrap().steps[0].fields[0].preset_value, None);
        Ok(())
    }

    #[test]
    fn test_commit_confirmation_rolls_back_on_failure() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        let doc = document();
        let meta = LoginMetadata::derive(&doc);
        db.commit_confirmation(s.id, &doc, &doc, &meta, SubjectStatus::Draft)?;

        // Duplicate sort_order violates UNIQUE(step_id, sort_order) mid-transaction.
        let mut broken = document();
        broken.steps[0].fields[1].sort_order = 0;
        broken.steps[0].form_type = FormType::Login;
        let result = db.commit_confirmation(s.id, &broken, &broken, &meta, SubjectStatus::Draft);
        assert!(result.is_err());

        let steps = db.get_steps(s.id)?;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].form_type, FormType::Target);
        assert_eq!(db.count_fields(s.id)?, 2);
        Ok(())
    }

    #[test]
    fn test_delete_subject_cascades_to_steps_and_fields() -> Result<()> {
        let db = EditingDb::new_in_memory()?;
        let s = db.create_subject(1, &new_task())?;
        let doc = document();
        db.commit_confirmation(s.id, &doc, &doc, &LoginMetadata::derive(&doc), SubjectStatus::Draft)?;
        assert!(db.delete_subject(s.id)?);
        let orphans: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM form_fields", [], |row| row.get(0))?;
        assert_eq!(orphans, 0);
        Ok(())
    }
}
