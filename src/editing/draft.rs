//! Working copy of a subject's correction set.
//!
//! Saves are unconditional overwrites: the client debounces keystroke
//! batches and the last write wins. Nothing is validated here; the full
//! check happens at confirm time.

use stepwright_common::CorrectionSet;

use super::db::DbHandle;
use crate::errors::EditingError;

#[derive(Clone)]
pub struct DraftStore {
    db: DbHandle,
}

impl DraftStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Replace the draft wholesale and return its new version.
    pub async fn save(&self, subject_id: i64, draft: CorrectionSet) -> Result<i64, EditingError> {
        let version = self
            .db
            .call(move |db| db.save_draft(subject_id, &draft))
            .await?;
        version.ok_or(EditingError::SubjectNotFound { id: subject_id })
    }

    pub async fn load(&self, subject_id: i64) -> Result<Option<CorrectionSet>, EditingError> {
        let subject = self
            .db
            .call(move |db| db.get_subject(subject_id))
            .await?
            .ok_or(EditingError::SubjectNotFound { id: subject_id })?;
        Ok(subject.draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editing::db::EditingDb;
    use crate::editing::models::NewSubject;
    use stepwright_common::Step;

    fn store_with_subject() -> (DraftStore, i64) {
        let db = EditingDb::new_in_memory().unwrap();
        let subject = db
            .create_subject(
                1,
                &NewSubject {
                    name: "t".into(),
                    target_url: "https://x.test".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        (DraftStore::new(DbHandle::new(db)), subject.id)
    }

    #[tokio::test]
    async fn last_write_wins() {
        let (store, id) = store_with_subject();
        let first = CorrectionSet::new(vec![Step::default()]);
        let mut second = CorrectionSet::new(vec![Step::default(), Step::default()]);
        second.steps[1].step_order = 1;

        assert_eq!(store.save(id, first).await.unwrap(), 1);
        assert_eq!(store.save(id, second.clone()).await.unwrap(), 2);
        assert_eq!(store.load(id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn save_accepts_invalid_documents() {
        let (store, id) = store_with_subject();
        // Two steps with the same order: rejected at confirm, not here.
        let doc = CorrectionSet::new(vec![Step::default(), Step::default()]);
        assert!(store.save(id, doc).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_subject_is_not_found() {
        let (store, _) = store_with_subject();
        let err = store.save(999, CorrectionSet::default()).await.unwrap_err();
        assert!(matches!(err, EditingError::SubjectNotFound { id: 999 }));
        assert!(matches!(
            store.load(999).await,
            Err(EditingError::SubjectNotFound { id: 999 })
        ));
    }
}
