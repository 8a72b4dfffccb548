//! Periodic reclamation of abandoned editing sessions.
//!
//! Only rows whose expiry has already passed are touched, and the cancel is
//! a conditional update, so a sweep racing a user operation can at worst
//! change when a nearly-expired session closes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::lifecycle::SessionManager;
use super::ws::{EditingEvent, broadcast_event};
use crate::errors::EditingError;

#[derive(Clone)]
pub struct ExpirySweeper {
    sessions: SessionManager,
}

impl ExpirySweeper {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    /// Cancel every active session that expired before `now`. Returns how
    /// many were swept.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, EditingError> {
        let expired = self
            .sessions
            .db
            .call(move |db| db.list_expired(&now))
            .await?;

        let mut swept = 0;
        for subject in expired {
            let subject_id = subject.id;
            let resting = subject.kind.resting_status();
            let cancelled = self
                .sessions
                .db
                .call(move |db| db.expire_session(subject_id, resting, &now))
                .await?;
            if !cancelled {
                // Touched by a user operation since the scan.
                continue;
            }
            swept += 1;
            self.sessions.logins.abort(subject_id);
            self.sessions.close_best_effort(subject_id).await;
            broadcast_event(
                &self.sessions.events,
                subject_id,
                EditingEvent::SessionExpired { status: resting },
            );
        }

        if swept > 0 {
            tracing::info!(swept, "expired editing sessions swept");
        } else {
            tracing::debug!(swept, "no expired editing sessions");
        }
        Ok(swept)
    }

    /// Sweep on a fixed interval until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        tracing::error!(error = %e, "expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("expiry sweeper stopped");
    }
}
