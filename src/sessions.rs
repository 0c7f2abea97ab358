//! Session lifecycle and per-phase payload persistence.
//!
//! A session is nothing but the set of its phase records: it exists while
//! at least one of the four phases has a non-expired payload. Records are
//! upserts keyed by `"{session_id}:{phase}"` and expire 90 days after
//! their last write.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{DeleteOutcome, Phase, PhasePayload, SessionStatus, SweepOutcome};
use crate::store::StoreHandle;

pub const PHASE_DATA: &str = "phase_data";

const PHASE_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

fn phase_key(session_id: &str, phase: Phase) -> String {
    format!("{}:{}", session_id, phase.as_str())
}

#[derive(Clone)]
pub struct PhaseStore {
    store: StoreHandle,
}

impl PhaseStore {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Allocate a fresh session id. The session only becomes observable
    /// once its first phase record is saved.
    pub fn new_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Upsert a phase payload. Resubmitting a phase overwrites its prior
    /// result and restarts the 90-day clock.
    pub async fn save_phase(
        &self,
        session_id: &str,
        payload: &PhasePayload,
    ) -> Result<(), StoreError> {
        let phase = payload.phase();
        let key = phase_key(session_id, phase);
        let value =
            serde_json::to_value(payload).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        debug!(session = %session_id, %phase, "save_phase");
        self.store
            .call(move |s| s.put(PHASE_DATA, &key, &value, Some(PHASE_TTL)))
            .await
    }

    /// Load a phase payload. Returns `None` both when never written and
    /// when expired. A record whose tag does not match the requested
    /// phase is corruption and is surfaced, not coerced.
    pub async fn load_phase(
        &self,
        session_id: &str,
        phase: Phase,
    ) -> Result<Option<PhasePayload>, StoreError> {
        let key = phase_key(session_id, phase);
        let Some(value) = self.store.call(move |s| s.get(PHASE_DATA, &key)).await? else {
            return Ok(None);
        };
        let payload: PhasePayload =
            serde_json::from_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if payload.phase() != phase {
            return Err(StoreError::Corrupt(format!(
                "record for {} phase {} holds a {} payload",
                session_id,
                phase,
                payload.phase()
            )));
        }
        Ok(Some(payload))
    }

    /// True iff any of the four phases has a non-expired record.
    pub async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        let prefix = format!("{}:", session_id);
        let keys = self
            .store
            .call(move |s| s.scan_keys(PHASE_DATA, Some(&prefix)))
            .await?;
        Ok(!keys.is_empty())
    }

    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus, StoreError> {
        let prefix = format!("{}:", session_id);
        let keys = self
            .store
            .call(move |s| s.scan_keys(PHASE_DATA, Some(&prefix)))
            .await?;

        let mut phases = BTreeMap::new();
        let mut completed = 0usize;
        for phase in Phase::all() {
            let done = keys
                .iter()
                .any(|k| k.rsplit_once(':').is_some_and(|(_, p)| p == phase.as_str()));
            if done {
                completed += 1;
            }
            phases.insert(phase.as_str().to_string(), done);
        }

        Ok(SessionStatus {
            session_id: session_id.to_string(),
            exists: completed > 0,
            phases,
            completed_phases: completed,
            total_phases: Phase::all().len(),
            progress_percentage: completed as f64 / Phase::all().len() as f64 * 100.0,
        })
    }

    /// Remove every phase record for a session.
    pub async fn delete_session(&self, session_id: &str) -> Result<DeleteOutcome, StoreError> {
        let id = session_id.to_string();
        let outcome = self
            .store
            .call(move |s| {
                let mut deleted_phases = Vec::new();
                for phase in Phase::all() {
                    if s.delete(PHASE_DATA, &phase_key(&id, phase))? {
                        deleted_phases.push(phase.as_str().to_string());
                    }
                }
                let total_deleted = deleted_phases.len();
                Ok(DeleteOutcome {
                    session_id: id,
                    deleted_phases,
                    total_deleted,
                })
            })
            .await?;
        info!(session = %outcome.session_id, deleted = outcome.total_deleted, "delete_session");
        Ok(outcome)
    }

    /// Bulk-delete expired phase records, reporting counts per phase.
    /// Idempotent; safe to run while traffic is flowing.
    pub async fn sweep_expired(&self) -> Result<SweepOutcome, StoreError> {
        let purged = self
            .store
            .call(|s| s.purge_expired(PHASE_DATA))
            .await?;

        let mut deleted_by_phase: BTreeMap<String, u64> = BTreeMap::new();
        for phase in Phase::all() {
            deleted_by_phase.insert(phase.as_str().to_string(), 0);
        }
        for key in &purged {
            if let Some((_, phase)) = key.rsplit_once(':') {
                *deleted_by_phase.entry(phase.to_string()).or_default() += 1;
            }
        }
        let outcome = SweepOutcome {
            total_deleted: purged.len() as u64,
            deleted_by_phase,
        };
        info!(deleted = outcome.total_deleted, "sweep_expired");
        Ok(outcome)
    }

    /// Status summaries for every live session.
    pub async fn list_sessions(&self) -> Result<Vec<SessionStatus>, StoreError> {
        let keys = self.store.call(|s| s.scan_keys(PHASE_DATA, None)).await?;
        let mut session_ids: Vec<String> = keys
            .iter()
            .filter_map(|k| k.rsplit_once(':').map(|(id, _)| id.to_string()))
            .collect();
        session_ids.sort();
        session_ids.dedup();

        let mut sessions = Vec::with_capacity(session_ids.len());
        for id in session_ids {
            sessions.push(self.session_status(&id).await?);
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IntakeForm, RoutineResult, SkinAnalysis};
    use crate::store::Store;

    fn phase_store() -> PhaseStore {
        PhaseStore::new(StoreHandle::new(Store::open_in_memory().unwrap()))
    }

    fn intake_payload() -> PhasePayload {
        PhasePayload::Intake(IntakeForm {
            skin_type: vec!["oily".into()],
            skin_conditions: vec!["acne".into()],
            budget: "$20".into(),
            allergies: vec![],
            product_experiences: vec![],
            goals: vec!["clear skin".into()],
            custom_goal: None,
        })
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = phase_store();
        store.save_phase("s1", &intake_payload()).await.unwrap();

        let loaded = store.load_phase("s1", Phase::Intake).await.unwrap();
        assert!(matches!(loaded, Some(PhasePayload::Intake(_))));
        assert!(store.load_phase("s1", Phase::Analysis).await.unwrap().is_none());
        assert!(store.load_phase("nope", Phase::Intake).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resubmission_upserts_rather_than_duplicating() {
        let store = phase_store();
        store.save_phase("s1", &intake_payload()).await.unwrap();
        store.save_phase("s1", &intake_payload()).await.unwrap();

        let status = store.session_status("s1").await.unwrap();
        assert_eq!(status.completed_phases, 1);

        // The payload is still readable after the second write.
        let loaded = store.load_phase("s1", Phase::Intake).await.unwrap().unwrap();
        match loaded {
            PhasePayload::Intake(form) => assert_eq!(form.budget, "$20"),
            other => panic!("expected intake payload, got {:?}", other.phase()),
        }
    }

    #[tokio::test]
    async fn session_exists_only_with_a_live_record() {
        let store = phase_store();
        assert!(!store.session_exists("s1").await.unwrap());
        store.save_phase("s1", &intake_payload()).await.unwrap();
        assert!(store.session_exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn status_reports_progress_percentage() {
        let store = phase_store();
        store.save_phase("s1", &intake_payload()).await.unwrap();
        store
            .save_phase("s1", &PhasePayload::Analysis(SkinAnalysis::default()))
            .await
            .unwrap();

        let status = store.session_status("s1").await.unwrap();
        assert!(status.exists);
        assert_eq!(status.completed_phases, 2);
        assert_eq!(status.total_phases, 4);
        assert_eq!(status.progress_percentage, 50.0);
        assert!(status.phases["intake"]);
        assert!(status.phases["analysis"]);
        assert!(!status.phases["recommendation"]);
        assert!(!status.phases["routine"]);
    }

    #[tokio::test]
    async fn delete_session_names_removed_phases() {
        let store = phase_store();
        store.save_phase("s1", &intake_payload()).await.unwrap();
        store
            .save_phase("s1", &PhasePayload::Routine(RoutineResult { routine: vec![] }))
            .await
            .unwrap();

        let outcome = store.delete_session("s1").await.unwrap();
        assert_eq!(outcome.total_deleted, 2);
        assert_eq!(outcome.deleted_phases, vec!["intake", "routine"]);
        assert!(!store.session_exists("s1").await.unwrap());

        let again = store.delete_session("s1").await.unwrap();
        assert_eq!(again.total_deleted, 0);
    }

    #[tokio::test]
    async fn list_sessions_groups_by_session_id() {
        let store = phase_store();
        store.save_phase("s1", &intake_payload()).await.unwrap();
        store.save_phase("s2", &intake_payload()).await.unwrap();
        store
            .save_phase("s2", &PhasePayload::Analysis(SkinAnalysis::default()))
            .await
            .unwrap();

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "s1");
        assert_eq!(sessions[1].completed_phases, 2);
    }

    #[tokio::test]
    async fn sweep_on_fresh_data_deletes_nothing() {
        let store = phase_store();
        store.save_phase("s1", &intake_payload()).await.unwrap();

        let outcome = store.sweep_expired().await.unwrap();
        assert_eq!(outcome.total_deleted, 0);
        assert!(store.session_exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn expired_phase_record_is_absent_before_any_sweep() {
        let handle = StoreHandle::new(Store::open_in_memory().unwrap());
        let store = PhaseStore::new(handle.clone());

        // Write a record that expires immediately, bypassing the 90-day TTL.
        let value = serde_json::to_value(intake_payload()).unwrap();
        handle
            .call(move |s| {
                s.put(
                    PHASE_DATA,
                    "s1:intake",
                    &value,
                    Some(Duration::from_millis(0)),
                )
            })
            .await
            .unwrap();

        assert!(store.load_phase("s1", Phase::Intake).await.unwrap().is_none());
        assert!(!store.session_exists("s1").await.unwrap());
        let status = store.session_status("s1").await.unwrap();
        assert!(!status.exists);
    }

    #[tokio::test]
    async fn new_session_ids_are_unique() {
        let a = PhaseStore::new_session_id();
        let b = PhaseStore::new_session_id();
        assert_ne!(a, b);
    }
}
