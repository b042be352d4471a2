use crate::error::{ Error, Result };
use crate::storage::encrypted::EncryptedKv;
use crate::storage::kv::KvStore;
use crate::storage::OPERATION_PREFIX;
use chrono::Utc;
use shared::operation::{
    sorted_participants,
    OperationData,
    OperationRequest,
    OperationResult,
    OperationStatus,
};
use shared::session::{ derive_session_id, request_fingerprint };
use std::collections::HashMap;
use std::sync::{ Arc, RwLock };
use tokio::sync::watch;
use tracing::{ info, warn };
use uuid::Uuid;

/// In-memory face of one live operation. The driver owns the status
/// transitions; the registry owns the map and the persistence.
struct ActiveOperation {
    data: OperationData,
    cancel_tx: watch::Sender<bool>,
}

/// Outcome of an idempotent create.
pub enum CreateOutcome {
    /// Fresh operation; the caller must spawn its driver with this cancel
    /// signal.
    Created(OperationData, watch::Receiver<bool>),
    /// Same id and fingerprint seen before; no state changed.
    Existing(OperationData),
}

/// Registry of operations: idempotent creation keyed by operation id,
/// deterministic session identity, the live set in memory and the full
/// history persisted under `op/<id>`.
#[derive(Clone)]
pub struct OperationRegistry {
    store: Arc<EncryptedKv>,
    active: Arc<RwLock<HashMap<String, ActiveOperation>>>,
}

impl OperationRegistry {
    pub fn new(store: Arc<EncryptedKv>) -> Self {
        Self { store, active: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Sweep persisted history for operations interrupted by a restart.
    /// They cannot be resumed (the party state lived only in memory), so
    /// they are marked failed rather than left dangling forever.
    pub fn recover_on_startup(&self) -> Result<()> {
        let mut interrupted = 0usize;
        for key in self.store.list(OPERATION_PREFIX)? {
            let mut data: OperationData = serde_json::from_slice(&self.store.load(&key)?)?;
            if !data.status.is_terminal() {
                data.status = OperationStatus::Failed;
                data.completed_at = Some(Utc::now());
                data.error = Some("node restarted while the operation was live".to_string());
                self.store.save(&key, &serde_json::to_vec(&data)?)?;
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            warn!("Marked {} interrupted operation(s) as failed during recovery", interrupted);
        }
        Ok(())
    }

    /// Idempotent create. A supplied id that already exists returns the
    /// existing operation when type and payload match and a conflict when
    /// they do not; an absent id gets a fresh UUID.
    pub fn create(&self, id: Option<String>, request: OperationRequest) -> Result<CreateOutcome> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let fingerprint = request_fingerprint(&request);

        let mut active = self.active.write().expect("registry lock");

        if let Some(existing) = active.get(&id) {
            return if request_fingerprint(&existing.data.request) == fingerprint {
                Ok(CreateOutcome::Existing(existing.data.clone()))
            } else {
                Err(Error::Conflict(format!("operation id {} reused with a different request", id)))
            };
        }

        if let Some(persisted) = self.load_persisted(&id)? {
            return if request_fingerprint(&persisted.request) == fingerprint {
                Ok(CreateOutcome::Existing(persisted))
            } else {
                Err(Error::Conflict(format!("operation id {} reused with a different request", id)))
            };
        }

        let data = OperationData {
            id: id.clone(),
            op_type: request.op_type(),
            session_id: derive_session_id(&request),
            participants: sorted_participants(request.session_participants()),
            request,
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        };
        self.persist(&data)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        active.insert(id, ActiveOperation { data: data.clone(), cancel_tx });
        info!("Created {} operation {} (session {})", data.op_type, data.id, data.session_id);
        Ok(CreateOutcome::Created(data, cancel_rx))
    }

    /// Look up an operation: live set first, persisted history second.
    pub fn get(&self, id: &str) -> Result<OperationData> {
        {
            let active = self.active.read().expect("registry lock");
            if let Some(entry) = active.get(id) {
                return Ok(entry.data.clone());
            }
        }
        self.load_persisted(id)?.ok_or_else(|| Error::NotFound(format!("operation {}", id)))
    }

    pub fn list_active(&self) -> Vec<String> {
        let active = self.active.read().expect("registry lock");
        active.keys().cloned().collect()
    }

    /// Request cancellation of a live operation. The driver observes the
    /// signal and performs the actual transition.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let active = self.active.read().expect("registry lock");
        match active.get(id) {
            Some(entry) => {
                let _ = entry.cancel_tx.send(true);
                Ok(())
            }
            None => {
                // Not live: either unknown or already terminal.
                drop(active);
                let data = self.get(id)?;
                if data.status.is_terminal() {
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("operation {} has no live driver", id)))
                }
            }
        }
    }

    /// Ask every live driver to stop. Used on shutdown.
    pub fn cancel_all(&self) {
        let active = self.active.read().expect("registry lock");
        for entry in active.values() {
            let _ = entry.cancel_tx.send(true);
        }
    }

    pub fn mark_in_progress(&self, id: &str) -> Result<()> {
        self.transition(id, OperationStatus::InProgress, |_| {})
    }

    pub fn complete(&self, id: &str, result: OperationResult) -> Result<()> {
        self.transition(id, OperationStatus::Completed, move |data| {
            data.completed_at = Some(Utc::now());
            data.result = Some(result);
        })
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.transition(id, OperationStatus::Failed, move |data| {
            data.completed_at = Some(Utc::now());
            data.error = Some(error);
        })
    }

    pub fn mark_canceled(&self, id: &str) -> Result<()> {
        self.transition(id, OperationStatus::Canceled, |data| {
            data.completed_at = Some(Utc::now());
        })
    }

    /// Apply one monotonic status transition, persist the record, and drop
    /// the operation from the live set once it turns terminal.
    fn transition(
        &self,
        id: &str,
        next: OperationStatus,
        mutate: impl FnOnce(&mut OperationData)
    ) -> Result<()> {
        let mut active = self.active.write().expect("registry lock");
        let entry = active
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("operation {} is not live", id)))?;
        if !entry.data.status.can_transition_to(next) {
            return Err(
                Error::Conflict(
                    format!("operation {} cannot move from {} to {}", id, entry.data.status, next)
                )
            );
        }
        entry.data.status = next;
        mutate(&mut entry.data);
        let snapshot = entry.data.clone();
        if next.is_terminal() {
            active.remove(id);
        }
        drop(active);
        self.persist(&snapshot)?;
        info!("Operation {} is now {}", id, next);
        Ok(())
    }

    fn persist(&self, data: &OperationData) -> Result<()> {
        let key = format!("{}{}", OPERATION_PREFIX, data.id);
        self.store.save(&key, &serde_json::to_vec(data)?)
    }

    fn load_persisted(&self, id: &str) -> Result<Option<OperationData>> {
        let key = format!("{}{}", OPERATION_PREFIX, id);
        match self.store.load(&key) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryKv;
    use shared::operation::KeygenRequest;

    fn registry() -> OperationRegistry {
        let inner: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        OperationRegistry::new(Arc::new(EncryptedKv::open(inner, "password").unwrap()))
    }

    fn keygen_request(threshold: u16) -> OperationRequest {
        OperationRequest::Keygen(KeygenRequest {
            threshold,
            participants: vec!["p2".into(), "p1".into(), "p3".into()],
            moniker: None,
        })
    }

    #[test]
    fn create_is_idempotent_for_identical_requests() {
        let registry = registry();
        let first = registry.create(Some("op1".into()), keygen_request(1)).unwrap();
        let CreateOutcome::Created(data, _cancel) = first else {
            panic!("first create must be fresh");
        };
        assert_eq!(data.status, OperationStatus::Pending);
        assert_eq!(data.participants, vec!["p1", "p2", "p3"]);

        let second = registry.create(Some("op1".into()), keygen_request(1)).unwrap();
        let CreateOutcome::Existing(existing) = second else {
            panic!("second create must return the existing operation");
        };
        assert_eq!(existing.session_id, data.session_id);
    }

    #[test]
    fn conflicting_payload_for_same_id_is_rejected() {
        let registry = registry();
        registry.create(Some("op1".into()), keygen_request(1)).unwrap();
        assert!(
            matches!(
                registry.create(Some("op1".into()), keygen_request(2)),
                Err(Error::Conflict(_))
            )
        );
    }

    #[test]
    fn transitions_are_persisted_and_terminal_ops_leave_the_live_set() {
        let registry = registry();
        registry.create(Some("op1".into()), keygen_request(1)).unwrap();
        registry.mark_in_progress("op1").unwrap();
        assert_eq!(registry.list_active(), vec!["op1".to_string()]);

        registry.fail("op1", "round timed out").unwrap();
        assert!(registry.list_active().is_empty());

        let data = registry.get("op1").unwrap();
        assert_eq!(data.status, OperationStatus::Failed);
        assert_eq!(data.error.as_deref(), Some("round timed out"));
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let registry = registry();
        registry.create(Some("op1".into()), keygen_request(1)).unwrap();
        registry.mark_in_progress("op1").unwrap();
        registry.complete(
            "op1",
            OperationResult::Keygen(shared::operation::KeygenResult {
                public_key_hex: "aa".into(),
                key_id: "bb".into(),
            })
        ).unwrap();
        assert!(matches!(registry.mark_in_progress("op1"), Err(Error::NotFound(_))));
    }

    #[test]
    fn idempotent_resubmission_after_completion_returns_history() {
        let registry = registry();
        registry.create(Some("op1".into()), keygen_request(1)).unwrap();
        registry.mark_in_progress("op1").unwrap();
        registry.fail("op1", "gone").unwrap();

        let outcome = registry.create(Some("op1".into()), keygen_request(1)).unwrap();
        let CreateOutcome::Existing(data) = outcome else {
            panic!("resubmission must find history");
        };
        assert_eq!(data.status, OperationStatus::Failed);
    }

    #[test]
    fn recovery_fails_interrupted_operations() {
        let inner: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let store = Arc::new(EncryptedKv::open(inner.clone(), "password").unwrap());
        {
            let registry = OperationRegistry::new(store.clone());
            registry.create(Some("op1".into()), keygen_request(1)).unwrap();
            registry.mark_in_progress("op1").unwrap();
        }
        let registry = OperationRegistry::new(store);
        registry.recover_on_startup().unwrap();
        let data = registry.get("op1").unwrap();
        assert_eq!(data.status, OperationStatus::Failed);
    }
}
