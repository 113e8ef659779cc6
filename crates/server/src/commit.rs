use std::sync::Arc;

use chronicle_common::history::ChangeHistory;
use chronicle_common::protocol::messages::CommitReceipt;
use chronicle_common::types::{Checksum, CommitBundle, ProjectId, UserId};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

use crate::access::{AccessPolicy, Operation};
use crate::history::{HistoryError, HistoryStore};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit baseline is out of sync with the project")]
    Conflict { submitted: Checksum, current: Checksum },

    #[error("user `{user}` may not commit to `{project}`")]
    Unauthorized { user: UserId, project: ProjectId },

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Validates and appends commits, one project at a time.
#[derive(Clone)]
pub struct CommitCoordinator {
    store: Arc<HistoryStore>,
    policy: Arc<dyn AccessPolicy>,
}

impl CommitCoordinator {
    pub fn new(store: Arc<HistoryStore>, policy: Arc<dyn AccessPolicy>) -> Self {
        Self { store, policy }
    }

    /// Append `bundle` if its baseline matches the project's current state
    /// checksum and `caller` may commit. The entry is durable before this
    /// returns `Ok`.
    ///
    /// The checksum check, the authorization check and the append all run
    /// under the project gate, so of two commits quoting the same baseline
    /// exactly one succeeds.
    pub async fn commit(
        &self,
        caller: &UserId,
        project_id: &ProjectId,
        bundle: CommitBundle,
    ) -> Result<CommitReceipt, CommitError> {
        async move {
            let project = self.store.project(project_id).await?;
            let guard = project.lock().await;

            let head = guard.head().await;
            if bundle.baseline != head.state_checksum {
                debug!(submitted = %bundle.baseline, current = %head.state_checksum, "rejecting stale commit");
                return Err(CommitError::Conflict { submitted: bundle.baseline, current: head.state_checksum });
            }

            if !self.policy.is_authorized(caller, Operation::Commit, Some(project_id)) {
                return Err(CommitError::Unauthorized { user: caller.clone(), project: project_id.clone() });
            }

            // The log records who actually committed, whatever the client claimed.
            let mut metadata = bundle.metadata;
            metadata.author = caller.clone();

            let (entry, state_checksum) = guard.append(&bundle.changes, &metadata).await?;
            drop(guard);

            let revision = entry.revision;
            let mut history = ChangeHistory::starting_at(head.revision);
            history.push_entry(entry).map_err(HistoryError::from)?;
            info!(revision = %revision, changes = bundle.changes.len(), "committed changes");

            Ok(CommitReceipt { revision, state_checksum, history })
        }
        .instrument(info_span!("chronicle.commit", project_id = %project_id, user_id = %caller))
        .await
    }
}
