// Maintenance-mode admission gate.
//
// While paused:
//   LATEST_CHANGES                      admitted for anyone
//   COMMIT / SQUASH                     admitted only if the caller manages the
//                                       target project AND paused the server
//   everything else                     rejected
// Pause and resume themselves never pass through this gate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chronicle_common::protocol::Endpoint;
use chronicle_common::types::{ProjectId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::AccessConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("server is in maintenance mode")]
    Paused { pausing_user: Option<UserId> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceState {
    pub paused: bool,
    pub pausing_user: Option<UserId>,
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionController {
    state: Arc<RwLock<MaintenanceState>>,
    workflow_managers: Arc<HashMap<ProjectId, HashSet<UserId>>>,
}

impl AdmissionController {
    pub fn new(workflow_managers: HashMap<ProjectId, HashSet<UserId>>) -> Self {
        Self { state: Arc::default(), workflow_managers: Arc::new(workflow_managers) }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(
            config
                .projects
                .iter()
                .map(|project| (project.id.clone(), project.workflow_managers.iter().cloned().collect()))
                .collect(),
        )
    }

    pub async fn pause(&self, by: UserId) {
        let mut state = self.state.write().await;
        info!(user_id = %by, "entering maintenance mode");
        *state = MaintenanceState { paused: true, pausing_user: Some(by) };
    }

    pub async fn resume(&self) {
        let mut state = self.state.write().await;
        if state.paused {
            info!(pausing_user = ?state.pausing_user.as_ref().map(UserId::as_str), "leaving maintenance mode");
        }
        *state = MaintenanceState::default();
    }

    pub async fn state(&self) -> MaintenanceState {
        self.state.read().await.clone()
    }

    pub fn is_workflow_manager(&self, user: &UserId, project: &ProjectId) -> bool {
        self.workflow_managers.get(project).is_some_and(|managers| managers.contains(user))
    }

    /// Decide whether `caller` may run `endpoint` against `project` right now.
    pub async fn admit(
        &self,
        endpoint: Endpoint,
        caller: &UserId,
        project: Option<&ProjectId>,
    ) -> Result<(), AdmissionError> {
        let state = self.state.read().await;
        if !state.paused {
            return Ok(());
        }

        let admitted = match endpoint {
            Endpoint::LatestChanges => true,
            Endpoint::Commit | Endpoint::Squash => {
                let manages = project.is_some_and(|project| self.is_workflow_manager(caller, project));
                let paused_it = state.pausing_user.as_ref() == Some(caller);
                manages && paused_it
            }
            Endpoint::Head | Endpoint::AllChanges | Endpoint::Document => false,
        };

        if admitted {
            Ok(())
        } else {
            Err(AdmissionError::Paused { pausing_user: state.pausing_user.clone() })
        }
    }
}
