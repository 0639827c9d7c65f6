//! Snapshot/revert isolation around scenarios.
//!
//! Every scenario runs between a snapshot and a revert to that snapshot, so
//! none of them can observe what another one left behind. Isolation levels
//! nest: the runner keeps a module-level snapshot open around the module's
//! fixtures and opens a scenario-level one inside it.

use std::future::Future;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;

use futures_util::FutureExt as _;
use tracing::{debug, error};

use crate::chain::{ChainControl, ChainError, SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationState {
    Clean,
    /// Innermost open snapshot.
    Snapshotted(SnapshotId),
    /// A revert failed. The chain no longer matches any known snapshot.
    Poisoned,
}

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("failed to snapshot chain state: {0}")]
    Snapshot(#[source] ChainError),
    #[error("failed to revert to snapshot {id}: {source}")]
    Revert {
        id: SnapshotId,
        #[source]
        source: ChainError,
    },
    #[error("no snapshot is open")]
    NotSnapshotted,
    #[error("chain state is poisoned by an earlier failed revert")]
    Poisoned,
}

pub struct Isolation<C> {
    chain: Arc<C>,
    open: Vec<SnapshotId>,
    poisoned: bool,
}

impl<C: ChainControl> Isolation<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self {
            chain,
            open: Vec::new(),
            poisoned: false,
        }
    }

    pub fn state(&self) -> IsolationState {
        if self.poisoned {
            return IsolationState::Poisoned;
        }

        self.open
            .last()
            .map_or(IsolationState::Clean, |id| IsolationState::Snapshotted(*id))
    }

    /// Nesting depth of open snapshots.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Opens a new innermost snapshot.
    pub async fn enter(&mut self) -> Result<SnapshotId, IsolationError> {
        if self.poisoned {
            return Err(IsolationError::Poisoned);
        }

        let id = self
            .chain
            .snapshot()
            .await
            .map_err(IsolationError::Snapshot)?;
        self.open.push(id);
        debug!(snapshot = %id, depth = self.open.len(), "Entered isolation");
        Ok(id)
    }

    /// Reverts the innermost snapshot. Failure poisons the controller.
    pub async fn exit(&mut self) -> Result<(), IsolationError> {
        if self.poisoned {
            return Err(IsolationError::Poisoned);
        }

        let id = self.open.pop().ok_or(IsolationError::NotSnapshotted)?;

        if let Err(source) = self.chain.revert(id).await {
            error!(snapshot = %id, %source, "Revert failed, isolation poisoned");
            self.poisoned = true;
            self.open.clear();
            return Err(IsolationError::Revert { id, source });
        }

        debug!(snapshot = %id, depth = self.open.len(), "Exited isolation");
        Ok(())
    }

    /// Runs `scenario` inside a fresh snapshot and reverts afterwards,
    /// whether it returned normally or panicked. A panic is resumed once the
    /// chain has been restored.
    pub async fn run<F, T>(&mut self, scenario: F) -> Result<T, IsolationError>
    where
        F: Future<Output = T>,
    {
        self.enter().await?;

        let outcome = AssertUnwindSafe(scenario).catch_unwind().await;

        self.exit().await?;

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => resume_unwind(panic),
        }
    }
}
