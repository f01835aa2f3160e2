//! Early-stopping state machine for the Decomposer Trainer
//!
//! ```text
//! Initialized -> Training -> observe() -> Improved | Stalled
//!                   ^                          |
//!                   +------- advance() --------+-> Converged | Exhausted
//! ```
//!
//! `observe` takes the epoch-aggregated loss. Non-finite losses are fatal
//! ([`CoreError::Diverged`]) and leave the state untouched.

use anyhow::Result;
use serde::Serialize;

use crate::error::ensure_finite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrainingState {
    Initialized,
    Training,
    /// The last epoch beat the best loss; checkpoint it
    Improved,
    /// The last epoch did not beat the best loss
    Stalled,
    /// Patience ran out; the best checkpoint is the result
    Converged,
    /// Epoch budget ran out; the best checkpoint is the result
    Exhausted,
}

impl TrainingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Converged | Self::Exhausted)
    }
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    max_epochs: usize,
    state: TrainingState,
    epoch: usize,
    stall: usize,
    best_loss: f64,
    best_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize, max_epochs: usize) -> Self {
        Self {
            patience: patience.max(1),
            max_epochs,
            state: TrainingState::Initialized,
            epoch: 0,
            stall: 0,
            best_loss: f64::INFINITY,
            best_epoch: None,
        }
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Initialized -> Training (or straight to Exhausted with a zero budget)
    pub fn start(&mut self) -> Result<TrainingState> {
        anyhow::ensure!(
            self.state == TrainingState::Initialized,
            "start() called in state {:?}",
            self.state
        );
        self.state = if self.max_epochs == 0 {
            TrainingState::Exhausted
        } else {
            TrainingState::Training
        };
        Ok(self.state)
    }

    /// Record one epoch's aggregated loss. Strict improvement resets the
    /// stall counter.
    pub fn observe(&mut self, loss: f64) -> Result<TrainingState> {
        anyhow::ensure!(
            self.state == TrainingState::Training,
            "observe() called in state {:?}",
            self.state
        );
        ensure_finite("decomposer", self.epoch, loss)?;

        self.epoch += 1;
        if loss < self.best_loss {
            self.best_loss = loss;
            self.best_epoch = Some(self.epoch - 1);
            self.stall = 0;
            self.state = TrainingState::Improved;
        } else {
            self.stall += 1;
            self.state = TrainingState::Stalled;
        }
        Ok(self.state)
    }

    /// Improved | Stalled -> Training | Converged | Exhausted
    pub fn advance(&mut self) -> Result<TrainingState> {
        anyhow::ensure!(
            matches!(self.state, TrainingState::Improved | TrainingState::Stalled),
            "advance() called in state {:?}",
            self.state
        );
        self.state = if self.stall >= self.patience {
            TrainingState::Converged
        } else if self.epoch >= self.max_epochs {
            TrainingState::Exhausted
        } else {
            TrainingState::Training
        };
        Ok(self.state)
    }

    /// Epochs observed so far
    pub fn epochs_run(&self) -> usize {
        self.epoch
    }

    pub fn stall_count(&self) -> usize {
        self.stall
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_epoch.map(|_| self.best_loss)
    }

    /// Zero-based epoch of the best loss
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}
