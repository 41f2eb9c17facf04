//! Absolute deadlines raced against a cancellation token.
//!
//! Every blocking wait in a cycle (the scrape batch, each broker publish)
//! runs through [`Deadline::run`], so a stop signal interrupts it as promptly
//! as an elapsed budget does.

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Why a wait ended before its future completed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("deadline elapsed")]
    Elapsed,
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
    cancel: CancellationToken,
}

impl Deadline {
    /// A deadline `budget` from now, interrupted early when `cancel` fires.
    pub fn after(budget: Duration, cancel: &CancellationToken) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
            cancel: cancel.clone(),
        }
    }

    /// Same budget and token, measured from now.
    pub fn renew(&self) -> Self {
        Self::after(self.budget, &self.cancel)
    }

    /// The earlier of this deadline and `budget` from now.
    pub fn cap(&self, budget: Duration) -> Self {
        let capped = Instant::now() + budget;
        if capped < self.at {
            Self {
                at: capped,
                budget,
                cancel: self.cancel.clone(),
            }
        } else {
            self.clone()
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drives `fut` until it completes, the deadline passes or the token is
    /// cancelled. Cancellation wins when both are ready. An interrupted
    /// future is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            res = timeout_at(self.at, fut) => res.map_err(|_| Interrupted::Elapsed),
        }
    }
}
