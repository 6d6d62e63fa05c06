use std::panic::{self, AssertUnwindSafe};

use iconshift_core::{ErrorKind, IconError, IconRef, IconResult, Target};
use tracing::{debug, info, warn};

use crate::ledger::Operation;
use crate::replacer::Replacer;

/// Reported to the progress callback after every processed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based position of the item that just finished.
    pub index: usize,
    pub total: usize,
    pub target: Target,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// 0-based position in the input sequence.
    pub index: usize,
    pub target: Target,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub operations: Vec<Operation>,
    pub failed: Vec<BatchFailure>,
    /// Items never attempted because the run was cancelled.
    pub skipped: usize,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.operations.len()
    }

    pub fn cancelled(&self) -> bool {
        self.skipped > 0
    }

    pub fn into_result(self) -> IconResult<Self> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        Err(IconError::PartialBatchFailure {
            total: self.total,
            failures: self
                .failed
                .into_iter()
                .map(|failure| (failure.target, failure.reason))
                .collect(),
        })
    }
}

/// Runs one replacement per target, in order, continuing past failures.
/// Never commits; the caller decides what happens to the ledger.
pub struct BatchSequencer<'a> {
    replacer: &'a mut Replacer,
}

impl<'a> BatchSequencer<'a> {
    pub fn new(replacer: &'a mut Replacer) -> Self {
        Self { replacer }
    }

    /// `should_cancel` is consulted before each item; an item already
    /// started always runs to completion.
    pub fn run<P, C>(
        &mut self,
        targets: &[Target],
        icon: &IconRef,
        mut progress: P,
        should_cancel: C,
    ) -> BatchReport
    where
        P: FnMut(&BatchProgress) -> anyhow::Result<()>,
        C: Fn() -> bool,
    {
        let total = targets.len();
        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };

        for (index, target) in targets.iter().enumerate() {
            if should_cancel() {
                report.skipped = total - index;
                info!(processed = index, skipped = report.skipped, "batch cancelled");
                break;
            }

            let succeeded = match self.replacer.replace(target, icon) {
                Ok(operation) => {
                    // A repeated target displaces its earlier pending operation.
                    report
                        .operations
                        .retain(|earlier| !earlier.address.same_resource(&operation.address));
                    report.operations.push(operation);
                    true
                }
                Err(err) => {
                    warn!(index, resource = %target, error = %err, "batch item failed");
                    report.failed.push(BatchFailure {
                        index,
                        target: target.clone(),
                        kind: err.kind(),
                        reason: err.to_string(),
                    });
                    false
                }
            };

            let update = BatchProgress {
                index: index + 1,
                total,
                target: target.clone(),
                succeeded,
            };
            match panic::catch_unwind(AssertUnwindSafe(|| progress(&update))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %format!("{err:#}"), "progress callback failed"),
                Err(_) => warn!(index = index + 1, "progress callback panicked"),
            }
        }

        info!(
            total,
            succeeded = report.succeeded(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "batch finished"
        );
        report
    }
}
