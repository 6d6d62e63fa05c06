use iconshift_core::{IconError, IconRef, IconResult, IconValidator, Target};
use iconshift_security::{OperationKind, PermissionGate, PreflightBlock};
use tracing::{debug, info, warn};

use crate::accessor::{AccessorTable, ResourceAccessor, ResourceAddress, Snapshot};
use crate::backup::{Backup, BackupStore, RestoreReport};
use crate::ledger::{current_unix_timestamp, Ledger, Operation, OperationStatus};

/// Outcome of [`Replacer::rollback_all`]. A failed restore stops the run and
/// leaves the failed operation and everything older in the ledger.
#[derive(Debug)]
pub struct RollbackSummary {
    pub rolled_back: Vec<Operation>,
    pub remaining: usize,
    pub failure: Option<IconError>,
}

impl RollbackSummary {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.remaining == 0
    }
}

/// Applies icon changes while keeping a ledger of pending operations that
/// can be rolled back or committed into one backup.
pub struct Replacer {
    store: BackupStore,
    accessors: AccessorTable,
    gate: PermissionGate,
    validator: Box<dyn IconValidator>,
    ledger: Ledger,
    last_backup_id: Option<String>,
}

impl Replacer {
    pub fn new(
        store: BackupStore,
        accessors: AccessorTable,
        gate: PermissionGate,
        validator: Box<dyn IconValidator>,
    ) -> Self {
        Self {
            store,
            accessors,
            gate,
            validator,
            ledger: Ledger::default(),
            last_backup_id: None,
        }
    }

    pub fn backup_store(&self) -> &BackupStore {
        &self.store
    }

    pub fn accessors(&self) -> &AccessorTable {
        &self.accessors
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.len()
    }

    pub fn pending(&self) -> &[Operation] {
        self.ledger.operations()
    }

    pub fn last_backup_id(&self) -> Option<&str> {
        self.last_backup_id.as_deref()
    }

    /// Points `target` at `icon` and records a pending operation. On failure
    /// the ledger is unchanged and no operation is recorded.
    pub fn replace(&mut self, target: &Target, icon: &IconRef) -> IconResult<Operation> {
        let target = target.normalized()?;
        self.validator.validate(icon)?;
        self.preflight(OperationKind::Replace, &target)?;

        let accessor = self.accessors.for_target(&target);
        let address = accessor.resolve(&target)?;

        let displaced = match self.ledger.position(&address) {
            Some(index) => {
                let previous = self.ledger.remove(index);
                if let Err(err) = accessor.restore(&previous.address, &previous.prior_value) {
                    self.ledger.insert(index, previous);
                    return Err(err);
                }
                debug!(
                    resource = %target,
                    address = %address,
                    replaced = %previous.id,
                    "reverted pending operation before re-applying"
                );
                Some((index, previous))
            }
            None => None,
        };

        let prior_value = match apply(accessor, &address, icon) {
            Ok(prior_value) => prior_value,
            Err(err) => {
                if let Some((index, previous)) = displaced {
                    if let Err(reapply) = accessor.write(&previous.address, &previous.new_value) {
                        warn!(
                            resource = %target,
                            error = %reapply,
                            "failed to re-apply displaced operation"
                        );
                    }
                    self.ledger.insert(index, previous);
                }
                return Err(err);
            }
        };

        let operation = Operation {
            id: self.ledger.next_id(),
            resource_kind: accessor.kind(),
            target,
            address,
            prior_value,
            new_value: icon.clone(),
            timestamp: current_unix_timestamp(),
            status: OperationStatus::Pending,
        };
        info!(
            operation = %operation.id,
            resource = %operation.target,
            location = %operation.new_value.location(),
            "applied icon replacement"
        );
        self.ledger.push(operation.clone());
        Ok(operation)
    }

    /// Undoes the most recent pending operation.
    pub fn rollback_last(&mut self) -> IconResult<Operation> {
        let Some(last) = self.ledger.last() else {
            return Err(IconError::NothingToRollback {
                committed_backup: self.last_backup_id.clone(),
            });
        };

        self.accessors
            .for_kind(last.resource_kind)
            .restore(&last.address, &last.prior_value)?;

        let Some(mut operation) = self.ledger.pop() else {
            return Err(IconError::NothingToRollback {
                committed_backup: self.last_backup_id.clone(),
            });
        };
        operation.status = OperationStatus::RolledBack;
        info!(
            operation = %operation.id,
            resource = %operation.target,
            "rolled back icon replacement"
        );
        Ok(operation)
    }

    pub fn rollback_all(&mut self) -> IconResult<RollbackSummary> {
        if self.ledger.is_empty() {
            return Err(IconError::NothingToRollback {
                committed_backup: self.last_backup_id.clone(),
            });
        }

        let mut rolled_back = Vec::new();
        let mut failure = None;
        while !self.ledger.is_empty() {
            match self.rollback_last() {
                Ok(operation) => rolled_back.push(operation),
                Err(err) => {
                    warn!(error = %err, remaining = self.ledger.len(), "rollback stopped");
                    failure = Some(err);
                    break;
                }
            }
        }

        Ok(RollbackSummary {
            rolled_back,
            remaining: self.ledger.len(),
            failure,
        })
    }

    /// Persists every pending operation into one backup and clears the
    /// ledger. Nothing is marked committed unless the backup was written.
    pub fn commit(&mut self) -> IconResult<Backup> {
        if self.ledger.is_empty() {
            return Err(IconError::NothingToCommit);
        }

        let committed = self
            .ledger
            .operations()
            .iter()
            .cloned()
            .map(|mut operation| {
                operation.status = OperationStatus::Committed;
                operation
            })
            .collect::<Vec<_>>();
        let backup = self.store.create(&committed)?;

        self.ledger.clear();
        self.last_backup_id = Some(backup.id.clone());
        info!(backup_id = %backup.id, operations = committed.len(), "committed pending operations");
        Ok(backup)
    }

    /// Restores a committed backup after checking every target with the gate.
    pub fn restore_backup(&self, backup_id: &str) -> IconResult<RestoreReport> {
        let backup = self.store.get(backup_id)?;
        for entry in &backup.entries {
            self.preflight(OperationKind::Restore, &entry.target)?;
        }
        self.store.restore(backup_id, &self.accessors)
    }

    fn preflight(&self, operation: OperationKind, target: &Target) -> IconResult<()> {
        let preflight = self.gate.validate_operation(operation, target);
        if preflight.can_proceed {
            return Ok(());
        }

        if preflight.needs_elevation {
            return Err(IconError::ElevationRequired {
                target: target.to_string(),
                guidance: preflight.message,
            });
        }
        Err(match preflight.block {
            Some(PreflightBlock::NotWritable) => {
                IconError::access_denied(target, target.resource_kind(), preflight.message)
            }
            _ => IconError::invalid_target(target, preflight.message),
        })
    }
}

/// Snapshots then writes; a failed write is compensated with the snapshot.
fn apply(
    accessor: &dyn ResourceAccessor,
    address: &ResourceAddress,
    icon: &IconRef,
) -> IconResult<Snapshot> {
    let prior_value = accessor.snapshot_for_write(address, icon)?;
    if let Err(err) = accessor.write(address, icon) {
        if let Err(compensation) = accessor.restore(address, &prior_value) {
            warn!(address = %address, error = %compensation, "failed to undo partial write");
        }
        return Err(err);
    }
    Ok(prior_value)
}
