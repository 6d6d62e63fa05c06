use std::time::{SystemTime, UNIX_EPOCH};

use iconshift_core::{IconRef, ResourceKind, Target};

use crate::accessor::{ResourceAddress, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Committed,
    RolledBack,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
        }
    }
}

/// One applied mutation and everything needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: String,
    pub target: Target,
    pub resource_kind: ResourceKind,
    pub address: ResourceAddress,
    pub prior_value: Snapshot,
    pub new_value: IconRef,
    pub timestamp: u64,
    pub status: OperationStatus,
}

impl Operation {
    pub fn describe(&self) -> String {
        format!(
            "{} -> {} ({})",
            self.target,
            self.new_value.location(),
            self.status.as_str()
        )
    }
}

/// Ordered pending operations, oldest first.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    operations: Vec<Operation>,
    next_seq: u64,
}

impl Ledger {
    pub(crate) fn next_id(&mut self) -> String {
        self.next_seq += 1;
        format!("op-{}", self.next_seq)
    }

    pub(crate) fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub(crate) fn last(&self) -> Option<&Operation> {
        self.operations.last()
    }

    pub(crate) fn pop(&mut self) -> Option<Operation> {
        self.operations.pop()
    }

    /// Two targets that resolve to the same resource share one entry.
    pub(crate) fn position(&self, address: &ResourceAddress) -> Option<usize> {
        self.operations
            .iter()
            .position(|operation| operation.address.same_resource(address))
    }

    pub(crate) fn remove(&mut self, index: usize) -> Operation {
        self.operations.remove(index)
    }

    pub(crate) fn insert(&mut self, index: usize, operation: Operation) {
        let index = index.min(self.operations.len());
        self.operations.insert(index, operation);
    }

    pub(crate) fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub(crate) fn clear(&mut self) {
        self.operations.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.operations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

pub(crate) fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
