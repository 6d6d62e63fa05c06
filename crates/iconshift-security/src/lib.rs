mod checksum;
mod privilege;

pub use checksum::{sha256_file_hex, sha256_hex, verify_sha256};
pub use privilege::{
    default_protected_roots, ElevationOutcome, OperationKind, PermissionGate, Preflight,
    PreflightBlock, PrivilegeAssessment, PrivilegeProbe, SystemPrivilegeProbe,
};
