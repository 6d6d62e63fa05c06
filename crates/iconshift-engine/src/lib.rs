mod accessor;
mod backup;
mod batch;
mod command;
mod folder;
mod fs_utils;
mod layout;
mod ledger;
mod maintenance;
mod objects;
mod registry;
mod replacer;
mod shortcut;

pub use accessor::{AccessorTable, ResourceAccessor, ResourceAddress, Snapshot};
pub use backup::{
    Backup, BackupEntry, BackupStore, IntegrityReport, PriorRecord, RestoreReport, StoredFile,
    StoredMarker,
};
pub use batch::{BatchFailure, BatchProgress, BatchReport, BatchSequencer};
pub use folder::{
    AttributeControl, CapturedFile, FileAttributes, FolderMarkerAccessor, FolderSnapshot,
    MarkerState, NoopAttributes, WindowsAttributes, MARKER_FILE_NAME,
};
pub use layout::{default_state_root, StateLayout};
pub use ledger::{Operation, OperationStatus};
pub use maintenance::{clear_icon_cache, CacheClearReport};
pub use objects::{BlobStore, ObjectState};
pub use registry::{
    KeyValueStore, MemoryKeyStore, RegCommandStore, RegistryIconAccessor, RegistrySnapshot,
    RegistryValue, UnavailableKeyStore, CLASSES_ROOT,
};
pub use replacer::{Replacer, RollbackSummary};
pub use shortcut::{
    PowerShellBridge, ShellBridge, ShortcutAccessor, ShortcutMetadata, ShortcutSnapshot,
    UnavailableBridge,
};
