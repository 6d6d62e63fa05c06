mod config;
mod error;
mod icon;
mod target;

pub use config::{BatchPlan, EngineConfig, FailurePolicy, DEFAULT_MAX_BACKUPS};
pub use error::{ErrorKind, IconError, IconResult};
pub use icon::{
    FormatIconValidator, IconRef, IconValidator, MAX_ICON_BYTES, SUPPORTED_ICON_EXTENSIONS,
};
pub use target::{ResourceKind, Target, TargetKind};

#[cfg(test)]
mod tests;
