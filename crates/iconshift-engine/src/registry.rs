use std::collections::BTreeMap;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use iconshift_core::{IconError, IconRef, IconResult, ResourceKind, Target};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::accessor::{
    mismatched_address, mismatched_snapshot, ResourceAccessor, ResourceAddress, Snapshot,
};

pub const CLASSES_ROOT: &str = r"Software\Classes";
const HKCU: &str = "HKCU";
const REG_SUBSYSTEM: &str = "registry tool";

/// A default value together with its registry type (`REG_SZ`, `REG_EXPAND_SZ`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryValue {
    pub data: String,
    pub value_type: String,
}

impl RegistryValue {
    pub fn sz(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            value_type: "REG_SZ".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub value: Option<RegistryValue>,
    /// Keys along the path that did not exist, outermost first.
    pub missing_keys: Vec<String>,
}

/// Hierarchical key/value store scoped to the current user. Keys are
/// relative to the user hive and separated by `\`.
pub trait KeyValueStore {
    fn is_available(&self) -> bool;

    fn key_exists(&self, key: &str) -> IconResult<bool>;

    fn default_value(&self, key: &str) -> IconResult<Option<RegistryValue>>;

    /// Creates missing keys along the path.
    fn set_default_value(&self, key: &str, value: &RegistryValue) -> IconResult<()>;

    /// Succeeds when the value is already absent.
    fn delete_default_value(&self, key: &str) -> IconResult<()>;

    /// Removes `key` when it has neither values nor subkeys. Returns whether it was removed.
    fn delete_key_if_empty(&self, key: &str) -> IconResult<bool>;
}

/// Drives the Windows `reg` tool against `HKCU`.
#[derive(Debug, Clone)]
pub struct RegCommandStore {
    hive: String,
}

impl RegCommandStore {
    pub fn current_user() -> Self {
        Self {
            hive: HKCU.to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!(r"{}\{key}", self.hive)
    }

    fn run(&self, command: &mut Command, key: &str) -> IconResult<Output> {
        if !self.is_available() {
            return Err(IconError::unavailable(
                REG_SUBSYSTEM,
                self.full_key(key),
                "the registry is only reachable on Windows hosts",
            ));
        }
        command.output().map_err(|err| {
            IconError::unavailable(
                REG_SUBSYSTEM,
                self.full_key(key),
                format!("failed to start reg: {err}"),
            )
        })
    }

    fn failure(&self, key: &str, action: &str, output: &Output) -> IconError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.to_ascii_lowercase().contains("access is denied") {
            return IconError::access_denied(
                self.full_key(key),
                ResourceKind::RegistryValue,
                stderr,
            );
        }
        IconError::Io {
            context: format!("failed to {action} {}", self.full_key(key)),
            source: std::io::Error::other(format!("status={} stderr='{stderr}'", output.status)),
        }
    }
}

impl KeyValueStore for RegCommandStore {
    fn is_available(&self) -> bool {
        cfg!(windows)
    }

    fn key_exists(&self, key: &str) -> IconResult<bool> {
        let output = self.run(Command::new("reg").arg("query").arg(self.full_key(key)), key)?;
        Ok(output.status.success())
    }

    fn default_value(&self, key: &str) -> IconResult<Option<RegistryValue>> {
        let output = self.run(
            Command::new("reg")
                .arg("query")
                .arg(self.full_key(key))
                .arg("/ve"),
            key,
        )?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_default_value(&String::from_utf8_lossy(&output.stdout)))
    }

    fn set_default_value(&self, key: &str, value: &RegistryValue) -> IconResult<()> {
        let output = self.run(
            Command::new("reg")
                .arg("add")
                .arg(self.full_key(key))
                .arg("/ve")
                .arg("/t")
                .arg(&value.value_type)
                .arg("/d")
                .arg(&value.data)
                .arg("/f"),
            key,
        )?;
        if output.status.success() {
            return Ok(());
        }
        Err(self.failure(key, "set default value of", &output))
    }

    fn delete_default_value(&self, key: &str) -> IconResult<()> {
        if self.default_value(key)?.is_none() {
            return Ok(());
        }
        let output = self.run(
            Command::new("reg")
                .arg("delete")
                .arg(self.full_key(key))
                .arg("/ve")
                .arg("/f"),
            key,
        )?;
        if output.status.success() || self.default_value(key)?.is_none() {
            return Ok(());
        }
        Err(self.failure(key, "delete default value of", &output))
    }

    fn delete_key_if_empty(&self, key: &str) -> IconResult<bool> {
        let full_key = self.full_key(key);
        let output = self.run(Command::new("reg").arg("query").arg(&full_key), key)?;
        if !output.status.success() {
            return Ok(false);
        }
        if !query_lists_nothing(&String::from_utf8_lossy(&output.stdout), &full_key) {
            return Ok(false);
        }

        let output = self.run(Command::new("reg").arg("delete").arg(&full_key).arg("/f"), key)?;
        if output.status.success() {
            return Ok(true);
        }
        Err(self.failure(key, "delete", &output))
    }
}

/// Parses `reg query <key> /ve` output, e.g. `    (Default)    REG_SZ    C:\a.ico,0`.
pub(crate) fn parse_default_value(stdout: &str) -> Option<RegistryValue> {
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("HKEY_") {
            continue;
        }
        let Some(type_start) = trimmed.find("REG_") else {
            continue;
        };
        let rest = &trimmed[type_start..];
        let (value_type, data) = match rest.split_once(char::is_whitespace) {
            Some((value_type, data)) => (value_type, data.trim()),
            None => (rest, ""),
        };
        if data == "(value not set)" {
            return None;
        }
        return Some(RegistryValue {
            data: data.to_string(),
            value_type: value_type.to_string(),
        });
    }
    None
}

/// True when a plain `reg query <key>` listed neither values nor subkeys.
pub(crate) fn query_lists_nothing(stdout: &str, full_key: &str) -> bool {
    let expanded = full_key.replacen(HKCU, "HKEY_CURRENT_USER", 1);
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(|line| {
            line.eq_ignore_ascii_case(&expanded) || line.eq_ignore_ascii_case(full_key)
        })
}

#[derive(Debug, Default)]
struct MemoryKey {
    default: Option<RegistryValue>,
}

/// In-process key store. Key names compare case-insensitively like the registry.
#[derive(Debug)]
pub struct MemoryKeyStore {
    keys: Mutex<BTreeMap<String, MemoryKey>>,
    deny_writes: AtomicBool,
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        let store = Self {
            keys: Mutex::new(BTreeMap::new()),
            deny_writes: AtomicBool::new(false),
        };
        store.create_key_path(CLASSES_ROOT);
        store
    }
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `AccessDenied`.
    pub fn set_deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    pub fn key_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MemoryKey>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_key_path(&self, key: &str) {
        let mut keys = self.lock();
        for prefix in key_prefixes(key) {
            keys.entry(prefix.to_ascii_lowercase()).or_default();
        }
    }

    fn check_writable(&self, key: &str) -> IconResult<()> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(IconError::access_denied(
                format!(r"{HKCU}\{key}"),
                ResourceKind::RegistryValue,
                "write refused",
            ));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryKeyStore {
    fn is_available(&self) -> bool {
        true
    }

    fn key_exists(&self, key: &str) -> IconResult<bool> {
        Ok(self.lock().contains_key(&key.to_ascii_lowercase()))
    }

    fn default_value(&self, key: &str) -> IconResult<Option<RegistryValue>> {
        Ok(self
            .lock()
            .get(&key.to_ascii_lowercase())
            .and_then(|entry| entry.default.clone()))
    }

    fn set_default_value(&self, key: &str, value: &RegistryValue) -> IconResult<()> {
        self.check_writable(key)?;
        self.create_key_path(key);
        if let Some(entry) = self.lock().get_mut(&key.to_ascii_lowercase()) {
            entry.default = Some(value.clone());
        }
        Ok(())
    }

    fn delete_default_value(&self, key: &str) -> IconResult<()> {
        if self.default_value(key)?.is_none() {
            return Ok(());
        }
        self.check_writable(key)?;
        if let Some(entry) = self.lock().get_mut(&key.to_ascii_lowercase()) {
            entry.default = None;
        }
        Ok(())
    }

    fn delete_key_if_empty(&self, key: &str) -> IconResult<bool> {
        if !self.key_exists(key)? {
            return Ok(false);
        }
        self.check_writable(key)?;
        let lowered = key.to_ascii_lowercase();
        let child_prefix = format!(r"{lowered}\");
        let mut keys = self.lock();
        let Some(entry) = keys.get(&lowered) else {
            return Ok(false);
        };
        if entry.default.is_some() || keys.keys().any(|name| name.starts_with(&child_prefix)) {
            return Ok(false);
        }
        keys.remove(&lowered);
        Ok(true)
    }
}

/// Stand-in for hosts without a registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableKeyStore;

impl UnavailableKeyStore {
    fn unavailable(key: &str) -> IconError {
        IconError::unavailable(
            REG_SUBSYSTEM,
            format!(r"{HKCU}\{key}"),
            "no registry is available on this host",
        )
    }
}

impl KeyValueStore for UnavailableKeyStore {
    fn is_available(&self) -> bool {
        false
    }

    fn key_exists(&self, key: &str) -> IconResult<bool> {
        Err(Self::unavailable(key))
    }

    fn default_value(&self, key: &str) -> IconResult<Option<RegistryValue>> {
        Err(Self::unavailable(key))
    }

    fn set_default_value(&self, key: &str, _value: &RegistryValue) -> IconResult<()> {
        Err(Self::unavailable(key))
    }

    fn delete_default_value(&self, key: &str) -> IconResult<()> {
        Err(Self::unavailable(key))
    }

    fn delete_key_if_empty(&self, key: &str) -> IconResult<bool> {
        Err(Self::unavailable(key))
    }
}

/// Default-icon values for file types (`Classes\.ext\DefaultIcon`) and
/// applications (`Classes\Applications\<exe>\DefaultIcon`).
pub struct RegistryIconAccessor {
    store: Arc<dyn KeyValueStore>,
}

impl RegistryIconAccessor {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key<'a>(&self, address: &'a ResourceAddress) -> IconResult<&'a str> {
        match address {
            ResourceAddress::RegistryKey { key } => Ok(key.as_str()),
            other => Err(mismatched_address(ResourceKind::RegistryValue, other)),
        }
    }

    fn ensure_available(&self, key: &str) -> IconResult<()> {
        if self.store.is_available() {
            return Ok(());
        }
        Err(IconError::unavailable(
            REG_SUBSYSTEM,
            format!(r"{HKCU}\{key}"),
            "the per-user class registry cannot be reached",
        ))
    }
}

impl ResourceAccessor for RegistryIconAccessor {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RegistryValue
    }

    fn resolve(&self, target: &Target) -> IconResult<ResourceAddress> {
        let key = match target {
            Target::FileType { extension } => {
                format!(r"{CLASSES_ROOT}\{extension}\DefaultIcon")
            }
            Target::Executable { path } => {
                let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                    return Err(IconError::invalid_target(
                        target,
                        "executable path has no file name",
                    ));
                };
                format!(r"{CLASSES_ROOT}\Applications\{file_name}\DefaultIcon")
            }
            other => {
                return Err(IconError::invalid_target(
                    other,
                    "target is not stored in the class registry",
                ));
            }
        };
        Ok(ResourceAddress::RegistryKey { key })
    }

    fn read(&self, address: &ResourceAddress) -> IconResult<Snapshot> {
        let key = self.key(address)?;
        self.ensure_available(key)?;

        let mut missing_keys = Vec::new();
        for prefix in key_prefixes(key).filter(|prefix| prefix.len() > CLASSES_ROOT.len()) {
            if !missing_keys.is_empty() || !self.store.key_exists(prefix)? {
                missing_keys.push(prefix.to_string());
            }
        }
        let value = if missing_keys.is_empty() {
            self.store.default_value(key)?
        } else {
            None
        };

        Ok(Snapshot::Registry(RegistrySnapshot {
            value,
            missing_keys,
        }))
    }

    fn write(&self, address: &ResourceAddress, icon: &IconRef) -> IconResult<()> {
        let key = self.key(address)?;
        self.ensure_available(key)?;
        self.store
            .set_default_value(key, &RegistryValue::sz(icon.location()))?;
        debug!(key, location = %icon.location(), "wrote default icon value");
        Ok(())
    }

    fn restore(&self, address: &ResourceAddress, prior: &Snapshot) -> IconResult<()> {
        let key = self.key(address)?;
        let Snapshot::Registry(prior) = prior else {
            return Err(mismatched_snapshot(ResourceKind::RegistryValue, prior));
        };
        self.ensure_available(key)?;

        match &prior.value {
            Some(value) => {
                if self.store.default_value(key)?.as_ref() != Some(value) {
                    self.store.set_default_value(key, value)?;
                }
            }
            None => {
                if self.store.key_exists(key)? {
                    self.store.delete_default_value(key)?;
                }
                for created in prior.missing_keys.iter().rev() {
                    if self.store.delete_key_if_empty(created)? {
                        debug!(key = %created, "removed key created by replacement");
                    }
                }
            }
        }
        Ok(())
    }
}

/// `a\b\c` yields `a`, `a\b`, `a\b\c`.
fn key_prefixes(key: &str) -> impl Iterator<Item = &str> {
    key.char_indices()
        .filter(|(_, ch)| *ch == '\\')
        .map(move |(index, _)| &key[..index])
        .chain(std::iter::once(key))
        .filter(|prefix| !prefix.is_empty())
}
