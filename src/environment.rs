//! Attempt Environment
//!
//! Environment variable overrides the updater (or the service it hands off
//! to) reads for the duration of one update attempt. Overrides are applied
//! through a scoped [`EnvGuard`] and the previous values are put back exactly
//! when the guard drops.

use crate::paths::env;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Backing store for environment variables
pub trait EnvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// The real process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvStore for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    fn remove(&self, key: &str) {
        std::env::remove_var(key);
    }
}

/// In-memory environment, isolated from the process
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: Mutex<HashMap<String, String>>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Mutex::new(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        lock(&self.vars).clone()
    }
}

impl EnvStore for MemoryEnv {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.vars).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        lock(&self.vars).insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        lock(&self.vars).remove(key);
    }
}

/// What one attempt overrides
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    /// Root directory the updater searches for updates
    pub update_root: Option<PathBuf>,

    /// Installation directory the updater applies to
    pub app_dir: Option<PathBuf>,

    pub no_hash_dir: bool,
    pub background: bool,
    pub no_service_fallback: bool,
    pub no_replace_fallback: bool,

    /// Library directory exported through LD_LIBRARY_PATH when it differs
    pub library_dir: Option<PathBuf>,
}

impl EnvOverrides {
    /// Key/value pairs to apply, given the current environment
    fn assignments(&self, store: &dyn EnvStore) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();

        if let Some(ref root) = self.update_root {
            out.push((env::UPDATE_ROOT_OVERRIDE, root.display().to_string()));
        }
        if let Some(ref app_dir) = self.app_dir {
            out.push((env::APPDIR_OVERRIDE, app_dir.display().to_string()));
        }

        let flags = [
            (env::NO_HASH_DIR, self.no_hash_dir),
            (env::UPDATE_BACKGROUND, self.background),
            (env::NO_SERVICE_FALLBACK, self.no_service_fallback),
            (env::NO_REPLACE_FALLBACK, self.no_replace_fallback),
        ];
        for (key, enabled) in flags {
            if enabled {
                out.push((key, "1".to_string()));
            }
        }

        if let Some(ref lib_dir) = self.library_dir {
            let lib_dir = lib_dir.display().to_string();
            if store.get(env::LD_LIBRARY_PATH).as_deref() != Some(lib_dir.as_str()) {
                out.push((env::LD_LIBRARY_PATH, lib_dir));
            }
        }

        out
    }
}

/// Prior values of every key touched by `set`
type Saved = Vec<(&'static str, Option<String>)>;

/// Set/restore bookkeeping for one in-flight attempt
pub struct AttemptEnvironment {
    store: Arc<dyn EnvStore>,
    overrides: EnvOverrides,
    saved: Mutex<Option<Saved>>,
    applied: Mutex<BTreeMap<String, Option<String>>>,
}

impl AttemptEnvironment {
    pub fn new(store: Arc<dyn EnvStore>, overrides: EnvOverrides) -> Self {
        Self {
            store,
            overrides,
            saved: Mutex::new(None),
            applied: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_set(&self) -> bool {
        lock(&self.saved).is_some()
    }

    /// Apply the overrides. Returns false (and changes nothing) when they
    /// are already applied.
    pub fn set(&self) -> bool {
        let mut saved = lock(&self.saved);
        if saved.is_some() {
            tracing::debug!("Attempt environment already set, ignoring");
            return false;
        }

        let mut prior = Vec::new();
        let mut applied = lock(&self.applied);
        applied.clear();

        for (key, value) in self.overrides.assignments(self.store.as_ref()) {
            prior.push((key, self.store.get(key)));
            tracing::debug!("Setting {}={}", key, value);
            self.store.set(key, &value);
            applied.insert(key.to_string(), Some(value));
        }

        *saved = Some(prior);
        true
    }

    /// Put back every value `set` replaced. Returns false when not set.
    pub fn restore(&self) -> bool {
        let Some(prior) = lock(&self.saved).take() else {
            return false;
        };

        // Reverse order so a key touched twice ends at its oldest value
        for (key, value) in prior.into_iter().rev() {
            match value {
                Some(ref v) => self.store.set(key, v),
                None => self.store.remove(key),
            }
        }
        lock(&self.applied).clear();
        tracing::debug!("Attempt environment restored");
        true
    }

    /// Apply the overrides until the returned guard drops. A guard taken
    /// while the environment is already set leaves restoring to its owner.
    pub fn acquire(&self) -> EnvGuard<'_> {
        let owner = self.set();
        EnvGuard { env: self, owner }
    }

    /// Variables currently applied, in the shape a child invocation takes
    pub fn applied(&self) -> BTreeMap<String, Option<String>> {
        lock(&self.applied).clone()
    }
}

impl std::fmt::Debug for AttemptEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptEnvironment")
            .field("overrides", &self.overrides)
            .field("set", &self.is_set())
            .finish()
    }
}

/// Restores the attempt environment on drop
#[must_use = "the environment is restored as soon as the guard drops"]
pub struct EnvGuard<'a> {
    env: &'a AttemptEnvironment,
    owner: bool,
}

impl EnvGuard<'_> {
    pub fn applied(&self) -> BTreeMap<String, Option<String>> {
        self.env.applied()
    }
}

impl Drop for EnvGuard<'_> {
    fn drop(&mut self) {
        if self.owner {
            self.env.restore();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
