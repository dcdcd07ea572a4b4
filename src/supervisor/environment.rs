//! Environment resolution for the child process.
//!
//! The child receives its whole runtime context through environment
//! variables. Resolution merges, lowest to highest precedence:
//! 1. The inherited process environment
//! 2. Configured default placeholders
//! 3. Caller overrides (credentials, mode flags)
//!
//! Empty values never clobber an existing non-empty value unless the override
//! is forced. Sensitive values are stripped of characters that would be
//! interpreted by a shell, since some launch strategies go through one.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::SupervisorError;

// ─── Bundle ──────────────────────────────────────────────────────────────────

/// The complete variable set handed to the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentBundle {
    vars: BTreeMap<String, String>,
}

impl EnvironmentBundle {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Return a copy with `extra` layered on top, following the same
    /// empty-value rule as caller overrides.
    pub fn layered(&self, extra: &BTreeMap<String, String>) -> Self {
        let mut next = self.clone();
        for (key, value) in extra {
            next.apply(key, value, false);
        }
        next
    }

    /// The value of `PATH` (case-insensitive lookup on Windows).
    pub fn path_var(&self) -> Option<&str> {
        self.path_key().and_then(|k| self.get(k))
    }

    fn path_key(&self) -> Option<&str> {
        if cfg!(windows) {
            self.vars
                .keys()
                .find(|k| k.eq_ignore_ascii_case("PATH"))
                .map(String::as_str)
        } else {
            self.vars.contains_key("PATH").then_some("PATH")
        }
    }

    /// Apply one value. Returns `true` if the bundle changed.
    fn apply(&mut self, key: &str, value: &str, forced: bool) -> bool {
        if value.is_empty() && !forced {
            return false;
        }
        self.vars.insert(key.to_string(), value.to_string());
        true
    }
}

// ─── Overrides ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct EnvOverride {
    value: String,
    forced: bool,
}

/// Caller-supplied variables (credential material, mode flags).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    entries: BTreeMap<String, EnvOverride>,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value. Empty values are ignored at resolution time.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value, false);
        self
    }

    /// Set a value that is applied even when empty.
    pub fn force(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value, true);
        self
    }

    fn insert(&mut self, key: impl Into<String>, value: impl Into<String>, forced: bool) {
        self.entries.insert(
            key.into(),
            EnvOverride {
                value: value.into(),
                forced,
            },
        );
    }

    /// Layer `newer` on top of `self`; keys present in both take `newer`'s entry.
    pub fn merged_with(&self, newer: &EnvOverrides) -> EnvOverrides {
        let mut merged = self.clone();
        for (key, entry) in &newer.entries {
            merged.entries.insert(key.clone(), entry.clone());
        }
        merged
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl From<HashMap<String, String>> for EnvOverrides {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter()
            .fold(EnvOverrides::new(), |acc, (k, v)| acc.set(k, v))
    }
}

impl From<BTreeMap<String, String>> for EnvOverrides {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter()
            .fold(EnvOverrides::new(), |acc, (k, v)| acc.set(k, v))
    }
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// A variable that must be present (and non-empty) in the final bundle.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EnvRequirement {
    pub key: String,
    /// Only required when this condition holds.
    #[serde(default)]
    pub when: Option<EnvCondition>,
}

/// `key` equals `equals` (ASCII case-insensitive).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EnvCondition {
    pub key: String,
    pub equals: String,
}

/// Rules applied while resolving the bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentPolicy {
    /// Placeholders layered over the inherited environment.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// Substrings (case-insensitive) marking a variable as sensitive.
    #[serde(default = "default_sensitive_keys")]
    pub sensitive_keys: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<EnvRequirement>,
    /// Directories appended to `PATH` when missing.
    #[serde(default)]
    pub extra_path_dirs: Vec<String>,
    /// Also append well-known install locations that exist on this machine.
    #[serde(default = "default_true")]
    pub augment_path: bool,
}

fn default_sensitive_keys() -> Vec<String> {
    vec!["TOKEN".into(), "SECRET".into(), "PASSWORD".into()]
}

fn default_true() -> bool {
    true
}

impl Default for EnvironmentPolicy {
    fn default() -> Self {
        Self {
            defaults: BTreeMap::new(),
            sensitive_keys: default_sensitive_keys(),
            requirements: Vec::new(),
            extra_path_dirs: Vec::new(),
            augment_path: true,
        }
    }
}

impl EnvironmentPolicy {
    /// Whether `key` holds sensitive material.
    pub fn is_sensitive(&self, key: &str) -> bool {
        let upper = key.to_ascii_uppercase();
        self.sensitive_keys
            .iter()
            .any(|marker| upper.contains(&marker.to_ascii_uppercase()))
    }

    /// Clean every sensitive value in `vars` in place.
    pub fn sanitize(&self, vars: &mut BTreeMap<String, String>) {
        for (key, value) in vars.iter_mut() {
            if !self.is_sensitive(key) {
                continue;
            }
            let clean = sanitize_value(value);
            if clean.len() != value.len() {
                tracing::warn!(
                    key = %key,
                    removed = value.chars().count() - clean.chars().count(),
                    "stripped unsafe characters from sensitive value"
                );
                *value = clean;
            }
        }
    }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Build the bundle from an explicit base environment.
pub fn resolve<I, K, V>(
    base: I,
    overrides: &EnvOverrides,
    policy: &EnvironmentPolicy,
) -> Result<EnvironmentBundle, SupervisorError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut bundle = EnvironmentBundle::default();

    for (key, value) in base {
        bundle.vars.insert(key.into(), value.into());
    }

    for (key, value) in &policy.defaults {
        bundle.apply(key, value, false);
    }

    for (key, entry) in &overrides.entries {
        if !bundle.apply(key, &entry.value, entry.forced) {
            tracing::debug!(key = %key, "dropping empty override");
        }
    }

    sanitize_sensitive(&mut bundle, policy);
    augment_path(&mut bundle, policy);
    validate(&bundle, &policy.requirements)?;

    Ok(bundle)
}

/// Build the bundle from this process's environment.
///
/// Variables whose name or value is not valid UTF-8 are skipped.
pub fn resolve_from_process(
    overrides: &EnvOverrides,
    policy: &EnvironmentPolicy,
) -> Result<EnvironmentBundle, SupervisorError> {
    let inherited = std::env::vars_os().filter_map(|(k, v): (OsString, OsString)| {
        Some((k.into_string().ok()?, v.into_string().ok()?))
    });
    resolve(inherited, overrides, policy)
}

/// Strip control characters, shell metacharacters, whitespace, and quotes.
pub fn sanitize_value(raw: &str) -> String {
    const STRIPPED: &[char] = &[
        ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '!', '~',
        '#', '\\', '\'', '"', '%', '^',
    ];
    raw.chars()
        .filter(|c| !c.is_control() && !c.is_whitespace() && !STRIPPED.contains(c))
        .collect()
}

fn sanitize_sensitive(bundle: &mut EnvironmentBundle, policy: &EnvironmentPolicy) {
    policy.sanitize(&mut bundle.vars);
}

fn validate(
    bundle: &EnvironmentBundle,
    requirements: &[EnvRequirement],
) -> Result<(), SupervisorError> {
    let missing: Vec<&str> = requirements
        .iter()
        .filter(|req| match &req.when {
            Some(cond) => bundle
                .get(&cond.key)
                .is_some_and(|v| v.eq_ignore_ascii_case(&cond.equals)),
            None => true,
        })
        .filter(|req| bundle.get(&req.key).map_or(true, str::is_empty))
        .map(|req| req.key.as_str())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(SupervisorError::config(format!(
            "missing required environment variable(s): {}",
            missing.join(", ")
        )))
    }
}

// ─── PATH handling ───────────────────────────────────────────────────────────

/// Well-known install locations that packaged apps often miss.
fn platform_path_candidates() -> Vec<PathBuf> {
    let mut dirs_out = Vec::new();
    if cfg!(target_os = "windows") {
        if let Some(roaming) = dirs::data_dir() {
            dirs_out.push(roaming.join("npm"));
        }
        dirs_out.push(PathBuf::from(r"C:\Program Files\nodejs"));
    } else {
        if cfg!(target_os = "macos") {
            dirs_out.push(PathBuf::from("/opt/homebrew/bin"));
        }
        dirs_out.push(PathBuf::from("/usr/local/bin"));
        dirs_out.push(PathBuf::from("/usr/bin"));
        dirs_out.push(PathBuf::from("/bin"));
        if let Some(home) = dirs::home_dir() {
            dirs_out.push(home.join(".local/bin"));
        }
    }
    dirs_out
}

fn augment_path(bundle: &mut EnvironmentBundle, policy: &EnvironmentPolicy) {
    let mut extra: Vec<PathBuf> = policy.extra_path_dirs.iter().map(PathBuf::from).collect();
    if policy.augment_path {
        extra.extend(platform_path_candidates().into_iter().filter(|p| p.is_dir()));
    }
    if extra.is_empty() {
        return;
    }

    let key = bundle.path_key().unwrap_or("PATH").to_string();
    let current = bundle.get(&key).unwrap_or_default().to_string();
    let mut entries: Vec<PathBuf> = std::env::split_paths(&current).collect();
    let before = entries.len();
    for dir in extra {
        if !entries.contains(&dir) {
            entries.push(dir);
        }
    }
    if entries.len() == before {
        return;
    }

    match std::env::join_paths(&entries) {
        Ok(joined) => {
            let joined = joined.to_string_lossy().into_owned();
            tracing::debug!(added = entries.len() - before, "augmented PATH");
            bundle.vars.insert(key, joined);
        }
        Err(e) => tracing::warn!(error = %e, "could not join PATH entries"),
    }
}

/// Locate `command` using the bundle's `PATH` rather than the parent's.
///
/// Commands containing a path separator are checked as-is.
pub fn resolve_executable(command: &str, bundle: &EnvironmentBundle) -> Option<PathBuf> {
    let direct = Path::new(command);
    if direct.components().count() > 1 || direct.is_absolute() {
        return is_executable(direct).then(|| direct.to_path_buf());
    }

    let path = bundle.path_var()?;
    let extensions = executable_extensions(bundle);

    for dir in std::env::split_paths(path) {
        for ext in &extensions {
            let candidate = dir.join(format!("{command}{ext}"));
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

fn executable_extensions(bundle: &EnvironmentBundle) -> Vec<String> {
    if cfg!(windows) {
        let mut exts = vec![String::new()];
        let pathext = bundle
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("PATHEXT"))
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| ".COM;.EXE;.BAT;.CMD".to_string());
        exts.extend(pathext.split(';').filter(|e| !e.is_empty()).map(str::to_string));
        exts
    } else {
        vec![String::new()]
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
