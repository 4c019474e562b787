//! Per-principal shell profiles: where a shell starts and what it inherits.

use std::collections::BTreeMap;
use std::path::PathBuf;

use dashmap::DashMap;
use protocol::Principal;
use serde::{Deserialize, Serialize};

/// Variables every shell gets regardless of profile.
pub const TERMINAL_ENV: [(&str, &str); 2] = [("TERM", "xterm-256color"), ("COLORTERM", "truecolor")];

/// Working directory and environment for a principal's shells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellProfile {
    /// Directory new shells start in.
    pub working_directory: PathBuf,
    /// Environment new shells inherit, before terminal variables are applied.
    pub environment: BTreeMap<String, String>,
}

impl ShellProfile {
    /// Profile built from this process: its directory and environment.
    pub fn from_current_process() -> Self {
        Self {
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            environment: std::env::vars().collect(),
        }
    }

    /// Overrides the working directory.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// The environment a shell should actually receive.
    pub fn shell_environment(&self) -> Vec<(String, String)> {
        let mut env = self.environment.clone();
        for (key, value) in TERMINAL_ENV {
            env.insert(key.to_string(), value.to_string());
        }
        env.into_iter().collect()
    }
}

/// Profiles keyed by principal, created on first use.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: DashMap<Principal, ShellProfile>,
    default_working_dir: Option<PathBuf>,
}

impl ProfileStore {
    /// Creates a store. New profiles start in `default_working_dir` when set,
    /// otherwise in this process's directory.
    pub fn new(default_working_dir: Option<PathBuf>) -> Self {
        Self {
            profiles: DashMap::new(),
            default_working_dir,
        }
    }

    /// Returns the principal's profile, creating it if needed.
    pub fn profile_for(&self, principal: Principal) -> ShellProfile {
        self.profiles
            .entry(principal)
            .or_insert_with(|| {
                let profile = ShellProfile::from_current_process();
                match &self.default_working_dir {
                    Some(dir) => profile.with_working_directory(dir),
                    None => profile,
                }
            })
            .clone()
    }

    /// Replaces the principal's profile.
    pub fn set(&self, principal: Principal, profile: ShellProfile) {
        self.profiles.insert(principal, profile);
    }

    /// Forgets the principal's profile.
    pub fn reset(&self, principal: Principal) -> bool {
        self.profiles.remove(&principal).is_some()
    }

    /// Number of stored profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Returns true if no profiles are stored.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
