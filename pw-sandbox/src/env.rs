//! Environment variables: the two-tier `global` + `selected` model.
//!
//! Scripts and callers see two independent ordered lists.  Lookups check the
//! *selected* tier first and fall back to *global*; writes only ever touch
//! *selected*.  Keys are not unique within a list — the first match wins.

use serde::{Deserialize, Serialize};

// ── Data model ────────────────────────────────────────────────────────────────

/// A single `key = value` environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
}

impl Variable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// A named collection of variables, as persisted by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// The variable pair a sandbox run consumes and produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envs {
    #[serde(default)]
    pub global: Vec<Variable>,
    #[serde(default)]
    pub selected: Vec<Variable>,
}

impl Envs {
    pub fn new(global: Vec<Variable>, selected: Vec<Variable>) -> Self {
        Self { global, selected }
    }

    /// Build from the global environment and the currently selected one.
    pub fn from_environments(global: &Environment, selected: &Environment) -> Self {
        Self::new(global.variables.clone(), selected.variables.clone())
    }

    /// `selected` followed by `global`: the order used for template expansion.
    pub fn combined(&self) -> Vec<Variable> {
        self.selected.iter().chain(&self.global).cloned().collect()
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

/// Look up `key`, checking `selected` before `global`.
pub fn get_env<'a>(key: &str, envs: &'a Envs) -> Option<&'a Variable> {
    envs.selected
        .iter()
        .find(|v| v.key == key)
        .or_else(|| envs.global.iter().find(|v| v.key == key))
}

/// Return a copy of `envs` with `key` set in the `selected` tier.
///
/// An existing entry keeps its position; a new key is appended.
pub fn set_env(key: &str, value: &str, envs: &Envs) -> Envs {
    let mut next = envs.clone();
    match next.selected.iter_mut().find(|v| v.key == key) {
        Some(existing) => existing.value = value.to_owned(),
        None => next.selected.push(Variable::new(key, value)),
    }
    next
}

// ── Tests ─────────────────────────────────────────────────────────────────────
