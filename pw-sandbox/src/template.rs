//! `<<name>>` template expansion.
//!
//! | Sequence   | Meaning                                                    |
//! |------------|------------------------------------------------------------|
//! | `<<name>>` | Value of the first variable whose key is `name`            |
//!
//! Expansion is recursive: a substituted value may itself contain
//! placeholders, so the text is rescanned until nothing more resolves.  The
//! number of passes is capped at [`MAX_EXPAND_PASSES`]; text that is still
//! resolving after the last pass is reported as a [`LoopError`].
//!
//! [`expand_within`] additionally caps the size of the expanded text.
//!
//! Placeholders naming an unknown variable are left in place verbatim so that
//! callers can report them (see [`placeholders`]).

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::env::Variable;

/// Maximum number of substitution passes over a text.
pub const MAX_EXPAND_PASSES: usize = 10;

/// Expansion was still making progress after [`MAX_EXPAND_PASSES`] passes,
/// which indicates a circular reference such as `A = <<B>>`, `B = <<A>>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("suspected loop while expanding variables ({passes} passes)")]
pub struct LoopError {
    pub passes: usize,
}

/// Why [`expand_within`] gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error("expanded text exceeds {limit} bytes")]
    TooLong { limit: usize },
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<<([^>]*)>>").expect("placeholder regex is valid"))
}

/// Expand every `<<name>>` in `text` against `variables`.
///
/// Empty `text` or an empty variable list is returned unchanged.  The output
/// size is not bounded; use [`expand_within`] for variables that come from
/// untrusted code.
pub fn expand(text: &str, variables: &[Variable]) -> Result<String, LoopError> {
    match expand_within(text, variables, usize::MAX) {
        Ok(expanded) => Ok(expanded),
        Err(ExpandError::Loop(e)) => Err(e),
        // No string is longer than usize::MAX bytes.
        Err(ExpandError::TooLong { .. }) => unreachable!("expansion exceeded usize::MAX bytes"),
    }
}

/// Like [`expand`], but stops as soon as a pass produces more than `max_len`
/// bytes.
///
/// A value that repeats its own placeholder (`A = <<A>><<A>>`) grows
/// geometrically on every pass; the bound stops that before the host runs
/// out of memory.
pub fn expand_within(text: &str, variables: &[Variable], max_len: usize) -> Result<String, ExpandError> {
    if text.is_empty() || variables.is_empty() {
        return Ok(text.to_owned());
    }

    let re = placeholder_re();
    let mut result = text.to_owned();
    let mut passes = 0;

    while re.is_match(&result) {
        if passes == MAX_EXPAND_PASSES {
            let resolvable = placeholders(&result)
                .into_iter()
                .any(|name| variables.iter().any(|v| v.key == name));
            if resolvable {
                return Err(LoopError { passes }.into());
            }
            break;
        }

        let mut next = String::with_capacity(result.len());
        let mut resolved = 0usize;
        let mut last = 0;
        for caps in re.captures_iter(&result) {
            let Some(whole) = caps.get(0) else { continue };
            next.push_str(&result[last..whole.start()]);
            match variables.iter().find(|v| v.key == caps[1]) {
                Some(var) => {
                    resolved += 1;
                    next.push_str(&var.value);
                }
                None => next.push_str(whole.as_str()),
            }
            last = whole.end();
            if next.len() > max_len {
                return Err(ExpandError::TooLong { limit: max_len });
            }
        }
        next.push_str(&result[last..]);
        if next.len() > max_len {
            return Err(ExpandError::TooLong { limit: max_len });
        }
        passes += 1;

        // Only unknown names left: the text is stable.
        if resolved == 0 {
            break;
        }
        result = next;
    }

    Ok(result)
}

/// Like [`expand`], but falls back to the unexpanded `text` on a loop.
pub fn expand_or_raw(text: &str, variables: &[Variable]) -> String {
    expand(text, variables).unwrap_or_else(|_| text.to_owned())
}

/// Names of all placeholders in `text`, in order of appearance.
pub fn placeholders(text: &str) -> Vec<&str> {
    placeholder_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
