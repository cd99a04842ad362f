//! Pre-request script sandbox.
//!
//! Runs an untrusted Lua script against a pair of environment-variable lists
//! (`global` and `selected`) and returns the updated pair, or a description of
//! why the script failed.  Scripts reach the host only through `pw.env.*`;
//! see [`sandbox`] for the API and [`template`] for `<<name>>` expansion.
//!
//! # Quick start
//!
//! ```rust
//! use pw_sandbox::{Envs, Sandbox, SandboxConfig};
//!
//! let sandbox = Sandbox::new(SandboxConfig::default());
//! let envs = sandbox
//!     .run(r#"pw.env.set("token", "abc123")"#, &Envs::default())
//!     .unwrap();
//! assert_eq!(envs.selected[0].value, "abc123");
//! ```

pub mod cli;
pub mod config;
pub mod env;
pub mod sandbox;
pub mod template;

// Re-exports for convenience.
pub use config::SandboxConfig;
pub use env::{get_env, set_env, Environment, Envs, Variable};
pub use sandbox::{execute, Sandbox, SandboxError};
pub use template::{expand, expand_within, ExpandError, LoopError};
