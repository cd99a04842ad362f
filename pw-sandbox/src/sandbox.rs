//! Pre-request script sandbox built on Lua 5.4 via the `mlua` crate.
//!
//! Every run gets a fresh Lua state with only the `string`, `table`, `math`,
//! `utf8` and `coroutine` libraries loaded.  The script sees the host through a
//! single global table:
//!
//! | Lua function              | Effect                                          |
//! |---------------------------|-------------------------------------------------|
//! | `pw.env.get(key)`         | Raw value of `key` → string or nil              |
//! | `pw.env.getResolve(key)`  | Value of `key` with `<<name>>` expanded → string or nil |
//! | `pw.env.set(key, value)`  | Set `key` in the selected environment           |
//! | `pw.env.resolve(text)`    | Expand `<<name>>` placeholders in `text`        |
//!
//! `set` writes to a working copy of the caller's [`Envs`]; later calls in the
//! same script observe it.  A script that finishes returns the working copy, a
//! script that raises returns only the error.  The Lua state is dropped at the
//! end of every run, whichever way it ends.
//!
//! Runs are bounded by [`SandboxConfig`]: an instruction budget and a
//! wall-clock budget, both enforced from a VM hook, plus a heap limit.
//!
//! Work done in native code is outside the hook's reach, so it is bounded
//! separately.  `resolve` and `getResolve` give up (returning the raw text)
//! once the expansion outgrows [`MAX_EXPANDED_LEN`] or the heap limit,
//! whichever is smaller.  `string.find`, `string.match`, `string.gmatch` and
//! `string.gsub` refuse patterns whose worst-case backtracking over the
//! subject would exceed [`PATTERN_STEP_BUDGET`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use mlua::prelude::*;
use mlua::{DebugEvent, HookTriggers, LuaOptions, StdLib, VmState};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use crate::config::SandboxConfig;
use crate::env::{get_env, set_env, Envs, Variable};
use crate::template::expand_within;

/// The instruction hook fires once per this many VM instructions.
pub const INSTRUCTION_HOOK_INTERVAL: u32 = 1000;

/// Chunk name reported in Lua error messages.
const CHUNK_NAME: &str = "pre-request";

/// Largest text `pw.env.resolve` / `pw.env.getResolve` will build.
pub const MAX_EXPANDED_LEN: usize = 1024 * 1024;

/// Worst-case matcher steps a single pattern call may take, estimated as
/// `subject_len ^ depth` where `depth` counts the pattern's variable-length
/// items (plus one for every start position when unanchored).
pub const PATTERN_STEP_BUDGET: u128 = 100_000_000;

/// `string` functions that run the backtracking pattern matcher.
const PATTERN_FUNCTIONS: [&str; 4] = ["find", "match", "gmatch", "gsub"];

/// Base-library globals that reach outside the sandbox.
const REMOVED_GLOBALS: [&str; 5] = ["dofile", "loadfile", "load", "require", "collectgarbage"];

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a sandboxed run produced no [`Envs`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    /// The interpreter could not be created or prepared.
    #[error("interpreter initialization failed: {0}")]
    Initialization(String),
    /// The script raised an error that it did not catch.
    #[error("{0}")]
    Evaluation(String),
}

// ── Sandbox ───────────────────────────────────────────────────────────────────

/// Factory for isolated script runs.
///
/// A `Sandbox` holds only its limits; each [`Sandbox::run`] builds and tears
/// down its own Lua state, so one `Sandbox` can serve concurrent callers.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `script` against `envs`, returning the updated envs or a
    /// description of what went wrong.
    ///
    /// The run happens on tokio's blocking pool so a slow script does not
    /// hold up the caller's worker thread.
    pub async fn execute(&self, script: &str, envs: &Envs) -> Result<Envs, String> {
        let sandbox = self.clone();
        let script = script.to_owned();
        let envs = envs.clone();
        tokio::task::spawn_blocking(move || sandbox.run(&script, &envs))
            .await
            .map_err(|e| format!("script task failed: {e}"))?
            .map_err(|e| e.to_string())
    }

    /// Synchronous form of [`Sandbox::execute`] with a typed error.
    pub fn run(&self, script: &str, envs: &Envs) -> Result<Envs, SandboxError> {
        debug!(script_len = script.len(), "running pre-request script");

        let lua = self.create_state()?;
        let session = Rc::new(RefCell::new(envs.clone()));
        register_api(&lua, envs, Rc::clone(&session), self.expansion_limit()).map_err(init_error)?;
        self.install_budget(&lua);

        let outcome = lua.load(script).set_name(CHUNK_NAME).exec();
        // Closes the interpreter and releases every bridge function with it.
        drop(lua);

        match outcome {
            Ok(()) => {
                let result = session.borrow().clone();
                debug!(selected = result.selected.len(), "pre-request script finished");
                Ok(result)
            }
            Err(e) => {
                let message = describe(&e);
                warn!("pre-request script failed: {message}");
                Err(SandboxError::Evaluation(message))
            }
        }
    }

    /// Check that an interpreter can be brought up with this configuration.
    pub fn probe(&self) -> Result<String, SandboxError> {
        let lua = self.create_state()?;
        let version: String = lua.globals().get("_VERSION").map_err(init_error)?;
        Ok(version)
    }

    fn create_state(&self) -> Result<Lua, SandboxError> {
        let libs = StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(init_error)?;

        restrict_globals(&lua).map_err(init_error)?;
        guard_patterns(&lua).map_err(init_error)?;

        if let Some(bytes) = self.config.memory_limit {
            lua.set_memory_limit(bytes).map_err(init_error)?;
        }

        Ok(lua)
    }

    /// Byte bound for `resolve`/`getResolve` output.
    fn expansion_limit(&self) -> usize {
        self.config.memory_limit.map_or(MAX_EXPANDED_LEN, |bytes| bytes.min(MAX_EXPANDED_LEN))
    }

    fn install_budget(&self, lua: &Lua) {
        let limit = self.config.instruction_limit;
        let timeout = self.config.timeout;
        if limit.is_none() && timeout.is_none() {
            return;
        }

        let started = Instant::now();
        let executed = Cell::new(0u64);
        // Once set, every line event re-raises, so `pcall` cannot keep the
        // script alive past its budget.
        let exhausted: RefCell<Option<String>> = RefCell::new(None);

        lua.set_hook(
            HookTriggers::new()
                .every_line()
                .every_nth_instruction(INSTRUCTION_HOOK_INTERVAL),
            move |_, debug| {
                if let Some(msg) = exhausted.borrow().as_ref() {
                    return Err(LuaError::RuntimeError(msg.clone()));
                }
                if !matches!(debug.event(), DebugEvent::Count) {
                    return Ok(VmState::Continue);
                }

                let count = executed.get() + u64::from(INSTRUCTION_HOOK_INTERVAL);
                executed.set(count);

                let over = match (limit, timeout) {
                    (Some(max), _) if count > max => {
                        Some(format!("script exceeded instruction limit ({max})"))
                    }
                    (_, Some(budget)) if started.elapsed() > budget => {
                        Some(format!("script exceeded time limit ({} ms)", budget.as_millis()))
                    }
                    _ => None,
                };
                match over {
                    Some(msg) => {
                        *exhausted.borrow_mut() = Some(msg.clone());
                        Err(LuaError::RuntimeError(msg))
                    }
                    None => Ok(VmState::Continue),
                }
            },
        );
    }
}

// ── Process-wide engine ───────────────────────────────────────────────────────

static ENGINE: OnceCell<Sandbox> = OnceCell::const_new();

/// The shared [`Sandbox`], configured from `PW_SANDBOX_*` on first use.
pub async fn engine() -> Result<&'static Sandbox, SandboxError> {
    ENGINE
        .get_or_try_init(|| async {
            let sandbox = Sandbox::new(SandboxConfig::from_env());
            let version = sandbox.probe()?;
            debug!(%version, "script engine ready");
            Ok::<_, SandboxError>(sandbox)
        })
        .await
}

/// Run `script` against `envs` on the shared engine.
pub async fn execute(script: &str, envs: &Envs) -> Result<Envs, String> {
    let sandbox = engine().await.map_err(|e| e.to_string())?;
    sandbox.execute(script, envs).await
}

// ── Lua state setup ───────────────────────────────────────────────────────────

fn restrict_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(name, LuaValue::Nil)?;
    }

    // print(...) goes to the host log rather than stdout.
    globals.set(
        "print",
        lua.create_function(|_, args: LuaMultiValue| {
            let line: Vec<String> = args.iter().map(display_value).collect();
            info!(target: "pw_sandbox::script", "{}", line.join("\t"));
            Ok(())
        })?,
    )?;

    Ok(())
}

/// Wrap the pattern-matching `string` functions with a cost check.
///
/// The string metatable indexes this same table, so `s:gsub(...)` is covered
/// too.
fn guard_patterns(lua: &Lua) -> LuaResult<()> {
    let string: LuaTable = lua.globals().get("string")?;
    for name in PATTERN_FUNCTIONS {
        let inner: LuaFunction = string.get(name)?;
        // gmatch treats a leading `^` as a literal.
        let anchors = name != "gmatch";
        let guarded = lua.create_function(move |_, args: LuaMultiValue| {
            check_pattern_cost(name, &args, anchors)?;
            inner.call::<LuaMultiValue>(args)
        })?;
        string.set(name, guarded)?;
    }
    Ok(())
}

fn check_pattern_cost(name: &str, args: &LuaMultiValue, anchors: bool) -> LuaResult<()> {
    // string.find(s, pattern, init, plain): plain search does not backtrack.
    let plain = args.get(3).is_some_and(|v| !matches!(v, LuaValue::Nil | LuaValue::Boolean(false)));
    if name == "find" && plain {
        return Ok(());
    }
    let subject_len = match args.front() {
        Some(LuaValue::String(s)) => s.as_bytes().len(),
        // Numbers are coerced by the matcher; their text is short.
        _ => 32,
    };
    let Some(LuaValue::String(pattern)) = args.get(1) else {
        return Ok(());
    };
    let cost = pattern_cost(subject_len, &pattern.as_bytes(), anchors);
    if cost > PATTERN_STEP_BUDGET {
        return Err(LuaError::RuntimeError(format!(
            "string.{name}: pattern too complex for a {subject_len}-byte subject"
        )));
    }
    Ok(())
}

/// Worst-case matcher steps for `pattern` over a subject of `subject_len`
/// bytes.
fn pattern_cost(subject_len: usize, pattern: &[u8], anchors: bool) -> u128 {
    let (anchored, body) = match pattern.split_first() {
        Some((b'^', rest)) if anchors => (true, rest),
        _ => (false, pattern),
    };
    let depth = variable_items(body) + u32::from(!anchored);
    (subject_len.max(1) as u128).saturating_pow(depth)
}

/// Number of items in a Lua pattern that can match a variable number of
/// characters: classes followed by `*`, `+` or `-`, and `%b` balances.
fn variable_items(pattern: &[u8]) -> u32 {
    let mut count = 0;
    let mut i = 0;
    while i < pattern.len() {
        match pattern[i] {
            b'(' | b')' => {
                i += 1;
                continue;
            }
            b'%' if pattern.get(i + 1) == Some(&b'b') => {
                count += 1;
                i += 4;
                continue;
            }
            b'%' if pattern.get(i + 1) == Some(&b'f') => {
                i = set_end(pattern, i + 2);
                continue;
            }
            b'%' => i += 2,
            b'[' => i = set_end(pattern, i),
            _ => i += 1,
        }
        match pattern.get(i) {
            Some(b'*' | b'+' | b'-') => {
                count += 1;
                i += 1;
            }
            Some(b'?') => i += 1,
            _ => {}
        }
    }
    count
}

/// Index just past the `]` closing the set that opens at `open`.
fn set_end(pattern: &[u8], open: usize) -> usize {
    let mut i = open + 1;
    if pattern.get(i) == Some(&b'^') {
        i += 1;
    }
    // The first character is always part of the set, even `]`.
    loop {
        match pattern.get(i) {
            None => return pattern.len(),
            Some(b'%') => i += 2,
            Some(_) => i += 1,
        }
        if pattern.get(i) == Some(&b']') {
            return i + 1;
        }
    }
}

/// Expand `text`, or return it unchanged on a loop or when the result would
/// exceed `max_len` bytes.
fn expand_or_raw_within(text: &str, variables: &[Variable], max_len: usize) -> String {
    match expand_within(text, variables, max_len) {
        Ok(expanded) => expanded,
        Err(e) => {
            debug!("leaving text unexpanded: {e}");
            text.to_owned()
        }
    }
}

/// Install `pw.env.*`.
///
/// `original` is the caller's snapshot (used by `getResolve`); `session` is
/// the working copy that `set` updates.  Expansions stop at `max_len` bytes.
fn register_api(
    lua: &Lua,
    original: &Envs,
    session: Rc<RefCell<Envs>>,
    max_len: usize,
) -> LuaResult<()> {
    let env = lua.create_table()?;

    // pw.env.get(key) → string | nil
    {
        let session = Rc::clone(&session);
        env.set(
            "get",
            lua.create_function(move |_, key: LuaValue| {
                let key = expect_string(&key, "key")?;
                trace!(%key, "pw.env.get");
                let envs = session.borrow();
                Ok(get_env(&key, &envs).map(|v| v.value.clone()))
            })?,
        )?;
    }

    // pw.env.getResolve(key) → string | nil
    //   expands against the snapshot the run started from
    {
        let session = Rc::clone(&session);
        let base = original.combined();
        env.set(
            "getResolve",
            lua.create_function(move |_, key: LuaValue| {
                let key = expect_string(&key, "key")?;
                trace!(%key, "pw.env.getResolve");
                let envs = session.borrow();
                Ok(get_env(&key, &envs).map(|v| expand_or_raw_within(&v.value, &base, max_len)))
            })?,
        )?;
    }

    // pw.env.set(key, value)
    {
        let session = Rc::clone(&session);
        env.set(
            "set",
            lua.create_function(move |_, (key, value): (LuaValue, LuaValue)| {
                let key = expect_string(&key, "key")?;
                let value = expect_string(&value, "value")?;
                trace!(%key, "pw.env.set");
                let mut envs = session.borrow_mut();
                *envs = set_env(&key, &value, &envs);
                Ok(())
            })?,
        )?;
    }

    // pw.env.resolve(text) → string
    //   expands against the working copy
    env.set(
        "resolve",
        lua.create_function(move |_, value: LuaValue| {
            let value = expect_string(&value, "value")?;
            let variables = session.borrow().combined();
            Ok(expand_or_raw_within(&value, &variables, max_len))
        })?,
    )?;

    let pw = lua.create_table()?;
    pw.set("env", env)?;
    lua.globals().set("pw", pw)?;

    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Accept only real Lua strings; numbers are not coerced.
fn expect_string(value: &LuaValue, what: &str) -> LuaResult<String> {
    match value {
        LuaValue::String(s) => {
            let text: &str = &s.to_str()?;
            Ok(text.to_owned())
        }
        _ => Err(LuaError::RuntimeError(format!("Expected {what} to be a string"))),
    }
}

fn display_value(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_owned(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_owned(),
    }
}

/// Innermost message of a Lua error, without the callback traceback wrapper.
fn describe(err: &LuaError) -> String {
    match err {
        LuaError::CallbackError { cause, .. } => describe(cause),
        LuaError::RuntimeError(msg) => msg.clone(),
        LuaError::SyntaxError { message, .. } => message.clone(),
        LuaError::MemoryError(msg) => format!("script exceeded memory limit: {msg}"),
        other => other.to_string(),
    }
}

fn init_error(err: LuaError) -> SandboxError {
    SandboxError::Initialization(describe(&err))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<Variable> {
        pairs.iter().map(|&(k, v)| Variable::new(k, v)).collect()
    }

    fn run(script: &str, envs: &Envs) -> Result<Envs, SandboxError> {
        Sandbox::new(SandboxConfig::default()).run(script, envs)
    }

    /// Value the script stored under `out` in the selected tier.
    fn out(envs: &Envs) -> Option<&str> {
        get_env("out", envs).map(|v| v.value.as_str())
    }

    // ── pw.env.get ────────────────────────────────────────────────────────

    #[test]
    fn get_returns_raw_value() {
        let envs = Envs::new(vec![], vars(&[("a", "<<b>>"), ("b", "x")]));
        let r = run(r#"pw.env.set("out", pw.env.get("a"))"#, &envs).unwrap();
        assert_eq!(out(&r), Some("<<b>>"));
    }

    #[test]
    fn get_missing_is_nil() {
        let r = run(r#"pw.env.set("out", tostring(pw.env.get("nope")))"#, &Envs::default()).unwrap();
        assert_eq!(out(&r), Some("nil"));
    }

    #[test]
    fn get_prefers_selected() {
        let envs = Envs::new(vars(&[("X", "2")]), vars(&[("X", "1")]));
        let r = run(r#"pw.env.set("out", pw.env.get("X"))"#, &envs).unwrap();
        assert_eq!(out(&r), Some("1"));
    }

    #[test]
    fn get_rejects_non_string_key() {
        let err = run("pw.env.get(123)", &Envs::default()).unwrap_err();
        assert_eq!(err, SandboxError::Evaluation("Expected key to be a string".into()));
    }

    // ── pw.env.getResolve ─────────────────────────────────────────────────

    #[test]
    fn get_resolve_expands() {
        let envs = Envs::new(vars(&[("host", "h.example")]), vars(&[("url", "https://<<host>>")]));
        let r = run(r#"pw.env.set("out", pw.env.getResolve("url"))"#, &envs).unwrap();
        assert_eq!(out(&r), Some("https://h.example"));
    }

    #[test]
    fn get_resolve_falls_back_to_raw_on_loop() {
        let envs = Envs::new(vec![], vars(&[("A", "<<B>>"), ("B", "<<A>>")]));
        let r = run(r#"pw.env.set("out", pw.env.getResolve("A"))"#, &envs).unwrap();
        assert_eq!(out(&r), Some("<<B>>"));
    }

    #[test]
    fn get_resolve_missing_is_nil() {
        let r = run(
            r#"pw.env.set("out", tostring(pw.env.getResolve("nope")))"#,
            &Envs::default(),
        )
        .unwrap();
        assert_eq!(out(&r), Some("nil"));
    }

    #[test]
    fn get_resolve_expands_against_starting_snapshot() {
        // `host` set during the run is visible to get, but getResolve expands
        // with the variables the run started from.
        let envs = Envs::new(vec![], vars(&[("url", "<<host>>/x")]));
        let r = run(
            r#"pw.env.set("host", "late"); pw.env.set("out", pw.env.getResolve("url"))"#,
            &envs,
        )
        .unwrap();
        assert_eq!(out(&r), Some("<<host>>/x"));
    }

    #[test]
    fn get_resolve_rejects_non_string_key() {
        let err = run("pw.env.getResolve(true)", &Envs::default()).unwrap_err();
        assert!(err.to_string().contains("Expected key to be a string"));
    }

    // ── pw.env.set ────────────────────────────────────────────────────────

    #[test]
    fn set_is_visible_to_later_calls() {
        let r = run(
            r#"pw.env.set("a", "1"); pw.env.set("out", pw.env.get("a") .. "!")"#,
            &Envs::default(),
        )
        .unwrap();
        assert_eq!(out(&r), Some("1!"));
    }

    #[test]
    fn set_never_touches_global() {
        let envs = Envs::new(vars(&[("k", "g")]), vec![]);
        let r = run(r#"pw.env.set("k", "s")"#, &envs).unwrap();
        assert_eq!(r.global, vars(&[("k", "g")]));
        assert_eq!(r.selected, vars(&[("k", "s")]));
    }

    #[test]
    fn set_rejects_non_string_arguments() {
        let err = run(r#"pw.env.set(1, "v")"#, &Envs::default()).unwrap_err();
        assert!(err.to_string().contains("Expected key to be a string"));
        let err = run(r#"pw.env.set("k", 42)"#, &Envs::default()).unwrap_err();
        assert!(err.to_string().contains("Expected value to be a string"));
        let err = run(r#"pw.env.set("k")"#, &Envs::default()).unwrap_err();
        assert!(err.to_string().contains("Expected value to be a string"));
    }

    // ── pw.env.resolve ────────────────────────────────────────────────────

    #[test]
    fn resolve_uses_working_copy() {
        let r = run(
            r#"pw.env.set("name", "world"); pw.env.set("out", pw.env.resolve("hello <<name>>"))"#,
            &Envs::default(),
        )
        .unwrap();
        assert_eq!(out(&r), Some("hello world"));
    }

    #[test]
    fn resolve_falls_back_on_loop() {
        let envs = Envs::new(vars(&[("A", "<<A>>")]), vec![]);
        let r = run(r#"pw.env.set("out", pw.env.resolve("x <<A>>"))"#, &envs).unwrap();
        assert_eq!(out(&r), Some("x <<A>>"));
    }

    #[test]
    fn resolve_rejects_non_string() {
        let err = run("pw.env.resolve({})", &Envs::default()).unwrap_err();
        assert!(err.to_string().contains("Expected value to be a string"));
    }

    // ── errors ────────────────────────────────────────────────────────────

    #[test]
    fn bridge_errors_can_be_caught_by_the_script() {
        let r = run(
            r#"local ok = pcall(pw.env.get, 1); pw.env.set("out", tostring(ok))"#,
            &Envs::default(),
        )
        .unwrap();
        assert_eq!(out(&r), Some("false"));
    }

    #[test]
    fn runtime_error_discards_working_copy() {
        let err = run(r#"pw.env.set("a", "1"); error("boom")"#, &Envs::default()).unwrap_err();
        match err {
            SandboxError::Evaluation(msg) => {
                assert!(msg.contains("boom"), "{msg}");
                assert!(msg.contains(CHUNK_NAME), "{msg}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn syntax_error_is_an_evaluation_error() {
        let err = run("pw.env.set(", &Envs::default()).unwrap_err();
        assert!(matches!(err, SandboxError::Evaluation(_)));
    }

    // ── isolation ─────────────────────────────────────────────────────────

    #[test]
    fn host_libraries_are_absent() {
        let r = run(
            r#"pw.env.set("out", table.concat({
                type(os), type(io), type(require), type(dofile),
                type(loadfile), type(load), type(debug), type(package)
            }, ","))"#,
            &Envs::default(),
        )
        .unwrap();
        assert_eq!(out(&r), Some("nil,nil,nil,nil,nil,nil,nil,nil"));
    }

    #[test]
    fn safe_libraries_are_present() {
        let r = run(
            r#"pw.env.set("out", string.upper("a") .. math.floor(2.5) .. utf8.char(72))"#,
            &Envs::default(),
        )
        .unwrap();
        assert_eq!(out(&r), Some("A2H"));
    }

    #[test]
    fn print_is_harmless() {
        assert!(run(r#"print("hello", 1, nil, {})"#, &Envs::default()).is_ok());
    }

    #[test]
    fn runs_do_not_share_globals() {
        let sandbox = Sandbox::new(SandboxConfig::default());
        sandbox.run("leaked = 'yes'", &Envs::default()).unwrap();
        let r = sandbox
            .run(r#"pw.env.set("out", tostring(leaked))"#, &Envs::default())
            .unwrap();
        assert_eq!(out(&r), Some("nil"));
    }

    // ── limits ────────────────────────────────────────────────────────────

    #[test]
    fn instruction_limit_stops_infinite_loop() {
        let config = SandboxConfig { instruction_limit: Some(100_000), ..SandboxConfig::unlimited() };
        let err = Sandbox::new(config).run("while true do end", &Envs::default()).unwrap_err();
        assert!(err.to_string().contains("instruction limit"), "{err}");
    }

    #[test]
    fn pcall_cannot_swallow_the_budget() {
        let config = SandboxConfig { instruction_limit: Some(100_000), ..SandboxConfig::unlimited() };
        let script = "while true do pcall(function() while true do end end) end";
        let err = Sandbox::new(config).run(script, &Envs::default()).unwrap_err();
        assert!(err.to_string().contains("instruction limit"), "{err}");
    }

    #[test]
    fn time_limit_stops_infinite_loop() {
        let config = SandboxConfig {
            timeout: Some(std::time::Duration::from_millis(50)),
            ..SandboxConfig::unlimited()
        };
        let err = Sandbox::new(config).run("while true do end", &Envs::default()).unwrap_err();
        assert!(err.to_string().contains("time limit"), "{err}");
    }

    #[test]
    fn memory_limit_stops_runaway_allocation() {
        let config = SandboxConfig { memory_limit: Some(1024 * 1024), ..SandboxConfig::unlimited() };
        let script = "local t = {} for i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end";
        assert!(Sandbox::new(config).run(script, &Envs::default()).is_err());
    }

    #[test]
    fn self_repeating_value_is_left_unexpanded() {
        let config = SandboxConfig {
            instruction_limit: Some(10_000),
            memory_limit: Some(1024 * 1024),
            ..SandboxConfig::unlimited()
        };
        let script = r#"pw.env.set("A", string.rep("<<A>>", 8)); pw.env.set("out", pw.env.resolve("<<A>>"))"#;
        let started = Instant::now();
        let r = Sandbox::new(config).run(script, &Envs::default()).unwrap();
        assert_eq!(out(&r), Some("<<A>>"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn get_resolve_of_self_repeating_value_returns_raw() {
        let raw = "<<A>>".repeat(8);
        let envs = Envs::new(vec![], vars(&[("A", &raw)]));
        let r = run(r#"pw.env.set("out", pw.env.getResolve("A"))"#, &envs).unwrap();
        assert_eq!(out(&r), Some(raw.as_str()));
    }

    #[test]
    fn expansion_bound_follows_memory_limit() {
        let tight = Sandbox::new(SandboxConfig { memory_limit: Some(4096), ..SandboxConfig::unlimited() });
        assert_eq!(tight.expansion_limit(), 4096);
        assert_eq!(Sandbox::new(SandboxConfig::unlimited()).expansion_limit(), MAX_EXPANDED_LEN);
    }

    #[test]
    fn catastrophic_pattern_is_refused() {
        let config = SandboxConfig { timeout: Some(Duration::from_millis(500)), ..SandboxConfig::unlimited() };
        let started = Instant::now();
        for script in [
            r#"string.find(string.rep("a", 4000), string.rep("a-", 12) .. "b")"#,
            r#"local s = string.rep("a", 4000); s:match(string.rep("a-", 12) .. "b")"#,
            r#"string.gsub(string.rep("a", 4000), string.rep("a*", 12) .. "b", "")"#,
            r#"for _ in string.gmatch(string.rep("a", 4000), string.rep(".-", 12) .. "b") do end"#,
        ] {
            let err = Sandbox::new(config.clone()).run(script, &Envs::default()).unwrap_err();
            assert!(err.to_string().contains("pattern too complex"), "{err}");
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn everyday_patterns_still_work() {
        let script = r#"
            local parts = {}
            for w in string.gmatch("a,b,c", "[^,]+") do parts[#parts + 1] = w end
            local token = ("Bearer xyz"):match("^Bearer (.+)$")
            local csv = ("a b  c"):gsub("%s+", ",")
            local dot = string.find("a.b", ".", 1, true)
            pw.env.set("out", table.concat(parts) .. token .. csv .. dot)
        "#;
        let r = run(script, &Envs::default()).unwrap();
        assert_eq!(out(&r), Some("abcxyza,b,c2"));
    }

    #[test]
    fn plain_find_skips_the_cost_check() {
        let script = r#"
            local s = string.rep("a", 100000)
            pw.env.set("out", tostring(string.find(s, "a-a-a-a-b", 1, true)))
        "#;
        let r = run(script, &Envs::default()).unwrap();
        assert_eq!(out(&r), Some("nil"));
    }

    #[test]
    fn variable_items_in_patterns() {
        assert_eq!(variable_items(b"abc"), 0);
        assert_eq!(variable_items(b"a?b?"), 0);
        assert_eq!(variable_items(b"%s+"), 1);
        assert_eq!(variable_items(b"(%d+)-(%d+)"), 2);
        assert_eq!(variable_items(b"[%]-]*x"), 1);
        assert_eq!(variable_items(b"%b()"), 1);
        assert_eq!(variable_items(b"%f[%w]%w+"), 1);
        assert_eq!(variable_items(b"a.-b"), 1);
    }

    #[test]
    fn pattern_cost_estimates() {
        assert_eq!(pattern_cost(10, b"^abc", true), 1);
        assert_eq!(pattern_cost(10, b"abc", true), 10);
        assert_eq!(pattern_cost(10, b"^a+", true), 10);
        assert_eq!(pattern_cost(10, b"^a+", false), 100);
        assert_eq!(pattern_cost(0, b"a-a-a-", true), 1);
        assert!(pattern_cost(4000, &b"a-".repeat(12), true) > PATTERN_STEP_BUDGET);
        assert!(pattern_cost(10_000, b"%s+", true) <= PATTERN_STEP_BUDGET);
    }

    #[test]
    fn probe_reports_lua_version() {
        let version = Sandbox::default().probe().unwrap();
        assert!(version.starts_with("Lua 5.4"), "{version}");
    }
}
