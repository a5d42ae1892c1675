//! Guard rails between host code and model code.
//!
//! Every call from the host into model code (declarations, `init`, `run`)
//! happens inside a [`ModelCodeGuard`]. Host-only operations call
//! [`ensure_host_code`] and refuse to run while a guard is live on the current
//! thread, which covers model code reaching back into the host through a
//! registered function.
//!
//! This is best-effort protection against accidental misuse. It is not a
//! security boundary: a host function that spawns a thread escapes it, and the
//! engine limits bound resource use but do not isolate memory.

use std::{cell::Cell, marker::PhantomData};
use rhai::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{context, error::{Result, RuntimeError}};

thread_local! {
    static MODEL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as executing model code until dropped.
pub struct ModelCodeGuard {
    // thread-local bookkeeping: the guard must be dropped on the thread that created it
    _not_send: PhantomData<*const ()>,
}

impl ModelCodeGuard {
    pub fn enter() -> Self {
        MODEL_DEPTH.with(|d| d.set(d.get() + 1));
        Self { _not_send: PhantomData }
    }
}

impl Drop for ModelCodeGuard {
    fn drop(&mut self) {
        MODEL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Is the current thread inside model code?
pub fn in_model_code() -> bool {
    MODEL_DEPTH.with(|d| d.get() > 0)
}

/// Refuse `operation` when called from model code.
pub fn ensure_host_code(operation: &str) -> Result<()> {
    if in_model_code() {
        warn!(operation, "model code attempted a host-only operation");
        return Err(RuntimeError::RuntimeValidation(format!(
            "`{operation}` is not allowed from model code"
        )));
    }
    Ok(())
}

/// Resource limits applied to the model engine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct GuardLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_modules: usize,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            max_operations: 50_000_000,
            max_call_levels: 64,
            max_expr_depth: 128,
            max_function_expr_depth: 64,
            max_string_size: 16 * 1024 * 1024,
            max_array_size: 10_000_000,
            max_map_size: 100_000,
            max_modules: 512,
        }
    }
}

/// Symbols model code may not use at all.
pub const DISABLED_SYMBOLS: [&str; 1] = ["eval"];

/// Build the engine model code runs in: dynamic evaluation disabled, limits
/// applied, `print`/`debug` routed to tracing and the [`context`] API registered.
pub fn sandboxed_engine(limits: &GuardLimits) -> Engine {
    let mut engine = Engine::new();
    for symbol in DISABLED_SYMBOLS {
        engine.disable_symbol(symbol);
    }

    engine
        .set_max_operations(limits.max_operations)
        .set_max_call_levels(limits.max_call_levels)
        .set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size)
        .set_max_modules(limits.max_modules);

    engine.on_print(|text| info!(target: "model", "{text}"));
    engine.on_debug(|text, source, pos| {
        debug!(target: "model", source = source.unwrap_or("<unknown>"), %pos, "{text}");
    });

    context::register_context_api(&mut engine);
    engine
}
