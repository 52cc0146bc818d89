//! Cranelift JIT compilation of expression programs.
//!
//! The op stream is lowered to one flat native routine per output
//! plane: a doubly-nested row/column loop whose body evaluates the
//! expression for [`LANES`] pixels at a time. Per-op cost is paid once,
//! at compile time; the generated loop's cost is independent of how the
//! expression was written.
//!
//! # Architecture
//!
//! 1. `math` emits the transcendental helpers (`vexp`, `vlog`,
//!    `vsin`, `vcos`, `vpow`) as module-local functions.
//! 2. `lower` walks the op stream, maintaining a compile-time stack
//!    of typed SIMD values, and emits IR for each op including the
//!    pixel load and the clamped store.
//! 3. `routine` wraps the body in the row/column loop, finalizes the
//!    module and retains the native entry point.
//!
//! # Representation
//!
//! An 8-lane value is two 128-bit Cranelift vectors (`F32X4`/`I32X4`
//! halves), so the generated code maps onto baseline SSE as well as
//! AVX-capable hosts.
//!
//! Author: Moroya Sakamoto

use std::sync::OnceLock;

mod lower;
mod math;
mod routine;

pub use routine::{CompiledExpr, OPT_USE_INTEGER};

/// Pixels processed per iteration of the inner loop body.
pub const LANES: usize = 8;

/// Inlined copies of the expression body per inner-loop iteration.
pub(crate) const UNROLL: usize = 1;

/// 128-bit halves per 8-lane value.
pub(crate) const HALVES: usize = LANES / 4;

/// Back-end optimization level, applied process-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    /// No optimization; fastest compilation.
    None,
    /// Optimize for execution speed (default).
    Speed,
    /// Balance speed and code size.
    SpeedAndSize,
}

impl OptLevel {
    pub(crate) fn flag_value(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Process-wide JIT configuration.
///
/// Set once at plugin load; the first call wins and later calls observe
/// the stored value. Compilations pick the configuration up lazily, so
/// concurrent first loads cannot race past the `OnceLock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitConfig {
    /// Back-end optimization level.
    pub opt_level: OptLevel,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            opt_level: OptLevel::Speed,
        }
    }
}

static JIT_CONFIG: OnceLock<JitConfig> = OnceLock::new();

/// Installs the process-wide JIT configuration. Returns the effective
/// configuration, which is the first one ever installed.
pub fn configure(config: JitConfig) -> JitConfig {
    *JIT_CONFIG.get_or_init(|| config)
}

/// The effective configuration, defaulting on first use.
pub(crate) fn config() -> JitConfig {
    *JIT_CONFIG.get_or_init(JitConfig::default)
}
