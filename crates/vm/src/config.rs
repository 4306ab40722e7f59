//! Evaluator configuration.

/// Runtime switches for a [`crate::vm::Vm`] instance.
///
/// `debug` re-raises any error thrown inside an opcode handler instead of
/// trapping it as a guest exception, which keeps the original Rust error
/// intact for the embedder. It can also be enabled process-wide through the
/// `DEBUG_INTERNAL` environment variable (any non-zero integer).
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    /// Re-raise handler faults instead of routing them through the guest
    /// exception machinery.
    pub debug: bool,
    /// Log every decoded instruction argument at `trace` level.
    pub trace_opargs: bool,
}

impl VmConfig {
    /// Builds a configuration from the process environment.
    pub fn from_env() -> Self {
        let debug = std::env::var("DEBUG_INTERNAL")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v != 0)
            .unwrap_or(false);
        Self {
            debug,
            trace_opargs: false,
        }
    }

    /// Enables internal-debug mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
