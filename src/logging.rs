//! Tracing subscriber installation for binaries and tools built on perfcfg.
//!
//! The library itself only emits `tracing` events; it never installs a
//! subscriber on its own.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "PERFCFG_LOG";

/// Install a compact fmt subscriber filtered by `PERFCFG_LOG`, then `RUST_LOG`,
/// then `warn`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_is_idempotent() {
        let _ = super::init();
        assert!(!super::init());
    }
}
