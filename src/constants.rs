//! Centralized configuration constants.
//!
//! This module consolidates the magic numbers and environment keys used
//! throughout the pool so that:
//!
//! - The operational defaults are documented in one place
//! - Values can be updated consistently
//! - The rationale for each constant is recorded next to it
//!
//! Protocol-level constants (QAP1 command words and expression types) live
//! next to the codec in [`crate::engine::codec`].

// =============================================================================
// Network Constants
// =============================================================================

/// Default TCP port an Rserve process listens on.
///
/// This matches Rserve's own compiled-in default; it is used whenever a
/// configuration entry or CLI invocation does not name a port.
pub const DEFAULT_RSERVE_PORT: u16 = 6311;

// =============================================================================
// Pool Constants
// =============================================================================

/// Default number of consecutive connection failures a slot absorbs before
/// it is permanently removed from the pool.
///
/// Each failed open rotates the slot to the tail of the idle deque so that
/// a flaky backend cannot monopolise the head. Once this many failures
/// accumulate without an intervening success, the slot is demoted and the
/// acquisition surfaces the last error. Overridable per pool via
/// `PoolConfig.failure_budget`.
pub const DEFAULT_FAILURE_BUDGET: u32 = 3;

// =============================================================================
// Embedded Server Constants
// =============================================================================

/// Maximum number of liveness probes after spawning an embedded server.
///
/// A freshly spawned Rserve process needs a moment to bind its listening
/// socket. Rather than sleeping a fixed interval, the pool probes the
/// endpoint until it answers, bounded by this count.
pub const STARTUP_PROBE_ATTEMPTS: usize = 30;

/// Delay between embedded-server liveness probes, in milliseconds.
pub const STARTUP_PROBE_INTERVAL_MS: u64 = 200;

/// Default executable name for Rserve on unix platforms.
///
/// Assumes the command is on the execution path; override with a fully
/// qualified path via the `command` configuration attribute or the
/// [`RSERVE_COMMAND_ENV`] environment variable.
pub const DEFAULT_RSERVE_EXECUTABLE: &str = "Rserve";

/// Default executable name for Rserve on windows platforms.
pub const DEFAULT_RSERVE_EXECUTABLE_WINDOWS: &str = "Rserve.exe";

/// Environment variable overriding the Rserve launch command.
pub const RSERVE_COMMAND_ENV: &str = "RSERVE_COMMAND";

// =============================================================================
// Configuration Resolution Constants
// =============================================================================

/// Environment variable naming the pool configuration document.
///
/// The value is treated as a filesystem path (a `file://` URL is accepted).
pub const CONFIGURATION_ENV: &str = "RESERVOIR_CONFIGURATION";

/// Default configuration file name searched in the working directory and
/// then in `config/` when [`CONFIGURATION_ENV`] is not set.
pub const DEFAULT_CONFIGURATION_FILE: &str = "reservoir.toml";

/// Environment variable listing extra directories (colon-separated) the
/// script loader searches for named scripts.
pub const SCRIPT_PATH_ENV: &str = "RESERVOIR_SCRIPT_PATH";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_matches_rserve() {
        assert_eq!(DEFAULT_RSERVE_PORT, 6311);
    }

    #[test]
    fn test_failure_budget_is_three_strikes() {
        assert_eq!(DEFAULT_FAILURE_BUDGET, 3);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_startup_probe_window_is_bounded() {
        // The probe loop replaces a fixed five-second sleep; the total
        // window should stay in the same order of magnitude.
        let window_ms = STARTUP_PROBE_ATTEMPTS as u64 * STARTUP_PROBE_INTERVAL_MS;
        assert!(window_ms >= 1_000);
        assert!(window_ms <= 30_000);
    }
}
