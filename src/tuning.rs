//! Worker sizing
//!
//! Detects hardware capabilities and derives the default number of SQL
//! generation workers and the pipeline channel capacity.

use sysinfo::System;

/// Upper bound for auto-detected worker threads
const MAX_AUTO_WORKERS: usize = 8;

/// Sizing values derived from hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Number of SQL generation workers
    pub worker_threads: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            detected_cores: 4,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Auto-tune worker count based on detected hardware
///
/// Rendering SQL is cheap compared to pulling the stream, so the pool
/// takes half of the cores (min 1, max 8) and leaves the rest to the
/// runtime, the classifier and the report writers.
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let worker_threads = (cores / 2).clamp(1, MAX_AUTO_WORKERS);

    tracing::debug!(
        cores = cores,
        worker_threads = worker_threads,
        "Auto-tuned worker pool based on hardware"
    );

    TunedConfig {
        worker_threads,
        detected_cores: cores,
    }
}

/// Bounded channel capacity for a pool of `threads` workers
pub fn channel_capacity(threads: usize) -> usize {
    (threads * 2).max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tune_returns_sensible_values() {
        let config = auto_tune();
        assert!(config.worker_threads >= 1);
        assert!(config.worker_threads <= MAX_AUTO_WORKERS);
        assert!(config.detected_cores >= 1);
    }

    #[test]
    fn test_channel_capacity() {
        assert_eq!(channel_capacity(4), 8);
        assert_eq!(channel_capacity(1), 2);
        assert_eq!(channel_capacity(0), 2);
    }
}
