//! Configuration types shared by the transfer tools

use std::time::Duration;

/// Runtime configuration for tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Bounds on every remote interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect plus SSH handshake
    pub connect: Duration,
    /// liveness probe on a cached session
    pub probe: Duration,
    /// remote commands (archiving can take a while on large trees)
    pub command: Duration,
    /// a single read or write on a data channel
    pub io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            probe: Duration::from_secs(5),
            command: Duration::from_secs(600),
            io: Duration::from_secs(60),
        }
    }
}

impl Timeouts {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("connect", self.connect),
            ("probe", self.probe),
            ("command", self.command),
            ("io", self.io),
        ] {
            if value.is_zero() {
                return Err(format!("{name} timeout must be greater than zero"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_are_valid() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.probe, Duration::from_secs(5));
        assert!(timeouts.validate().is_ok());
    }
    #[test]
    fn zero_timeout_is_rejected() {
        let timeouts = Timeouts {
            io: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            timeouts.validate().unwrap_err(),
            "io timeout must be greater than zero"
        );
    }
}
