//! Shared plumbing for the clustercp tools
//!
//! - [`config`]: runtime, output and timeout settings
//! - [`filter`]: exclusion patterns applied during tree walks
//! - [`progress`]: byte-level progress state and reporters
//! - [`run`]: process bootstrap (logging, tokio runtime, error reporting)

use std::future::Future;

pub mod config;
pub mod filter;
pub mod progress;

pub use config::{OutputConfig, RuntimeConfig, Timeouts};
pub use progress::{ProgressReporter, ProgressSettings, ProgressType};

fn default_log_level(output: &OutputConfig) -> &'static str {
    if output.quiet && output.verbose == 0 {
        return "off";
    }
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_log_level(output)));
    // a subscriber may already be installed (e.g. when embedded); keep it
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stdout)
        .try_init();
}

/// Runs `func` on a fresh single-threaded tokio runtime.
///
/// Returns `None` when the runtime cannot be built or `func` fails; the error chain is printed
/// to stderr unless `output.quiet` is set. On success the returned summary is printed when
/// `output.print_summary` is set.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all();
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start async runtime: {error}");
            }
            return None;
        }
    };
    match rt.block_on(func()) {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::debug!("operation failed: {error:?}");
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_follows_verbosity() {
        let mut output = OutputConfig::default();
        assert_eq!(default_log_level(&output), "error");
        output.verbose = 1;
        assert_eq!(default_log_level(&output), "info");
        output.verbose = 2;
        assert_eq!(default_log_level(&output), "debug");
        output.verbose = 7;
        assert_eq!(default_log_level(&output), "trace");
        let quiet = OutputConfig {
            quiet: true,
            ..Default::default()
        };
        assert_eq!(default_log_level(&quiet), "off");
    }
    #[test]
    fn run_returns_summary_on_success() {
        let output = OutputConfig {
            quiet: true,
            ..Default::default()
        };
        let result = run(output, RuntimeConfig::default(), || async {
            tokio::task::yield_now().await;
            Ok::<_, anyhow::Error>(42)
        });
        assert_eq!(result, Some(42));
    }
    #[test]
    fn run_returns_none_on_error() {
        let output = OutputConfig {
            quiet: true,
            ..Default::default()
        };
        let result: Option<u32> = run(output, RuntimeConfig::default(), || async {
            Err(anyhow::anyhow!("boom"))
        });
        assert!(result.is_none());
    }
}
