//! Command-line arguments shared by `cluster2local` and `local2cluster`

use anyhow::{Context, anyhow};
use common::filter::FilterSettings;
use common::progress::make_reporter;
use common::{OutputConfig, ProgressSettings, ProgressType, RuntimeConfig, Timeouts};
use remote::Target;
use remote::auth::{Credentials, SecondFactor};
use remote::cache::{RetryPolicy, SessionCache};
use remote::ssh::{ChannelKind, HostKeyPolicy, SshConnector, SshOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing::instrument;
use zeroize::Zeroizing;

use crate::engine::{self, Direction, DirectoryStrategy, Settings, Summary, TransferRequest};

/// A secret given on the command line; `Debug` never shows it.
#[derive(Clone)]
pub struct SecretArg(Zeroizing<String>);

impl std::str::FromStr for SecretArg {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Zeroizing::new(s.to_string())))
    }
}

impl std::fmt::Debug for SecretArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Where to copy from and to.
#[derive(clap::Args, Debug, Clone)]
pub struct PathArgs {
    /// Directory on this machine
    #[arg(short = 'l', long = "local-dir", visible_alias = "local_dir", value_name = "DIR")]
    pub local_dir: PathBuf,

    /// Directory on the cluster
    #[arg(
        short = 'c',
        long = "cluster-dir",
        visible_alias = "cluster_dir",
        value_name = "DIR"
    )]
    pub cluster_dir: String,

    /// Copy only this file (relative to the source directory) instead of the whole directory
    #[arg(short = 'f', long = "file", visible_alias = "filename", value_name = "FILE")]
    pub file: Option<String>,
}

impl PathArgs {
    pub fn request(&self) -> TransferRequest {
        TransferRequest {
            local_dir: self.local_dir.clone(),
            remote_dir: self.cluster_dir.clone(),
            file: self.file.clone(),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    // Connection
    /// Cluster login host
    #[arg(long, env = "CLUSTERCP_HOST", help_heading = "Connection")]
    pub host: String,

    /// User name on the cluster [default: $USER]
    #[arg(long, env = "CLUSTERCP_USER", help_heading = "Connection")]
    pub username: Option<String>,

    /// SSH port
    #[arg(long, default_value_t = remote::DEFAULT_SSH_PORT, help_heading = "Connection")]
    pub port: u16,

    /// Password for the cluster account
    ///
    /// Discouraged: the password ends up in shell history and the process list. When omitted it
    /// is asked for on the terminal.
    #[arg(long, value_name = "PASSWORD", help_heading = "Connection")]
    pub password: Option<SecretArg>,

    /// Ask for a second-factor code and append it to the password (default)
    #[arg(long, overrides_with = "no_two_factor", help_heading = "Connection")]
    pub two_factor: bool,

    /// Log in with the password alone
    #[arg(long, overrides_with = "two_factor", help_heading = "Connection")]
    pub no_two_factor: bool,

    /// Try this private key before any password-based method
    #[arg(long, short = 'i', value_name = "PATH", help_heading = "Connection")]
    pub identity_file: Option<PathBuf>,

    /// Transfer channel: sftp (random access) or scp (stream copy)
    #[arg(
        long,
        default_value_t = ChannelKind::Sftp,
        value_name = "CHANNEL",
        help_heading = "Connection"
    )]
    pub channel: ChannelKind,

    /// Server host key verification: strict, accept-new or accept-any
    #[arg(
        long,
        default_value_t = HostKeyPolicy::AcceptNew,
        value_name = "POLICY",
        help_heading = "Connection"
    )]
    pub host_key_policy: HostKeyPolicy,

    /// known_hosts file to check and update [default: ~/.ssh/known_hosts]
    #[arg(long, value_name = "PATH", help_heading = "Connection")]
    pub known_hosts: Option<PathBuf>,

    /// Connection attempts before giving up (authentication failures are never retried)
    #[arg(long, default_value_t = 3, value_name = "N", help_heading = "Connection")]
    pub connect_attempts: u32,

    /// Pause between connection attempts
    #[arg(
        long,
        default_value = "2s",
        value_parser = humantime::parse_duration,
        value_name = "DELAY",
        help_heading = "Connection"
    )]
    pub connect_backoff: Duration,

    // Timeouts
    /// Limit for TCP connect plus SSH handshake, e.g. "30s"
    #[arg(
        long,
        value_parser = humantime::parse_duration,
        value_name = "DURATION",
        help_heading = "Timeouts"
    )]
    pub connect_timeout: Option<Duration>,

    /// Limit for a single remote command, e.g. "10min"
    #[arg(
        long,
        value_parser = humantime::parse_duration,
        value_name = "DURATION",
        help_heading = "Timeouts"
    )]
    pub command_timeout: Option<Duration>,

    /// Limit for a single read or write on the transfer channel, e.g. "60s"
    #[arg(
        long,
        value_parser = humantime::parse_duration,
        value_name = "DURATION",
        help_heading = "Timeouts"
    )]
    pub io_timeout: Option<Duration>,

    // Filtering
    /// Glob pattern for entries to skip in folder transfers (can be specified multiple times)
    ///
    /// Patterns use glob syntax: * matches anything except /, ** matches anything including /,
    /// ? matches single char, [...] for character classes. Leading / anchors to the folder root,
    /// trailing / matches only directories.
    #[arg(
        long,
        value_name = "PATTERN",
        action = clap::ArgAction::Append,
        help_heading = "Filtering"
    )]
    pub exclude: Vec<String>,

    /// Do not skip AppleDouble files (`._*`)
    #[arg(long, visible_alias = "no-skip-dots", help_heading = "Filtering")]
    pub no_default_excludes: bool,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    pub progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    pub progress_type: Option<ProgressType>,

    /// Sets the delay between progress updates, e.g. "200ms", "10s" (default: 200ms)
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    pub progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    pub summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help_heading = "Progress & output"
    )]
    pub verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    pub quiet: bool,

    // Advanced settings
    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    pub max_blocking_threads: usize,
}

impl CommonArgs {
    pub fn output(&self) -> OutputConfig {
        OutputConfig {
            quiet: self.quiet,
            verbose: self.verbose,
            print_summary: self.summary || self.verbose > 0,
        }
    }
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_blocking_threads: self.max_blocking_threads,
        }
    }
    pub fn progress_settings(&self) -> anyhow::Result<Option<ProgressSettings>> {
        if !self.progress && self.progress_type.is_none() && self.progress_delay.is_none() {
            return Ok(None);
        }
        let mut settings = ProgressSettings {
            progress_type: self.progress_type.unwrap_or_default(),
            ..Default::default()
        };
        if let Some(delay) = &self.progress_delay {
            settings.delay = humantime::parse_duration(delay)
                .with_context(|| format!("invalid --progress-delay '{delay}'"))?;
        }
        Ok(Some(settings))
    }
    pub fn timeouts(&self) -> anyhow::Result<Timeouts> {
        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            connect: self.connect_timeout.unwrap_or(defaults.connect),
            command: self.command_timeout.unwrap_or(defaults.command),
            io: self.io_timeout.unwrap_or(defaults.io),
            ..defaults
        };
        timeouts.validate().map_err(|error| anyhow!(error))?;
        Ok(timeouts)
    }
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts.max(1),
            backoff: self.connect_backoff,
        }
    }
    pub fn filter(&self) -> anyhow::Result<FilterSettings> {
        FilterSettings::from_args(&self.exclude, !self.no_default_excludes)
    }
    fn user(&self) -> anyhow::Result<String> {
        match &self.username {
            Some(user) => Ok(user.clone()),
            None => std::env::var("USER")
                .context("no --username given and $USER is not set"),
        }
    }
    pub fn target(&self) -> anyhow::Result<Target> {
        Ok(Target::new(self.user()?, self.host.clone()).with_port(self.port))
    }
    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        Ok(Credentials {
            user: self.user()?,
            password: self.password.as_ref().map(|secret| secret.0.clone()),
            second_factor: if self.no_two_factor {
                SecondFactor::None
            } else {
                SecondFactor::Prompt
            },
            identity_file: self.identity_file.clone(),
        })
    }
    pub fn ssh_options(&self) -> anyhow::Result<SshOptions> {
        Ok(SshOptions {
            channel: self.channel,
            host_key_policy: self.host_key_policy,
            known_hosts: self.known_hosts.clone(),
            timeouts: self.timeouts()?,
        })
    }
}

/// Connects, performs one transfer and closes the session again, whatever the outcome.
#[instrument(skip(common))]
pub async fn run_transfer(
    direction: Direction,
    request: TransferRequest,
    strategy: DirectoryStrategy,
    common: CommonArgs,
) -> anyhow::Result<Summary> {
    let target = common.target()?;
    let settings = Settings {
        filter: common.filter()?,
        strategy,
        ..Default::default()
    };
    let mut reporter = make_reporter(common.progress_settings()?.as_ref());
    let connector = SshConnector::new(common.credentials()?, common.ssh_options()?);
    let cache = SessionCache::with_retry_policy(connector, common.retry_policy());
    let result = async {
        let session = cache
            .acquire(&target)
            .await
            .with_context(|| format!("cannot open a session to {target}"))?;
        let summary = engine::transfer(
            session.as_ref(),
            direction,
            &request,
            &settings,
            reporter.as_mut(),
        )
        .await
        .with_context(|| format!("{direction} failed"))?;
        cache.release(session);
        Ok::<_, anyhow::Error>(summary)
    }
    .await;
    cache.shutdown().await;
    result
}
