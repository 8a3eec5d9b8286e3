//! SSH transport built on `russh`

use crate::auth::{Credentials, Prompter, Secrets, TtyPrompter};
use crate::scp::ScpChannel;
use crate::sftp::SftpChannel;
use crate::{
    CommandOutput, Connector, Error, Liveness, LivenessCell, RemoteEntry, RemoteMetadata, Result,
    Target, TransferChannel, Transport,
};
use common::Timeouts;
use common::progress::ProgressReporter;
use russh::ChannelMsg;
use russh::client::Handle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use zeroize::Zeroizing;

/// How unknown or changed server host keys are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// key must already be in known_hosts
    Strict,
    /// unknown keys are added to known_hosts, changed keys are rejected
    #[default]
    AcceptNew,
    /// no verification at all
    AcceptAny,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "strict" | "yes" => Ok(Self::Strict),
            "accept-new" => Ok(Self::AcceptNew),
            "accept-any" | "no" => Ok(Self::AcceptAny),
            other => Err(anyhow::anyhow!(
                "unknown host key policy '{other}', expected strict, accept-new or accept-any"
            )),
        }
    }
}

impl std::fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Strict => "strict",
            Self::AcceptNew => "accept-new",
            Self::AcceptAny => "accept-any",
        })
    }
}

/// Which transfer channel to open next to the shell connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelKind {
    #[default]
    Sftp,
    Scp,
}

impl std::str::FromStr for ChannelKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sftp" => Ok(Self::Sftp),
            "scp" => Ok(Self::Scp),
            other => Err(anyhow::anyhow!(
                "unknown channel '{other}', expected sftp or scp"
            )),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sftp => "sftp",
            Self::Scp => "scp",
        })
    }
}

pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl ClientHandler {
    fn check_known(
        &self,
        key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, russh::keys::Error> {
        match &self.known_hosts {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, key),
        }
    }
    fn learn(&self, key: &russh::keys::PublicKey) -> std::result::Result<(), russh::keys::Error> {
        match &self.known_hosts {
            Some(path) => {
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path)
            }
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, key),
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::AcceptAny {
            return Ok(true);
        }
        match self.check_known(server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) if self.policy == HostKeyPolicy::AcceptNew => {
                tracing::warn!(
                    "adding host key for {}:{} to known_hosts",
                    self.host,
                    self.port
                );
                if let Err(error) = self.learn(server_public_key) {
                    tracing::warn!("could not record host key: {error}");
                }
                Ok(true)
            }
            Ok(false) => {
                tracing::error!("host key for {}:{} is not known", self.host, self.port);
                Ok(false)
            }
            Err(error) => {
                tracing::error!(
                    "host key verification for {}:{} failed: {error}",
                    self.host,
                    self.port
                );
                Ok(false)
            }
        }
    }
}

/// Runs one command on its own session channel.
pub(crate) async fn run_command(
    handle: &Handle<ClientHandler>,
    host: &str,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput> {
    let run = async {
        let mut channel = handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        let mut output = CommandOutput::default();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }
        Ok::<_, russh::Error>((output, exit_status))
    };
    match tokio::time::timeout(timeout, run).await {
        Err(_) => Err(Error::connection(
            host,
            anyhow::anyhow!(
                "`{command}` did not finish within {}",
                humantime::format_duration(timeout)
            ),
        )),
        Ok(Err(error)) => Err(Error::connection(host, error)),
        Ok(Ok((_, None))) => Err(Error::connection(
            host,
            anyhow::anyhow!("channel for `{command}` closed without an exit status"),
        )),
        Ok(Ok((mut output, Some(status)))) => {
            output.exit_status = status;
            tracing::trace!("`{command}` exited with {status}");
            Ok(output)
        }
    }
}

pub enum SshChannel {
    Sftp(SftpChannel),
    Scp(ScpChannel),
}

impl TransferChannel for SshChannel {
    async fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
        match self {
            Self::Sftp(c) => c.metadata(path).await,
            Self::Scp(c) => c.metadata(path).await,
        }
    }
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        match self {
            Self::Sftp(c) => c.read_dir(path).await,
            Self::Scp(c) => c.read_dir(path).await,
        }
    }
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        match self {
            Self::Sftp(c) => c.create_dir_all(path).await,
            Self::Scp(c) => c.create_dir_all(path).await,
        }
    }
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        match self {
            Self::Sftp(c) => c.download(remote, local, reporter).await,
            Self::Scp(c) => c.download(remote, local, reporter).await,
        }
    }
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        match self {
            Self::Sftp(c) => c.upload(local, remote, reporter).await,
            Self::Scp(c) => c.upload(local, remote, reporter).await,
        }
    }
    async fn remove_file(&self, path: &str) -> Result<()> {
        match self {
            Self::Sftp(c) => c.remove_file(path).await,
            Self::Scp(c) => c.remove_file(path).await,
        }
    }
    async fn close(&self) -> Result<()> {
        match self {
            Self::Sftp(c) => c.close().await,
            Self::Scp(c) => c.close().await,
        }
    }
}

pub struct SshSession {
    target: Target,
    handle: Arc<Handle<ClientHandler>>,
    channel: SshChannel,
    liveness: LivenessCell,
    timeouts: Timeouts,
}

impl Transport for SshSession {
    type Channel = SshChannel;

    fn target(&self) -> &Target {
        &self.target
    }
    fn channel(&self) -> &SshChannel {
        &self.channel
    }
    fn liveness(&self) -> Liveness {
        if self.handle.is_closed() {
            return Liveness::Dead;
        }
        self.liveness.get()
    }
    #[instrument(skip(self), fields(host = %self.target.host))]
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let result = run_command(
            &self.handle,
            &self.target.host,
            command,
            self.timeouts.command,
        )
        .await;
        if result.is_err() && self.handle.is_closed() {
            self.liveness.set(Liveness::Dead);
        }
        result
    }
    async fn is_alive(&self) -> bool {
        if self.handle.is_closed() {
            self.liveness.set(Liveness::Dead);
            return false;
        }
        let probe = run_command(
            &self.handle,
            &self.target.host,
            "echo ok",
            self.timeouts.probe,
        )
        .await;
        let alive = matches!(
            &probe,
            Ok(output) if output.success() && output.stdout_text().trim() == "ok"
        );
        if !alive {
            tracing::info!("liveness probe of {} failed: {:?}", self.target, probe.err());
        }
        self.liveness.set(if alive {
            Liveness::Alive
        } else {
            Liveness::Dead
        });
        alive
    }
    async fn close(&self) {
        if self.liveness.get() == Liveness::Dead && self.handle.is_closed() {
            return;
        }
        if let Err(error) = self.channel.close().await {
            tracing::debug!("closing transfer channel to {}: {error:#}", self.target);
        }
        if let Err(error) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
        {
            tracing::debug!("disconnecting from {}: {error}", self.target);
        }
        self.liveness.set(Liveness::Dead);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SshOptions {
    pub channel: ChannelKind,
    pub host_key_policy: HostKeyPolicy,
    /// `None` uses `~/.ssh/known_hosts`
    pub known_hosts: Option<PathBuf>,
    pub timeouts: Timeouts,
}

/// Opens authenticated [`SshSession`]s.
///
/// Nothing is prompted for until the server answered the handshake. A password is remembered
/// as soon as it was typed in, so reconnects only ask for a new second-factor code; a rejected
/// password is forgotten. Second-factor codes are single use and asked for on every login.
pub struct SshConnector<P: Prompter = TtyPrompter> {
    credentials: Credentials,
    options: SshOptions,
    prompter: P,
    remembered_password: tokio::sync::Mutex<Option<Zeroizing<String>>>,
}

impl SshConnector<TtyPrompter> {
    pub fn new(credentials: Credentials, options: SshOptions) -> Self {
        Self::with_prompter(credentials, options, TtyPrompter)
    }
}

impl<P: Prompter> SshConnector<P> {
    pub fn with_prompter(credentials: Credentials, options: SshOptions, prompter: P) -> Self {
        let remembered_password = tokio::sync::Mutex::new(credentials.password.clone());
        Self {
            credentials,
            options,
            prompter,
            remembered_password,
        }
    }
    /// Secrets for one login attempt; a typed password is remembered right away.
    fn resolve_secrets(
        &self,
        target: &Target,
        remembered: &mut Option<Zeroizing<String>>,
    ) -> Result<Secrets> {
        let secrets = Secrets::resolve(
            target,
            remembered.clone(),
            &self.credentials.second_factor,
            &self.prompter,
        )?;
        *remembered = Some(secrets.password.clone());
        Ok(secrets)
    }
    fn forget_password(remembered: &mut Option<Zeroizing<String>>) {
        *remembered = None;
    }
    async fn handshake(&self, target: &Target) -> Result<Handle<ClientHandler>> {
        let config = Arc::new(russh::client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            policy: self.options.host_key_policy,
            known_hosts: self.options.known_hosts.clone(),
        };
        let connect = russh::client::connect(config, (target.host.as_str(), target.port), handler);
        match tokio::time::timeout(self.options.timeouts.connect, connect).await {
            Err(_) => Err(Error::connection(
                target.host.clone(),
                anyhow::anyhow!(
                    "no SSH handshake within {}",
                    humantime::format_duration(self.options.timeouts.connect)
                ),
            )),
            Ok(Err(russh::Error::UnknownKey)) => Err(Error::Authentication {
                user: target.user.clone(),
                host: target.host.clone(),
                reason: format!(
                    "host key verification failed (policy {})",
                    self.options.host_key_policy
                ),
            }),
            Ok(Err(error)) => Err(Error::connection(target.host.clone(), error)),
            Ok(Ok(handle)) => Ok(handle),
        }
    }
}

impl<P: Prompter> Connector for SshConnector<P> {
    type Session = SshSession;

    #[instrument(skip(self), fields(target = %target))]
    async fn connect(&self, target: &Target) -> Result<SshSession> {
        let mut handle = self.handshake(target).await?;
        let mut remembered = self.remembered_password.lock().await;
        let result = crate::auth::authenticate(
            &mut handle,
            target,
            &self.credentials,
            &mut || self.resolve_secrets(target, &mut remembered),
            &self.prompter,
        )
        .await;
        if let Err(error) = result {
            if matches!(error, Error::Authentication { .. }) {
                Self::forget_password(&mut remembered);
            }
            if let Err(close_error) = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await
            {
                tracing::debug!("disconnect after failed login: {close_error}");
            }
            return Err(error);
        }
        drop(remembered);
        let handle = Arc::new(handle);
        let channel = match self.options.channel {
            ChannelKind::Sftp => SshChannel::Sftp(
                SftpChannel::open(handle.clone(), &target.host, self.options.timeouts.io).await?,
            ),
            ChannelKind::Scp => SshChannel::Scp(ScpChannel::new(
                handle.clone(),
                &target.host,
                self.options.timeouts,
            )),
        };
        tracing::info!("connected to {target} using {}", self.options.channel);
        Ok(SshSession {
            target: target.clone(),
            handle,
            channel,
            liveness: LivenessCell::new(Liveness::Alive),
            timeouts: self.options.timeouts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SecondFactor;
    use crate::auth::tests::StaticPrompter;
    use crate::cache::{RetryPolicy, SessionCache};
    use russh::client::Handler as _;
    use tracing_test::traced_test;

    fn host_key(base64: &str) -> russh::keys::PublicKey {
        russh::keys::parse_public_key_base64(base64).unwrap()
    }

    fn handler(policy: HostKeyPolicy, known_hosts: &std::path::Path) -> ClientHandler {
        ClientHandler {
            host: "login.cluster.example".to_string(),
            port: 22,
            policy,
            known_hosts: Some(known_hosts.to_path_buf()),
        }
    }

    const FIRST_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIBERERERERERERERERERERERERERERERERERERERERER";
    const OTHER_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAICIiIiIiIiIiIiIiIiIiIiIiIiIiIiIiIiIiIiIiIiIi";

    #[tokio::test]
    #[traced_test]
    async fn accept_new_records_the_key_and_strict_then_trusts_it() {
        let tmp = tempfile::tempdir().unwrap();
        let known_hosts = tmp.path().join("ssh").join("known_hosts");
        let key = host_key(FIRST_KEY);
        assert!(
            !handler(HostKeyPolicy::Strict, &known_hosts)
                .check_server_key(&key)
                .await
                .unwrap()
        );
        assert!(
            handler(HostKeyPolicy::AcceptNew, &known_hosts)
                .check_server_key(&key)
                .await
                .unwrap()
        );
        assert!(logs_contain("adding host key for login.cluster.example:22"));
        let recorded = std::fs::read_to_string(&known_hosts).unwrap();
        assert!(recorded.contains(FIRST_KEY), "{recorded}");
        let mut strict = handler(HostKeyPolicy::Strict, &known_hosts);
        assert!(strict.check_known(&key).unwrap());
        assert!(strict.check_server_key(&key).await.unwrap());
    }
    #[tokio::test]
    #[traced_test]
    async fn changed_key_is_rejected_even_when_accepting_new_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let known_hosts = tmp.path().join("known_hosts");
        handler(HostKeyPolicy::AcceptNew, &known_hosts)
            .learn(&host_key(FIRST_KEY))
            .unwrap();
        assert!(
            !handler(HostKeyPolicy::AcceptNew, &known_hosts)
                .check_server_key(&host_key(OTHER_KEY))
                .await
                .unwrap()
        );
        assert!(logs_contain("host key verification for login.cluster.example:22 failed"));
        assert!(
            handler(HostKeyPolicy::AcceptAny, &known_hosts)
                .check_server_key(&host_key(OTHER_KEY))
                .await
                .unwrap()
        );
    }

    #[test]
    fn policies_parse_from_cli_strings() {
        assert_eq!("strict".parse::<HostKeyPolicy>().unwrap(), HostKeyPolicy::Strict);
        assert_eq!(
            "accept-new".parse::<HostKeyPolicy>().unwrap(),
            HostKeyPolicy::AcceptNew
        );
        assert_eq!("no".parse::<HostKeyPolicy>().unwrap(), HostKeyPolicy::AcceptAny);
        assert!("maybe".parse::<HostKeyPolicy>().is_err());
        assert_eq!(HostKeyPolicy::default().to_string(), "accept-new");
    }
    #[test]
    fn channel_kind_parses_case_insensitively() {
        assert_eq!("SFTP".parse::<ChannelKind>().unwrap(), ChannelKind::Sftp);
        assert_eq!("scp".parse::<ChannelKind>().unwrap(), ChannelKind::Scp);
        assert!("rsync".parse::<ChannelKind>().is_err());
    }
    #[tokio::test]
    async fn unreachable_host_is_a_connection_error() {
        let options = SshOptions {
            timeouts: Timeouts {
                connect: Duration::from_secs(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let credentials = Credentials {
            user: "alice".to_string(),
            password: Some(Zeroizing::new("unused".to_string())),
            ..Default::default()
        };
        let connector = SshConnector::new(credentials, options);
        // port 1 on localhost refuses connections
        let target = Target::new("alice", "127.0.0.1").with_port(1);
        match connector.connect(&target).await {
            Err(error) => assert!(error.is_retryable(), "{error:?}"),
            Ok(_) => panic!("connecting to a closed port succeeded"),
        }
    }
    fn prompting_connector() -> SshConnector<StaticPrompter> {
        let credentials = Credentials {
            user: "alice".to_string(),
            second_factor: SecondFactor::Prompt,
            ..Default::default()
        };
        let options = SshOptions {
            timeouts: Timeouts {
                connect: Duration::from_secs(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let prompter = StaticPrompter {
            password: Some("hunter2"),
            code: Some("123456"),
            ..Default::default()
        };
        SshConnector::with_prompter(credentials, options, prompter)
    }
    #[test]
    fn typed_password_is_reused_until_rejected() {
        let connector = prompting_connector();
        let target = Target::new("alice", "login01");
        let mut remembered = None;
        let first = connector.resolve_secrets(&target, &mut remembered).unwrap();
        let second = connector.resolve_secrets(&target, &mut remembered).unwrap();
        assert_eq!(first.password.as_str(), "hunter2");
        assert_eq!(second.password.as_str(), "hunter2");
        // one password, then one code per attempt
        assert_eq!(connector.prompter.asked.get(), 3);
        SshConnector::<StaticPrompter>::forget_password(&mut remembered);
        connector.resolve_secrets(&target, &mut remembered).unwrap();
        assert_eq!(connector.prompter.asked.get(), 5);
    }
    #[tokio::test]
    #[traced_test]
    async fn retried_connection_failures_never_prompt() {
        let cache = SessionCache::with_retry_policy(
            prompting_connector(),
            RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(10),
            },
        );
        let target = Target::new("alice", "127.0.0.1").with_port(1);
        match cache.acquire(&target).await {
            Err(error) => assert!(matches!(error, Error::Connection { .. }), "{error:?}"),
            Ok(_) => panic!("connecting to a closed port succeeded"),
        }
        assert!(logs_contain("connection attempt 2/3"));
        assert_eq!(cache.connector().prompter.asked.get(), 0);
    }
}
