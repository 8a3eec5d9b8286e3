//! Logging in to the cluster
//!
//! Methods are tried in this order until one succeeds:
//!
//! 1. public key from the configured identity file
//! 2. password with the second-factor code appended (`password + code`), for servers that take
//!    both in a single password field; skipped when no second factor is configured
//! 3. the password alone
//! 4. keyboard-interactive: prompts mentioning a password get the password, every other prompt
//!    gets a fresh second-factor code. This also completes a login where the password was
//!    accepted as a partial success.
//!
//! Missing secrets come from a [`Prompter`]. Nothing secret is ever logged or shown by `Debug`.

use crate::{Error, Result, Target};
use russh::client::{AuthResult, Handle, Handler, KeyboardInteractiveAuthResponse};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;
use zeroize::Zeroizing;

/// Servers that keep asking are cut off after this many keyboard-interactive rounds.
const MAX_INTERACTIVE_ROUNDS: usize = 5;

#[derive(Clone, Default)]
pub enum SecondFactor {
    /// password alone is enough
    #[default]
    None,
    /// ask for a code every time one is needed
    Prompt,
    /// use this code (e.g. from the environment)
    Code(Zeroizing<String>),
}

impl std::fmt::Debug for SecondFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecondFactor::None => write!(f, "None"),
            SecondFactor::Prompt => write!(f, "Prompt"),
            SecondFactor::Code(_) => write!(f, "Code(<redacted>)"),
        }
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: Option<Zeroizing<String>>,
    pub second_factor: SecondFactor,
    pub identity_file: Option<PathBuf>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("second_factor", &self.second_factor)
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// Source of secrets that were not supplied up front.
pub trait Prompter {
    fn password(&self, target: &Target) -> anyhow::Result<Zeroizing<String>>;
    fn second_factor(&self, target: &Target) -> anyhow::Result<Zeroizing<String>>;
}

/// Reads secrets from the controlling terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TtyPrompter;

impl Prompter for TtyPrompter {
    fn password(&self, target: &Target) -> anyhow::Result<Zeroizing<String>> {
        let prompt = format!("Password for {}@{}: ", target.user, target.host);
        Ok(Zeroizing::new(rpassword::prompt_password(prompt)?))
    }
    fn second_factor(&self, target: &Target) -> anyhow::Result<Zeroizing<String>> {
        let prompt = format!("Second-factor code for {}@{}: ", target.user, target.host);
        Ok(Zeroizing::new(rpassword::prompt_password(prompt)?))
    }
}

/// Secrets needed for one login attempt. They are resolved only once the server answered the
/// handshake and rejected any public key.
pub(crate) struct Secrets {
    pub password: Zeroizing<String>,
    pub code: Option<Zeroizing<String>>,
}

impl Secrets {
    pub(crate) fn resolve(
        target: &Target,
        password: Option<Zeroizing<String>>,
        second_factor: &SecondFactor,
        prompter: &dyn Prompter,
    ) -> Result<Self> {
        let prompt_failed = |error: anyhow::Error| Error::Authentication {
            user: target.user.clone(),
            host: target.host.clone(),
            reason: format!("could not read credentials: {error:#}"),
        };
        let password = match password {
            Some(password) => password,
            None => prompter.password(target).map_err(prompt_failed)?,
        };
        let code = match second_factor {
            SecondFactor::None => None,
            SecondFactor::Code(code) => Some(code.clone()),
            SecondFactor::Prompt => Some(prompter.second_factor(target).map_err(prompt_failed)?),
        };
        Ok(Self { password, code })
    }
    /// Password with the second-factor code appended, as expected by servers that take both
    /// in a single password field.
    pub(crate) fn combined(&self) -> Zeroizing<String> {
        let mut combined = Zeroizing::new(String::with_capacity(
            self.password.len() + self.code.as_ref().map_or(0, |c| c.len()),
        ));
        combined.push_str(&self.password);
        if let Some(code) = &self.code {
            combined.push_str(code);
        }
        combined
    }
}

/// Picks answers for one keyboard-interactive round. Codes are single use, so a fresh one is
/// requested from `fresh_code` the first time a non-password prompt shows up.
pub(crate) fn answer_prompts(
    prompts: &[String],
    password: &str,
    fresh_code: &mut dyn FnMut() -> anyhow::Result<Zeroizing<String>>,
) -> anyhow::Result<Vec<String>> {
    let mut code_slot: Option<Zeroizing<String>> = None;
    let mut answers = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        if prompt.to_lowercase().contains("password") {
            answers.push(password.to_string());
        } else {
            let code = match code_slot.take() {
                Some(code) => code,
                None => fresh_code()?,
            };
            answers.push(code.to_string());
            code_slot = Some(code);
        }
    }
    Ok(answers)
}

fn auth_error(target: &Target, reason: impl Into<String>) -> Error {
    Error::Authentication {
        user: target.user.clone(),
        host: target.host.clone(),
        reason: reason.into(),
    }
}

fn protocol_error(target: &Target, error: russh::Error) -> Error {
    Error::connection(target.host.clone(), error)
}

/// Answer of the server to one authentication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    /// accepted, but another method has to follow
    Partial,
    Failure,
}

impl From<AuthResult> for Outcome {
    fn from(result: AuthResult) -> Self {
        match result {
            AuthResult::Success => Outcome::Success,
            AuthResult::Failure {
                partial_success: true,
                ..
            } => Outcome::Partial,
            AuthResult::Failure { .. } => Outcome::Failure,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Interactive {
    Done(Outcome),
    Prompts(Vec<String>),
}

impl From<KeyboardInteractiveAuthResponse> for Interactive {
    fn from(response: KeyboardInteractiveAuthResponse) -> Self {
        match response {
            KeyboardInteractiveAuthResponse::Success => Interactive::Done(Outcome::Success),
            KeyboardInteractiveAuthResponse::Failure { .. } => Interactive::Done(Outcome::Failure),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                Interactive::Prompts(prompts.into_iter().map(|p| p.prompt).collect())
            }
        }
    }
}

/// The authentication requests a login needs from an SSH connection.
#[allow(async_fn_in_trait)]
pub(crate) trait LoginChannel {
    async fn publickey(
        &mut self,
        user: &str,
        identity_file: &Path,
    ) -> std::result::Result<Outcome, russh::Error>;
    async fn password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Outcome, russh::Error>;
    async fn interactive_start(
        &mut self,
        user: &str,
    ) -> std::result::Result<Interactive, russh::Error>;
    async fn interactive_respond(
        &mut self,
        answers: Vec<String>,
    ) -> std::result::Result<Interactive, russh::Error>;
}

impl<H: Handler> LoginChannel for Handle<H> {
    async fn publickey(
        &mut self,
        user: &str,
        identity_file: &Path,
    ) -> std::result::Result<Outcome, russh::Error> {
        let key = match russh::keys::load_secret_key(identity_file, None) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(
                    "cannot use identity file {:?}: {error}; falling back to password",
                    identity_file
                );
                return Ok(Outcome::Failure);
            }
        };
        let hash = self.best_supported_rsa_hash().await?.flatten();
        let result = self
            .authenticate_publickey(
                user,
                russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash),
            )
            .await?;
        Ok(result.into())
    }
    async fn password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Outcome, russh::Error> {
        Ok(self.authenticate_password(user, password).await?.into())
    }
    async fn interactive_start(
        &mut self,
        user: &str,
    ) -> std::result::Result<Interactive, russh::Error> {
        Ok(self
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?
            .into())
    }
    async fn interactive_respond(
        &mut self,
        answers: Vec<String>,
    ) -> std::result::Result<Interactive, russh::Error> {
        Ok(self
            .authenticate_keyboard_interactive_respond(answers)
            .await?
            .into())
    }
}

async fn try_keyboard_interactive<L: LoginChannel>(
    login: &mut L,
    target: &Target,
    secrets: &Secrets,
    second_factor: &SecondFactor,
    prompter: &dyn Prompter,
) -> Result<bool> {
    let mut response = login
        .interactive_start(&target.user)
        .await
        .map_err(|e| protocol_error(target, e))?;
    for _ in 0..MAX_INTERACTIVE_ROUNDS {
        let prompts = match response {
            Interactive::Done(outcome) => return Ok(outcome == Outcome::Success),
            Interactive::Prompts(prompts) => prompts,
        };
        tracing::debug!("keyboard-interactive round with {} prompt(s)", prompts.len());
        let mut fresh_code = || match second_factor {
            SecondFactor::Code(code) => Ok(code.clone()),
            _ => prompter.second_factor(target),
        };
        let answers = answer_prompts(&prompts, &secrets.password, &mut fresh_code)
            .map_err(|e| auth_error(target, format!("could not read credentials: {e:#}")))?;
        response = login
            .interactive_respond(answers)
            .await
            .map_err(|e| protocol_error(target, e))?;
    }
    Ok(false)
}

/// Runs the login sequence on a freshly handshaken connection.
///
/// `resolve` is called at most once, after the public key (if any) was rejected.
#[instrument(skip_all, fields(target = %target))]
pub(crate) async fn authenticate<L: LoginChannel>(
    login: &mut L,
    target: &Target,
    credentials: &Credentials,
    resolve: &mut dyn FnMut() -> Result<Secrets>,
    prompter: &dyn Prompter,
) -> Result<()> {
    if let Some(identity_file) = &credentials.identity_file {
        let outcome = login
            .publickey(&target.user, identity_file)
            .await
            .map_err(|e| protocol_error(target, e))?;
        if outcome == Outcome::Success {
            tracing::info!("authenticated with public key");
            return Ok(());
        }
        tracing::debug!("public key rejected");
    }
    let secrets = resolve()?;
    let mut password_accepted = false;
    if secrets.code.is_some() {
        let combined = secrets.combined();
        match login
            .password(&target.user, combined.as_str())
            .await
            .map_err(|e| protocol_error(target, e))?
        {
            Outcome::Success => {
                tracing::info!("authenticated with password and second-factor code");
                return Ok(());
            }
            Outcome::Partial => password_accepted = true,
            Outcome::Failure => {
                tracing::info!("combined password and code rejected, trying the password alone")
            }
        }
    }
    if !password_accepted {
        match login
            .password(&target.user, secrets.password.as_str())
            .await
            .map_err(|e| protocol_error(target, e))?
        {
            Outcome::Success => {
                tracing::info!("authenticated with password");
                return Ok(());
            }
            Outcome::Partial => tracing::info!("password accepted, second factor required"),
            Outcome::Failure => {
                tracing::info!("password login rejected, trying keyboard-interactive")
            }
        }
    }
    if try_keyboard_interactive(login, target, &secrets, &credentials.second_factor, prompter)
        .await?
    {
        tracing::info!("authenticated with keyboard-interactive");
        return Ok(());
    }
    Err(auth_error(target, "all authentication methods were rejected"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use tracing_test::traced_test;

    /// Hands out fixed secrets and counts how often it was asked.
    #[derive(Default)]
    pub(crate) struct StaticPrompter {
        pub password: Option<&'static str>,
        pub code: Option<&'static str>,
        pub asked: Cell<usize>,
    }

    impl Prompter for StaticPrompter {
        fn password(&self, _target: &Target) -> anyhow::Result<Zeroizing<String>> {
            self.asked.set(self.asked.get() + 1);
            self.password
                .map(|p| Zeroizing::new(p.to_string()))
                .ok_or_else(|| anyhow::anyhow!("no terminal"))
        }
        fn second_factor(&self, _target: &Target) -> anyhow::Result<Zeroizing<String>> {
            self.asked.set(self.asked.get() + 1);
            self.code
                .map(|c| Zeroizing::new(c.to_string()))
                .ok_or_else(|| anyhow::anyhow!("no terminal"))
        }
    }

    fn target() -> Target {
        Target::new("alice", "login01")
    }

    #[test]
    fn resolve_prompts_only_for_missing_secrets() {
        let prompter = StaticPrompter {
            password: Some("hunter2"),
            code: Some("123456"),
            ..Default::default()
        };
        let secrets = Secrets::resolve(
            &target(),
            Some(Zeroizing::new("given".to_string())),
            &SecondFactor::None,
            &prompter,
        )
        .unwrap();
        assert_eq!(prompter.asked.get(), 0);
        assert_eq!(secrets.combined().as_str(), "given");
        let secrets =
            Secrets::resolve(&target(), None, &SecondFactor::Prompt, &prompter).unwrap();
        assert_eq!(prompter.asked.get(), 2);
        assert_eq!(secrets.combined().as_str(), "hunter2123456");
    }
    #[test]
    fn resolve_fails_as_authentication_error() {
        let prompter = StaticPrompter::default();
        match Secrets::resolve(&target(), None, &SecondFactor::None, &prompter) {
            Err(Error::Authentication { user, reason, .. }) => {
                assert_eq!(user, "alice");
                assert!(reason.contains("no terminal"), "{reason}");
            }
            other => panic!("expected Authentication, got {:?}", other.err()),
        }
    }
    #[test]
    fn interactive_prompts_get_password_or_one_fresh_code() {
        let mut fetched = 0;
        let mut fresh_code = || {
            fetched += 1;
            Ok::<_, anyhow::Error>(Zeroizing::new("654321".to_string()))
        };
        let prompts = vec![
            "Password: ".to_string(),
            "Verification code: ".to_string(),
            "Duo passcode: ".to_string(),
        ];
        let answers = answer_prompts(&prompts, "hunter2", &mut fresh_code).unwrap();
        assert_eq!(answers, vec!["hunter2", "654321", "654321"]);
        assert_eq!(fetched, 1);
    }
    #[test]
    fn debug_output_hides_secrets() {
        let credentials = Credentials {
            user: "alice".to_string(),
            password: Some(Zeroizing::new("hunter2".to_string())),
            second_factor: SecondFactor::Code(Zeroizing::new("123456".to_string())),
            identity_file: None,
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("123456"));
        assert!(rendered.contains("alice"));
    }

    /// Server side of a login: accepts the listed passwords and plays back interactive rounds.
    #[derive(Default)]
    struct ScriptedLogin {
        passwords: Vec<(&'static str, Outcome)>,
        rounds: VecDeque<Interactive>,
        calls: Vec<String>,
    }

    impl ScriptedLogin {
        fn next_round(&mut self) -> Interactive {
            self.rounds
                .pop_front()
                .unwrap_or(Interactive::Done(Outcome::Failure))
        }
    }

    impl LoginChannel for ScriptedLogin {
        async fn publickey(
            &mut self,
            _user: &str,
            _identity_file: &Path,
        ) -> std::result::Result<Outcome, russh::Error> {
            self.calls.push("publickey".to_string());
            Ok(Outcome::Failure)
        }
        async fn password(
            &mut self,
            _user: &str,
            password: &str,
        ) -> std::result::Result<Outcome, russh::Error> {
            self.calls.push(format!("password {password}"));
            Ok(self
                .passwords
                .iter()
                .find(|(accepted, _)| *accepted == password)
                .map_or(Outcome::Failure, |(_, outcome)| *outcome))
        }
        async fn interactive_start(
            &mut self,
            _user: &str,
        ) -> std::result::Result<Interactive, russh::Error> {
            self.calls.push("interactive".to_string());
            Ok(self.next_round())
        }
        async fn interactive_respond(
            &mut self,
            answers: Vec<String>,
        ) -> std::result::Result<Interactive, russh::Error> {
            self.calls.push(format!("answer {}", answers.join(",")));
            Ok(self.next_round())
        }
    }

    fn prompter() -> StaticPrompter {
        StaticPrompter {
            password: Some("hunter2"),
            code: Some("123456"),
            ..Default::default()
        }
    }

    async fn login(
        server: &mut ScriptedLogin,
        credentials: &Credentials,
        prompter: &StaticPrompter,
    ) -> Result<()> {
        let mut resolve = || {
            Secrets::resolve(&target(), None, &credentials.second_factor, prompter)
        };
        authenticate(server, &target(), credentials, &mut resolve, prompter).await
    }

    fn with_second_factor() -> Credentials {
        Credentials {
            user: "alice".to_string(),
            second_factor: SecondFactor::Prompt,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn combined_password_is_tried_first() -> anyhow::Result<()> {
        let mut server = ScriptedLogin {
            passwords: vec![("hunter2123456", Outcome::Success)],
            ..Default::default()
        };
        let prompter = prompter();
        login(&mut server, &with_second_factor(), &prompter).await?;
        assert_eq!(server.calls, vec!["password hunter2123456"]);
        assert_eq!(prompter.asked.get(), 2);
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn partial_password_success_continues_with_keyboard_interactive() -> anyhow::Result<()>
    {
        let mut server = ScriptedLogin {
            passwords: vec![("hunter2", Outcome::Partial)],
            rounds: VecDeque::from([
                Interactive::Prompts(vec!["Verification code: ".to_string()]),
                Interactive::Done(Outcome::Success),
            ]),
            ..Default::default()
        };
        let prompter = prompter();
        login(&mut server, &with_second_factor(), &prompter).await?;
        assert_eq!(
            server.calls,
            vec![
                "password hunter2123456",
                "password hunter2",
                "interactive",
                "answer 123456",
            ]
        );
        // the first code was spent on the combined attempt
        assert_eq!(prompter.asked.get(), 3);
        assert!(logs_contain("password accepted, second factor required"));
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn rejected_password_falls_back_to_keyboard_interactive() -> anyhow::Result<()> {
        let mut server = ScriptedLogin {
            rounds: VecDeque::from([
                Interactive::Prompts(vec!["Password: ".to_string(), "Token: ".to_string()]),
                Interactive::Done(Outcome::Success),
            ]),
            ..Default::default()
        };
        let prompter = prompter();
        login(&mut server, &with_second_factor(), &prompter).await?;
        assert_eq!(server.calls.last().map(String::as_str), Some("answer hunter2,123456"));
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn identity_file_then_single_password_without_second_factor() -> anyhow::Result<()> {
        let mut server = ScriptedLogin {
            passwords: vec![("hunter2", Outcome::Success)],
            ..Default::default()
        };
        let credentials = Credentials {
            user: "alice".to_string(),
            identity_file: Some(PathBuf::from("/nonexistent/id_ed25519")),
            ..Default::default()
        };
        let prompter = prompter();
        login(&mut server, &credentials, &prompter).await?;
        assert_eq!(server.calls, vec!["publickey", "password hunter2"]);
        assert_eq!(prompter.asked.get(), 1);
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn everything_rejected_is_an_authentication_error() {
        let mut server = ScriptedLogin::default();
        let prompter = prompter();
        let error = login(&mut server, &with_second_factor(), &prompter)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Authentication { .. }), "{error:?}");
        assert_eq!(
            server.calls,
            vec!["password hunter2123456", "password hunter2", "interactive"]
        );
    }
}
