//! Child process execution.
//!
//! Spawns, observes, signals, and reaps the wrapped command. Termination is
//! graceful-then-forceful: SIGTERM to the process group (or leader), a grace
//! period, then SIGKILL.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;

use crate::config::{ProcessSettings, ShellMode};
use crate::error::{Error, Result};

/// Shells recognized when stripping wrapper commands.
const SHELL_NAMES: [&str; 7] = ["sh", "bash", "csh", "zsh", "ash", "dash", "fish"];

/// The command in its final, runnable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCommand {
    /// Run through `/bin/sh -c`
    Shell(String),
    /// Exec the binary directly
    Argv(Vec<String>),
}

/// Split a command line into tokens, honouring single/double quotes and
/// backslash escapes.
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => {
                if c == '"' {
                    quote = None;
                } else if c == '\\' {
                    match chars.next() {
                        Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                        Some(other) => {
                            current.push('\\');
                            current.push(other);
                        }
                        None => current.push('\\'),
                    }
                } else {
                    current.push(c);
                }
            }
            _ => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_token = true;
                } else if c == '\\' {
                    match chars.next() {
                        Some(escaped) => {
                            current.push(escaped);
                            in_token = true;
                        }
                        None => {
                            return Err(Error::Configuration(
                                "command line ends with a dangling backslash".to_string(),
                            ))
                        }
                    }
                } else if c.is_whitespace() {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                } else {
                    current.push(c);
                    in_token = true;
                }
            }
        }
    }

    if quote.is_some() {
        return Err(Error::Configuration(
            "command line has an unterminated quote".to_string(),
        ));
    }
    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Whether running the line directly would lose shell semantics.
fn has_shell_meta_characters(line: &str) -> bool {
    line.chars()
        .any(|c| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '/' | '.' | ' ')))
}

/// A `["/bin/sh", "-c", "<expr>"]` shape, for any recognized shell.
fn shell_wrapped_expression(tokens: &[String]) -> Option<String> {
    if tokens.len() != 3 || tokens[1] != "-c" {
        return None;
    }
    let basename = tokens[0].rsplit('/').next().unwrap_or(&tokens[0]);
    if SHELL_NAMES.contains(&basename) {
        Some(tokens[2].clone())
    } else {
        None
    }
}

/// Resolve the configured command into its runnable form.
///
/// Wrapper shells (`/bin/sh -c "…"`) are stripped repeatedly when enabled;
/// `auto` mode then uses a shell only when the line still carries shell
/// meta-characters.
pub fn resolve_command(settings: &ProcessSettings) -> Result<ResolvedCommand> {
    let mut line = match (&settings.command_line, settings.command.is_empty()) {
        (Some(line), _) => line.clone(),
        (None, false) => settings.command.join(" "),
        (None, true) => {
            return Err(Error::Configuration("no command configured".to_string()));
        }
    };

    let mut found_wrapping = false;
    if settings.strip_shell_wrapping {
        loop {
            let tokens = split_command_line(&line)?;
            match shell_wrapped_expression(&tokens) {
                Some(inner) => {
                    info!("Stripped shell wrapping from '{line}' to '{inner}'");
                    line = inner;
                    found_wrapping = true;
                }
                None => break,
            }
        }
    }

    let use_shell = match settings.shell_mode {
        ShellMode::Enable => true,
        ShellMode::Disable => false,
        ShellMode::Auto => found_wrapping || has_shell_meta_characters(&line),
    };

    if use_shell {
        Ok(ResolvedCommand::Shell(line))
    } else {
        let argv = split_command_line(&line)?;
        if argv.is_empty() {
            return Err(Error::Configuration("command is empty".to_string()));
        }
        Ok(ResolvedCommand::Argv(argv))
    }
}

/// Outcome of waiting on a child with a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    TimedOut,
}

/// A spawned child and the signaling mode it was started with.
pub struct ChildHandle {
    child: Child,
    pid: u32,
    group_termination: bool,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the piped stdout, if capture was requested.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Non-blocking check for an exit status.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    /// Wait for exit, up to `deadline`.
    pub async fn wait(&mut self, deadline: Duration) -> Result<WaitOutcome> {
        match timeout(deadline, self.child.wait()).await {
            Ok(status) => Ok(WaitOutcome::Exited(status?.code().unwrap_or(-1))),
            Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }

    /// Wait for exit with no deadline.
    pub async fn wait_forever(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Send a signal to the child's process group, or to the leader when
    /// group termination is disabled.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self.pid as i32;
        let result = if self.group_termination {
            killpg(Pid::from_raw(pid), signal)
        } else {
            kill(Pid::from_raw(pid), signal)
        };
        result.map_err(|e| Error::Internal(format!("signal {signal} to {pid} failed: {e}")))
    }

    /// SIGKILL without ceremony.
    pub async fn force_kill(&mut self) {
        if self.signal(Signal::SIGKILL).is_err() {
            // Fall back to killing the leader directly
            let _ = self.child.kill().await;
        }
        let _ = self.child.wait().await;
    }
}

/// Spawns and terminates child processes per the configured settings.
pub struct ProcessExecutor {
    settings: ProcessSettings,
    capture_output: bool,
}

impl ProcessExecutor {
    pub fn new(settings: ProcessSettings, capture_output: bool) -> Self {
        Self {
            settings,
            capture_output,
        }
    }

    /// Spawn the configured command with the given environment.
    pub fn spawn(&self, env: &HashMap<String, String>) -> Result<ChildHandle> {
        let resolved = resolve_command(&self.settings)?;
        debug!("Resolved command: {:?}", resolved);

        let mut cmd = match &resolved {
            ResolvedCommand::Shell(line) => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            ResolvedCommand::Argv(argv) => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
        };

        cmd.current_dir(&self.settings.work_dir);
        cmd.env_clear();
        cmd.envs(env);
        cmd.stdin(Stdio::null());

        if self.capture_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }

        if self.settings.process_group_termination {
            // New process group so signals reach every descendant
            cmd.process_group(0);
        }

        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| Error::Spawn(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("child exited before a pid was assigned".to_string()))?;

        info!("Spawned child process with pid {pid}");

        Ok(ChildHandle {
            child,
            pid,
            group_termination: self.settings.process_group_termination,
        })
    }

    /// Graceful-then-forceful termination. Returns the exit code when the
    /// child was already done, None when it had to be killed. Triggering
    /// `hurry` skips the remaining grace period.
    pub async fn terminate(
        &self,
        handle: &mut ChildHandle,
        hurry: Option<&tokio_util::sync::CancellationToken>,
    ) -> Result<Option<i32>> {
        if let Some(code) = handle.try_wait()? {
            info!("Child already exited with code {code}, not terminating");
            return Ok(Some(code));
        }

        warn!("Sending terminate signal to pid {}", handle.pid());
        if let Err(e) = handle.signal(Signal::SIGTERM) {
            warn!("{e}");
        }

        let grace = Duration::from_secs(self.settings.termination_grace_period);

        let outcome = match hurry {
            Some(hurry) => {
                tokio::select! {
                    _ = hurry.cancelled() => {
                        warn!("Hurried termination, skipping the grace period");
                        WaitOutcome::TimedOut
                    }
                    outcome = handle.wait(grace) => outcome?,
                }
            }
            None => handle.wait(grace).await?,
        };

        match outcome {
            WaitOutcome::Exited(code) => {
                info!("Child terminated after signal with code {code}");
                Ok(Some(code))
            }
            WaitOutcome::TimedOut => {
                warn!("Grace period expired, killing pid {}", handle.pid());
                handle.force_kill().await;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_command(parts: &[&str]) -> ProcessSettings {
        ProcessSettings {
            command: parts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_command_line() {
        assert_eq!(
            split_command_line("echo hello world").unwrap(),
            vec!["echo", "hello", "world"]
        );
        assert_eq!(
            split_command_line("sh -c 'echo hi'").unwrap(),
            vec!["sh", "-c", "echo hi"]
        );
        assert_eq!(
            split_command_line("printf \"a b\" c").unwrap(),
            vec!["printf", "a b", "c"]
        );
        assert!(split_command_line("echo 'unterminated").is_err());
    }

    #[test]
    fn test_auto_mode_plain_command_execs_directly() {
        let settings = settings_with_command(&["/bin/echo", "hello"]);
        assert_eq!(
            resolve_command(&settings).unwrap(),
            ResolvedCommand::Argv(vec!["/bin/echo".to_string(), "hello".to_string()])
        );
    }

    #[test]
    fn test_auto_mode_meta_characters_use_shell() {
        let settings = ProcessSettings {
            command_line: Some("echo $HOME | wc -c".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_command(&settings).unwrap(),
            ResolvedCommand::Shell("echo $HOME | wc -c".to_string())
        );
    }

    #[test]
    fn test_shell_wrapping_stripped() {
        let settings = ProcessSettings {
            command_line: Some("/bin/sh -c 'echo hi'".to_string()),
            ..Default::default()
        };
        // The wrapper is stripped and the inner expression runs via shell
        assert_eq!(
            resolve_command(&settings).unwrap(),
            ResolvedCommand::Shell("echo hi".to_string())
        );
    }

    #[test]
    fn test_nested_shell_wrapping_stripped() {
        let settings = ProcessSettings {
            command_line: Some("/bin/bash -c \"sh -c 'echo deep'\"".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_command(&settings).unwrap(),
            ResolvedCommand::Shell("echo deep".to_string())
        );
    }

    #[test]
    fn test_wrapping_kept_when_stripping_disabled() {
        let settings = ProcessSettings {
            command_line: Some("/bin/sh -c 'echo hi'".to_string()),
            strip_shell_wrapping: false,
            ..Default::default()
        };
        match resolve_command(&settings).unwrap() {
            ResolvedCommand::Shell(line) => assert!(line.starts_with("/bin/sh")),
            other => panic!("expected shell command, got {other:?}"),
        }
    }

    #[test]
    fn test_forced_shell_modes() {
        let mut settings = settings_with_command(&["/bin/echo", "hi"]);
        settings.shell_mode = ShellMode::Enable;
        assert!(matches!(
            resolve_command(&settings).unwrap(),
            ResolvedCommand::Shell(_)
        ));

        let mut settings = ProcessSettings {
            command_line: Some("echo hi && echo bye".to_string()),
            ..Default::default()
        };
        settings.shell_mode = ShellMode::Disable;
        assert!(matches!(
            resolve_command(&settings).unwrap(),
            ResolvedCommand::Argv(_)
        ));
    }

    #[test]
    fn test_missing_command_is_error() {
        let settings = ProcessSettings::default();
        assert!(resolve_command(&settings).is_err());
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let executor = ProcessExecutor::new(settings_with_command(&["/bin/true"]), false);
        let mut handle = executor.spawn(&HashMap::new()).unwrap();
        let outcome = handle.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let executor =
            ProcessExecutor::new(settings_with_command(&["/no/such/binary-anywhere"]), false);
        assert!(executor.spawn(&HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_child_env_is_exactly_what_was_passed() {
        let mut settings = ProcessSettings {
            command_line: Some("test \"$ONLY_VAR\" = set -a -z \"$HOME\"".to_string()),
            ..Default::default()
        };
        settings.shell_mode = ShellMode::Enable;
        let executor = ProcessExecutor::new(settings, false);

        let mut env = HashMap::new();
        env.insert("ONLY_VAR".to_string(), "set".to_string());
        let mut handle = executor.spawn(&env).unwrap();
        let outcome = handle.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_terminate_protocol_kills_sleeper() {
        let settings = ProcessSettings {
            command: vec!["/bin/sleep".to_string(), "30".to_string()],
            termination_grace_period: 1,
            ..Default::default()
        };
        let executor = ProcessExecutor::new(settings, false);
        let mut handle = executor.spawn(&HashMap::new()).unwrap();

        let started = std::time::Instant::now();
        let code = executor.terminate(&mut handle, None).await.unwrap();
        // sleep exits on SIGTERM, so the grace period is not fully consumed
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(code.is_none() || code != Some(0));
    }

    #[tokio::test]
    async fn test_wait_deadline() {
        let executor = ProcessExecutor::new(
            settings_with_command(&["/bin/sleep", "10"]),
            false,
        );
        let mut handle = executor.spawn(&HashMap::new()).unwrap();
        let outcome = handle.wait(Duration::from_millis(200)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        handle.force_kill().await;
    }
}
