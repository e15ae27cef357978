//! Command execution on a node
//!
//! A node runs its shell commands either in-process (local host only) or
//! through a persistent OpenSSH master session. Both backends capture stdout
//! fully in memory and turn a non-zero exit into a node-scoped error carrying
//! the captured stderr.

use async_trait::async_trait;
use cxm_core::config::CxmConfig;
use cxm_core::config::SshConfig;
use cxm_core::error::{CxmError, CxmResult};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Message reported when the error stream of a failed remote command cannot
/// be read within the configured bound
pub const STDERR_TIMEOUT_MESSAGE: &str = "Timeout reading stderr !";

/// Captured standard output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    stdout: String,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
        }
    }

    fn from_bytes(stdout: &[u8]) -> Self {
        Self::new(String::from_utf8_lossy(stdout))
    }

    pub fn text(&self) -> &str {
        &self.stdout
    }

    pub fn lines(&self) -> std::str::Lines<'_> {
        self.stdout.lines()
    }

    /// Non-empty lines with surrounding whitespace removed
    pub fn trimmed_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|line| !line.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Local,
    Ssh,
}

/// Runs command lines against one node
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// Node this channel executes on
    fn hostname(&self) -> &str;

    fn transport(&self) -> Transport;

    /// Run `command` through a shell on the node and capture its output.
    ///
    /// Fails with [`CxmError::Shell`] (local) or [`CxmError::Ssh`] (remote)
    /// when the command exits non-zero.
    async fn run(&self, command: &str) -> CxmResult<CommandOutput>;

    /// Release the channel. Called once, when the node disconnects.
    async fn close(&self) -> CxmResult<()>;
}

/// Prepend the install path, when one is configured
pub fn prefix_command(install_path: Option<&Path>, command: &str) -> String {
    match install_path {
        Some(path) => format!("{}/{}", path.display(), command),
        None => command.to_string(),
    }
}

/// Open the channel matching the node's locality and the configuration.
///
/// The in-process backend is only used for the local host when remote
/// execution is not forced.
pub async fn open_channel(
    hostname: &str,
    is_local: bool,
    config: &CxmConfig,
) -> CxmResult<Box<dyn ExecutionChannel>> {
    if is_local && !config.use_ssh {
        Ok(Box::new(LocalChannel::new(hostname, config.install_path.clone())))
    } else {
        Ok(Box::new(SshChannel::connect(hostname, config).await?))
    }
}

/// In-process execution through `/bin/sh`
#[derive(Debug, Clone)]
pub struct LocalChannel {
    hostname: String,
    install_path: Option<PathBuf>,
}

impl LocalChannel {
    pub fn new(hostname: impl Into<String>, install_path: Option<PathBuf>) -> Self {
        Self {
            hostname: hostname.into(),
            install_path,
        }
    }
}

#[async_trait]
impl ExecutionChannel for LocalChannel {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn transport(&self) -> Transport {
        Transport::Local
    }

    async fn run(&self, command: &str) -> CxmResult<CommandOutput> {
        let command = prefix_command(self.install_path.as_deref(), command);
        debug!("[SHL] {} -> {}", self.hostname, command);

        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            // Reported code is the raw wait status shifted right by 8: a
            // signal-killed command reports 0.
            let exitcode = output.status.into_raw() >> 8;
            return Err(CxmError::shell(
                &self.hostname,
                String::from_utf8_lossy(&output.stderr),
                exitcode,
            ));
        }

        Ok(CommandOutput::from_bytes(&output.stdout))
    }

    async fn close(&self) -> CxmResult<()> {
        Ok(())
    }
}

/// Remote execution over an OpenSSH control master.
///
/// The master connection is authenticated once at construction and every
/// command is multiplexed over it. Trust (host keys, authorized keys) must be
/// set up beforehand: the client runs in batch mode and never prompts.
#[derive(Debug, Clone)]
pub struct SshChannel {
    hostname: String,
    config: SshConfig,
    install_path: Option<PathBuf>,
    control_path: PathBuf,
    log_path: PathBuf,
}

impl SshChannel {
    /// Describe a channel without opening the master connection
    pub fn new(hostname: impl Into<String>, config: &CxmConfig) -> Self {
        let hostname = hostname.into();
        let control_path = config
            .ssh
            .control_dir
            .join(format!("cxm-{}@{}:{}", config.ssh.user, hostname, config.ssh.port));
        let log_path = PathBuf::from(format!("{}.log", control_path.display()));

        Self {
            hostname,
            config: config.ssh.clone(),
            install_path: config.install_path.clone(),
            control_path,
            log_path,
        }
    }

    /// Open the master connection.
    ///
    /// The master's diagnostics go to [`SshChannel::log_path`]. Its stderr is
    /// never piped: a backgrounded master that keeps the pipe open would hold
    /// this call until the session ends.
    pub async fn connect(hostname: impl Into<String>, config: &CxmConfig) -> CxmResult<Self> {
        let channel = Self::new(hostname, config);
        debug!("[SSH] Opening master connection to {}", channel.hostname);

        if let Err(e) = tokio::fs::remove_file(&channel.log_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("[SSH] {} -> stale log not removed: {}", channel.hostname, e);
            }
        }

        let status = Command::new(&channel.config.program)
            .args(channel.master_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| CxmError::Connection {
                node: channel.hostname.clone(),
                details: format!("Failed to spawn {}: {}", channel.config.program.display(), e),
            })?;

        if !status.success() {
            let log = tokio::fs::read_to_string(&channel.log_path)
                .await
                .unwrap_or_default();
            let details = match log.trim() {
                "" => format!("master connection failed ({})", status),
                log => log.to_string(),
            };
            return Err(CxmError::Connection {
                node: channel.hostname.clone(),
                details,
            });
        }

        Ok(channel)
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Log file of the master connection
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.config.port.to_string(),
            "-l".to_string(),
            self.config.user.clone(),
        ]
    }

    /// Arguments starting a backgrounded, persistent master connection
    pub fn master_args(&self) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-N".to_string(),
            "-f".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            "-E".to_string(),
            self.log_path.display().to_string(),
        ];
        args.extend(self.common_args());
        args.push(self.hostname.clone());
        args
    }

    /// Arguments running `command` over the master connection
    pub fn exec_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push(self.hostname.clone());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    /// Arguments asking the master connection to exit
    pub fn exit_args(&self) -> Vec<String> {
        let mut args = self.common_args();
        args.push("-O".to_string());
        args.push("exit".to_string());
        args.push(self.hostname.clone());
        args
    }
}

#[async_trait]
impl ExecutionChannel for SshChannel {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn transport(&self) -> Transport {
        Transport::Ssh
    }

    async fn run(&self, command: &str) -> CxmResult<CommandOutput> {
        let command = prefix_command(self.install_path.as_deref(), command);
        debug!("[SSH] {} -> {}", self.hostname, command);

        let mut child = Command::new(&self.config.program)
            .args(self.exec_args(&command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            CxmError::ssh(&self.hostname, "stdout of ssh was not captured", -1)
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            CxmError::ssh(&self.hostname, "stderr of ssh was not captured", -1)
        })?;

        // stderr is drained into memory on the side so a chatty error stream
        // cannot stall the command, but it is only consulted after the exit
        // status is known.
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await?;

        let status = child.wait().await?;
        let exitcode = status.code().unwrap_or(-1);

        if exitcode != 0 {
            let message = match tokio::time::timeout(self.config.stderr_timeout, stderr_reader).await {
                Ok(Ok(Ok(buf))) => String::from_utf8_lossy(&buf).into_owned(),
                Ok(Ok(Err(e))) => format!("Failed to read stderr: {}", e),
                Ok(Err(e)) => format!("Failed to read stderr: {}", e),
                Err(_) => {
                    warn!("[SSH] {} -> timeout reading stderr of '{}'", self.hostname, command);
                    STDERR_TIMEOUT_MESSAGE.to_string()
                }
            };
            return Err(CxmError::ssh(&self.hostname, message, exitcode));
        }

        stderr_reader.abort();
        Ok(CommandOutput::from_bytes(&out))
    }

    async fn close(&self) -> CxmResult<()> {
        debug!("[SSH] Closing master connection to {}", self.hostname);

        let output = Command::new(&self.config.program)
            .args(self.exit_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(CxmError::ssh(
                &self.hostname,
                String::from_utf8_lossy(&output.stderr),
                output.status.code().unwrap_or(-1),
            ));
        }
        Ok(())
    }
}
