//! SSH management channel.
//!
//! Commands run through the system `ssh` client, one process per command:
//!
//! ```sh
//! ssh -o BatchMode=yes -o ConnectTimeout=10 [-o opt...] [-i key] -p port user@address \
//!     "export KEY='value'; cd '/path'; command"
//! ```
//!
//! The login user and port come from the guest's provisioning record; the
//! private key is the local counterpart of the provider `keyname`.
//!
//! # Example Configuration
//!
//! ```toml
//! [runner.ssh]
//! key_path = "~/.ssh/ci_key"
//! options = ["UserKnownHostsFile=/dev/null", "StrictHostKeyChecking=no"]
//! connect_timeout_secs = 10
//! ```

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

use super::{
    Command, Connector, GuestSession, OutputLine, OutputStream, SessionError, SessionResult,
};
use crate::config::SshConfig;
use crate::lifecycle::GuestRequest;

/// Exit status `ssh` uses for its own failures (refused, unreachable, auth).
const SSH_FAILURE: i32 = 255;

/// Opens [`SshSession`]s to ready guests.
pub struct SshConnector {
    ssh_opts: Vec<String>,
}

impl SshConnector {
    pub fn new(config: &SshConfig) -> Self {
        let mut ssh_opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", config.connect_timeout_secs),
        ];

        for opt in &config.options {
            ssh_opts.push("-o".to_string());
            ssh_opts.push(opt.clone());
        }

        if let Some(key_path) = &config.key_path {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            ssh_opts.push("-i".to_string());
            ssh_opts.push(key);
        }

        Self { ssh_opts }
    }
}

impl Connector for SshConnector {
    fn connect(&self, guest: &GuestRequest) -> SessionResult<Arc<dyn GuestSession>> {
        let address = guest.address().ok_or_else(|| {
            SessionError::Connect(format!("guest of entry {} has no address", guest.owner()))
        })?;
        let (user, port) = guest
            .ssh()
            .map(|s| (s.username.clone(), s.port))
            .unwrap_or_else(|| ("root".to_string(), 22));

        let mut ssh_opts = self.ssh_opts.clone();
        ssh_opts.push("-p".to_string());
        ssh_opts.push(port.to_string());

        Ok(Arc::new(SshSession {
            target: format!("{}@{}:{}", user, address, port),
            dest: format!("{}@{}", user, address),
            ssh_opts,
        }))
    }
}

/// Runs commands on one guest over SSH.
pub struct SshSession {
    target: String,
    dest: String,
    ssh_opts: Vec<String>,
}

impl SshSession {
    /// Arguments passed to `ssh` for `cmd`.
    pub fn ssh_args(&self, cmd: &Command) -> Vec<String> {
        let mut args = self.ssh_opts.clone();
        args.push(self.dest.clone());
        args.push(cmd.to_remote_script());
        args
    }
}

#[async_trait]
impl GuestSession for SshSession {
    fn target(&self) -> &str {
        &self.target
    }

    async fn exec_stream(&self, cmd: &Command) -> SessionResult<OutputStream> {
        debug!("[{}] {}", self.target, cmd.to_shell_string());

        let mut ssh_cmd = tokio::process::Command::new("ssh");
        ssh_cmd.args(self.ssh_args(cmd));
        ssh_cmd.stdin(Stdio::null());
        ssh_cmd.stdout(Stdio::piped());
        ssh_cmd.stderr(Stdio::piped());
        ssh_cmd.kill_on_drop(true);

        let mut child = ssh_cmd
            .spawn()
            .map_err(|e| SessionError::ExecFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::ExecFailed("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::ExecFailed("Failed to capture stderr".to_string()))?;

        let target = self.target.clone();
        let stdout_stream = SplitStream::new(BufReader::new(stdout).split(b'\n'))
            .filter_map(move |line| std::future::ready(decode_line(line, &target)))
            .map(OutputLine::Stdout);
        let target = self.target.clone();
        let stderr_stream = SplitStream::new(BufReader::new(stderr).split(b'\n'))
            .filter_map(move |line| std::future::ready(decode_line(line, &target)))
            .map(OutputLine::Stderr);

        // The child moves into the tail so dropping the stream kills ssh.
        let exit = stream::once(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            OutputLine::ExitCode(code)
        });

        Ok(Box::pin(stream::select(stdout_stream, stderr_stream).chain(exit)))
    }

    fn transport_failure_code(&self) -> Option<i32> {
        Some(SSH_FAILURE)
    }
}

/// Decodes one raw output line, replacing invalid UTF-8.
fn decode_line(line: io::Result<Vec<u8>>, target: &str) -> Option<String> {
    match line {
        Ok(mut bytes) => {
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        Err(e) => {
            warn!("[{}] failed to read output: {}", target, e);
            None
        }
    }
}
