//! Sessions backed by a child process speaking the protocol on stdin/stdout. Shared by the
//! `file` and `ssh` transports.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use super::{BoxedReader, Endpoint, Session};
use crate::errors::RelayError;
use crate::protocol::pktline::PacketReader;
use crate::protocol::types::{ProtocolStream, Role};

/// Most stderr kept for diagnostics; older output is discarded.
const STDERR_TAIL: usize = 16 * 1024;
const EXIT_GRACE: Duration = Duration::from_secs(2);

pub(crate) struct ProcessSession {
    endpoint: Endpoint,
    role: Role,
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: PacketReader<BoxedReader>,
    stderr: Option<JoinHandle<String>>,
    stderr_text: Option<String>,
    idle_timeout: Duration,
    /// stderr fragments that mean the remote refused our credentials.
    auth_markers: &'static [&'static str],
    closed: bool,
}

impl ProcessSession {
    pub(crate) fn spawn(
        mut command: Command,
        endpoint: Endpoint,
        role: Role,
        idle_timeout: Duration,
        auth_markers: &'static [&'static str],
    ) -> Result<Self, RelayError> {
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("spawning {:?} for {}", command.as_std(), endpoint);
        let mut child = command
            .spawn()
            .map_err(|e| RelayError::connection(format!("cannot start {program}: {e}")))?;

        let missing = |what: &str| RelayError::connection(format!("{program}: no {what} pipe"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let stderr_program = program.clone();
        let stderr_task = tokio::spawn(async move {
            let mut tail: Vec<u8> = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        tracing::debug!(
                            "{stderr_program} stderr: {}",
                            bstr::BStr::new(&buf[..n])
                        );
                        tail.extend_from_slice(&buf[..n]);
                        if tail.len() > STDERR_TAIL {
                            tail.drain(..tail.len() - STDERR_TAIL);
                        }
                    }
                }
            }
            String::from_utf8_lossy(&tail).trim().to_string()
        });

        let reader: BoxedReader = Box::new(stdout);
        Ok(Self {
            endpoint,
            role,
            program,
            child,
            stdin: Some(stdin),
            reader: PacketReader::new(reader).with_idle_timeout(Some(idle_timeout)),
            stderr: Some(stderr_task),
            stderr_text: None,
            idle_timeout,
            auth_markers,
            closed: false,
        })
    }

    async fn collected_stderr(&mut self) -> String {
        if let Some(task) = self.stderr.take() {
            let text = tokio::time::timeout(EXIT_GRACE, task)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            self.stderr_text = Some(text);
        }
        self.stderr_text.clone().unwrap_or_default()
    }

    async fn write_all(&mut self, chunk: &[u8]) -> Result<(), RelayError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RelayError::connection(format!("{}: session closed", self.program)))?;
        tokio::time::timeout(self.idle_timeout, stdin.write_all(chunk))
            .await
            .map_err(|_| RelayError::timeout(format!("writing to {}", self.program)))??;
        Ok(())
    }
}

#[async_trait]
impl Session for ProcessSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn role(&self) -> Role {
        self.role
    }

    fn reader(&mut self) -> &mut PacketReader<BoxedReader> {
        &mut self.reader
    }

    async fn send(&mut self, mut body: ProtocolStream) -> Result<(), RelayError> {
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            self.write_all(&chunk).await?;
        }
        if let Some(stdin) = self.stdin.as_mut() {
            tokio::time::timeout(self.idle_timeout, stdin.flush())
                .await
                .map_err(|_| RelayError::timeout(format!("writing to {}", self.program)))??;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stdin.take();

        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                tracing::debug!("{} exited cleanly", self.program);
            }
            Ok(Ok(status)) => {
                tracing::debug!("{} exited with {status}", self.program);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::debug!("{} still running, killing it", self.program);
                self.child.kill().await?;
            }
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), RelayError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stdin.take();
        if let Err(e) = self.child.kill().await {
            tracing::debug!("killing {}: {e}", self.program);
        }
        Ok(())
    }

    async fn diagnose(&mut self, error: RelayError) -> RelayError {
        if matches!(error, RelayError::AuthRejected(_)) {
            return error;
        }
        self.stdin.take();
        let status = match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        };
        let stderr = self.collected_stderr().await;

        if self
            .auth_markers
            .iter()
            .any(|marker| stderr.contains(marker))
        {
            return RelayError::AuthRejected(format!("{}: {stderr}", self.endpoint));
        }
        match status {
            Some(status) if !status.success() => {
                let detail = if stderr.is_empty() {
                    error.to_string()
                } else {
                    stderr
                };
                RelayError::connection(format!("{} exited with {status}: {detail}", self.program))
            }
            _ => error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::single_chunk;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn endpoint() -> Endpoint {
        "file:///tmp/repo.git".parse().unwrap()
    }

    /// Bytes sent on stdin come back through the packet reader.
    #[tokio::test]
    async fn echoes_through_child_process() {
        let mut session = ProcessSession::spawn(
            shell("cat"),
            endpoint(),
            Role::Fetch,
            Duration::from_secs(5),
            &[],
        )
        .unwrap();
        session
            .send(single_chunk(bytes::Bytes::from_static(b"0009done\n0000")))
            .await
            .unwrap();
        let lines = session.reader().read_until_flush().await.unwrap();
        assert_eq!(lines, vec![bytes::Bytes::from_static(b"done\n")]);
        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    /// An ssh-style refusal on stderr becomes an authentication error.
    #[tokio::test]
    async fn stderr_marker_maps_to_auth_rejected() {
        let mut session = ProcessSession::spawn(
            shell("echo 'git@example.com: Permission denied (publickey).' >&2; exit 255"),
            endpoint(),
            Role::Push,
            Duration::from_secs(5),
            &["Permission denied"],
        )
        .unwrap();
        let error = session.reader().read_line().await.map(|_| ()).err();
        assert!(error.is_none(), "clean EOF is not an error by itself");
        let diagnosed = session.diagnose(RelayError::connection("closed")).await;
        assert!(matches!(diagnosed, RelayError::AuthRejected(_)), "{diagnosed}");
    }

    /// A failing command is reported with its stderr.
    #[tokio::test]
    async fn failed_exit_carries_stderr() {
        let mut session = ProcessSession::spawn(
            shell("echo 'fatal: not a git repository' >&2; exit 128"),
            endpoint(),
            Role::Fetch,
            Duration::from_secs(5),
            &[],
        )
        .unwrap();
        let diagnosed = session.diagnose(RelayError::connection("closed")).await;
        match diagnosed {
            RelayError::Connection(message) => assert!(message.contains("not a git repository")),
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Aborting does not wait for a child that ignores its closed stdin.
    #[tokio::test]
    async fn abort_kills_a_lingering_child() {
        let mut session = ProcessSession::spawn(
            shell("sleep 30"),
            endpoint(),
            Role::Push,
            Duration::from_secs(5),
            &[],
        )
        .unwrap();
        let started = std::time::Instant::now();
        session.abort().await.unwrap();
        assert!(started.elapsed() < EXIT_GRACE);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_a_connection_error() {
        let result = ProcessSession::spawn(
            Command::new("/nonexistent/git-relay-test-binary"),
            endpoint(),
            Role::Fetch,
            Duration::from_secs(5),
            &[],
        );
        assert!(matches!(result, Err(RelayError::Connection(_))));
    }
}
