//! SSH remotes, reached through the OpenSSH client so that the user's `~/.ssh/config`, agent
//! and known hosts apply.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::process::ProcessSession;
use super::{Endpoint, Session, Transport};
use crate::auth::Credential;
use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::protocol::types::Role;

const AUTH_MARKERS: &[&str] = &["Permission denied"];

#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_binary: PathBuf,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl SshTransport {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            ssh_binary: config.ssh_binary.clone(),
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
        }
    }

    fn args(&self, endpoint: &Endpoint, role: Role) -> Result<Vec<OsString>, RelayError> {
        let host = endpoint
            .host
            .as_deref()
            .ok_or_else(|| RelayError::UnsupportedEndpoint(format!("{endpoint}: missing host")))?;

        let mut args: Vec<OsString> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)).into(),
        ];
        if let Some(port) = endpoint.port {
            args.push("-p".into());
            args.push(port.to_string().into());
        }
        if let Credential::SshKey { path } = &endpoint.credential {
            args.push("-i".into());
            args.push(path.clone().into_os_string());
            args.push("-o".into());
            args.push("IdentitiesOnly=yes".into());
        }
        if role.requested_version().git_protocol_value().is_some() {
            args.push("-o".into());
            args.push("SendEnv=GIT_PROTOCOL".into());
        }
        args.push("--".into());
        args.push(match &endpoint.user {
            Some(user) => format!("{user}@{host}").into(),
            None => host.into(),
        });
        args.push(remote_command(&role.service().to_string(), &endpoint.path).into());
        Ok(args)
    }
}

/// `git-upload-pack '<path>'`, quoted for the remote shell. `/~user/repo` is sent as
/// `'~user/repo'`; upload-pack and receive-pack expand the home directory themselves.
fn remote_command(service: &str, path: &str) -> String {
    let path = path.strip_prefix('/').filter(|p| p.starts_with('~')).unwrap_or(path);
    format!("{service} {}", shell_quote(path))
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&self, endpoint: &Endpoint, role: Role) -> Result<Box<dyn Session>, RelayError> {
        let mut command = Command::new(&self.ssh_binary);
        command.args(self.args(endpoint, role)?);
        if let Some(version) = role.requested_version().git_protocol_value() {
            command.env("GIT_PROTOCOL", version);
        }
        let session = ProcessSession::spawn(
            command,
            endpoint.clone(),
            role,
            self.idle_timeout,
            AUTH_MARKERS,
        )?;
        Ok(Box::new(session))
    }
}
