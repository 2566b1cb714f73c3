//! Local repositories, served by running `git upload-pack` / `git receive-pack` directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use path_absolutize::Absolutize;
use tokio::process::Command;

use super::process::ProcessSession;
use super::{Endpoint, Session, Transport};
use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::protocol::types::{Role, ServiceType};

#[derive(Debug, Clone)]
pub struct FileTransport {
    git_binary: PathBuf,
    idle_timeout: Duration,
}

impl FileTransport {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            git_binary: config.git_binary.clone(),
            idle_timeout: config.idle_timeout,
        }
    }

    fn command(&self, repository: &Path, role: Role) -> Command {
        let subcommand = match role.service() {
            ServiceType::UploadPack => "upload-pack",
            ServiceType::ReceivePack => "receive-pack",
        };
        let mut command = Command::new(&self.git_binary);
        command.arg(subcommand).arg(repository);
        if let Some(version) = role.requested_version().git_protocol_value() {
            command.env("GIT_PROTOCOL", version);
        }
        command
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn open(&self, endpoint: &Endpoint, role: Role) -> Result<Box<dyn Session>, RelayError> {
        let repository = Path::new(&endpoint.path)
            .absolutize()
            .map_err(|e| {
                RelayError::UnsupportedEndpoint(format!("{endpoint}: cannot resolve path: {e}"))
            })?
            .into_owned();
        let is_dir = tokio::fs::metadata(&repository)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(RelayError::UnsupportedEndpoint(format!(
                "{endpoint}: {} is not a directory",
                repository.display()
            )));
        }

        let session = ProcessSession::spawn(
            self.command(&repository, role),
            endpoint.clone(),
            role,
            self.idle_timeout,
            &[],
        )?;
        Ok(Box::new(session))
    }
}
