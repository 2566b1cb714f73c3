//! Credentials for remote endpoints.
//!
//! A [`Credential`] is resolved once per endpoint before any connection is made and then travels
//! inside the [`Endpoint`]; transports never ask for credentials themselves. Secret values are
//! never printed, not even through `Debug`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::RelayError;
use crate::transport::{Endpoint, Scheme};

#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credential {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer(String),
    SshKey {
        path: PathBuf,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => write!(f, "None"),
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Bearer(_) => write!(f, "Bearer(<redacted>)"),
            Credential::SshKey { path } => f.debug_struct("SshKey").field("path", path).finish(),
        }
    }
}

impl Credential {
    pub fn is_none(&self) -> bool {
        matches!(self, Credential::None)
    }

    /// Whether this kind of credential means anything for `scheme`.
    pub fn applies_to(&self, scheme: Scheme) -> bool {
        match self {
            Credential::None => true,
            Credential::Basic { .. } | Credential::Bearer(_) => scheme.is_http(),
            Credential::SshKey { .. } => scheme == Scheme::Ssh,
        }
    }
}

/// Supplies credentials per endpoint.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns [`Credential::None`] when the provider knows nothing about the endpoint.
    async fn credential_for(&self, endpoint: &Endpoint) -> Result<Credential, RelayError>;
}

/// Fills in the endpoint's credential from `provider` unless the endpoint already carries one
/// (for example from URL userinfo).
pub async fn resolve(
    endpoint: Endpoint,
    provider: &dyn CredentialProvider,
) -> Result<Endpoint, RelayError> {
    if !endpoint.credential.is_none() {
        return Ok(endpoint);
    }
    let credential = provider.credential_for(&endpoint).await?;
    if !credential.is_none() {
        tracing::debug!("using {:?} for {}", credential, endpoint);
    }
    Ok(endpoint.with_credential(credential))
}

/// One fixed credential, optionally limited to a set of hosts.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credential: Credential,
    hosts: Option<BTreeSet<String>>,
}

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            hosts: None,
        }
    }

    pub fn for_host(mut self, host: impl Into<String>) -> Self {
        self.hosts
            .get_or_insert_with(BTreeSet::new)
            .insert(host.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential_for(&self, endpoint: &Endpoint) -> Result<Credential, RelayError> {
        if !self.credential.applies_to(endpoint.scheme) {
            return Ok(Credential::None);
        }
        let host_ok = match (&self.hosts, endpoint.host.as_deref()) {
            (None, _) => true,
            (Some(hosts), Some(host)) => hosts.contains(host),
            (Some(_), None) => false,
        };
        Ok(if host_ok {
            self.credential.clone()
        } else {
            Credential::None
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
struct NetrcEntry {
    machine: Option<String>,
    login: String,
    password: String,
}

/// Basic credentials for HTTP endpoints from a `.netrc` file.
#[derive(Clone, Default)]
pub struct NetrcCredentials {
    entries: Vec<NetrcEntry>,
}

impl fmt::Debug for NetrcCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetrcCredentials")
            .field("machines", &self.entries.len())
            .finish()
    }
}

impl NetrcCredentials {
    /// Default location: `$NETRC`, else `~/.netrc`, else `~/_netrc`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os("NETRC") {
            return Some(PathBuf::from(path));
        }
        let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
        let home = PathBuf::from(home);
        let dot = home.join(".netrc");
        if dot.exists() {
            return Some(dot);
        }
        let underscore = home.join("_netrc");
        underscore.exists().then_some(underscore)
    }

    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read netrc file {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let mut entries = Vec::new();
        let mut current: Option<NetrcEntry> = None;
        let mut tokens = strip_macros(text).into_iter();

        while let Some(token) = tokens.next() {
            match token {
                "machine" | "default" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                    let machine = if token == "machine" {
                        let name = tokens.next().ok_or_else(|| {
                            RelayError::Config("netrc: machine without a name".into())
                        })?;
                        Some(name.to_string())
                    } else {
                        None
                    };
                    current = Some(NetrcEntry {
                        machine,
                        login: String::new(),
                        password: String::new(),
                    });
                }
                "login" | "password" | "account" => {
                    let value = tokens.next().ok_or_else(|| {
                        RelayError::Config(format!("netrc: {token} without a value"))
                    })?;
                    if let Some(entry) = current.as_mut() {
                        match token {
                            "login" => entry.login = value.to_string(),
                            "password" => entry.password = value.to_string(),
                            _ => {}
                        }
                    }
                }
                other => tracing::debug!("netrc: ignoring token {other:?}"),
            }
        }
        if let Some(entry) = current.take() {
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    fn lookup(&self, host: &str) -> Option<&NetrcEntry> {
        self.entries
            .iter()
            .find(|e| e.machine.as_deref() == Some(host))
            .or_else(|| self.entries.iter().find(|e| e.machine.is_none()))
    }
}

#[async_trait]
impl CredentialProvider for NetrcCredentials {
    async fn credential_for(&self, endpoint: &Endpoint) -> Result<Credential, RelayError> {
        if !endpoint.scheme.is_http() {
            return Ok(Credential::None);
        }
        let Some(host) = endpoint.host.as_deref() else {
            return Ok(Credential::None);
        };
        Ok(match self.lookup(host) {
            Some(entry) => Credential::Basic {
                username: entry.login.clone(),
                password: entry.password.clone(),
            },
            None => Credential::None,
        })
    }
}

/// Splits a netrc file into tokens, dropping `macdef` bodies (which run to the next blank line).
fn strip_macros(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut in_macro = false;
    for line in text.lines() {
        if in_macro {
            in_macro = !line.trim().is_empty();
            continue;
        }
        for token in line.split_whitespace() {
            if token == "macdef" {
                in_macro = true;
                break;
            }
            tokens.push(token);
        }
    }
    tokens
}

/// Asks each provider in turn; the first credential found wins.
#[derive(Default, Clone)]
pub struct ChainedCredentials {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ChainedCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, provider: Arc<dyn CredentialProvider>) {
        self.providers.push(provider);
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl CredentialProvider for ChainedCredentials {
    async fn credential_for(&self, endpoint: &Endpoint) -> Result<Credential, RelayError> {
        for provider in &self.providers {
            let credential = provider.credential_for(endpoint).await?;
            if !credential.is_none() {
                return Ok(credential);
            }
        }
        Ok(Credential::None)
    }
}
