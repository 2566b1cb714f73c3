//! Smart HTTP remotes: `GET info/refs?service=...` for the advertisement, then one `POST` per
//! request body.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::oneshot;
use tokio_util::io::StreamReader;

use super::{BoxedReader, Endpoint, Session, Transport};
use crate::auth::Credential;
use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::protocol::pktline::{PacketLine, PacketReader};
use crate::protocol::types::{ProtocolStream, Role, ServiceType};

/// Content type of a POST body for `service`.
pub fn get_request_content_type(service: ServiceType) -> &'static str {
    match service {
        ServiceType::UploadPack => "application/x-git-upload-pack-request",
        ServiceType::ReceivePack => "application/x-git-receive-pack-request",
    }
}

/// Content type of a POST response for `service`.
pub fn get_content_type(service: ServiceType) -> &'static str {
    match service {
        ServiceType::UploadPack => "application/x-git-upload-pack-result",
        ServiceType::ReceivePack => "application/x-git-receive-pack-result",
    }
}

/// Content type of the `info/refs` advertisement for `service`.
pub fn get_advertisement_content_type(service: ServiceType) -> &'static str {
    match service {
        ServiceType::UploadPack => "application/x-git-upload-pack-advertisement",
        ServiceType::ReceivePack => "application/x-git-receive-pack-advertisement",
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(1))
            .connect_timeout(config.connect_timeout)
            .user_agent(config.agent.clone())
            .build()
            .map_err(|e| RelayError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            idle_timeout: config.idle_timeout,
        })
    }
}

fn authorize(request: RequestBuilder, credential: &Credential) -> RequestBuilder {
    match credential {
        Credential::Basic { username, password } => request.basic_auth(username, Some(password)),
        Credential::Bearer(token) => request.bearer_auth(token),
        Credential::None | Credential::SshKey { .. } => request,
    }
}

fn with_protocol(request: RequestBuilder, role: Role) -> RequestBuilder {
    match role.requested_version().git_protocol_value() {
        Some(version) => request.header("Git-Protocol", version),
        None => request,
    }
}

fn check_status(response: &Response, endpoint: &Endpoint) -> Result<(), RelayError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RelayError::AuthRejected(format!("{endpoint} (HTTP {status})")));
    }
    if !status.is_success() {
        return Err(RelayError::connection(format!(
            "HTTP {status} from {}",
            response.url()
        )));
    }
    Ok(())
}

fn check_content_type(response: &Response, expected: &str) -> Result<(), RelayError> {
    let actual = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let media_type = actual.split(';').next().unwrap_or("").trim();
    if !media_type.eq_ignore_ascii_case(expected) {
        return Err(RelayError::mismatch(format!(
            "expected {expected} from {}, got {actual:?} (not a smart HTTP server?)",
            response.url()
        )));
    }
    Ok(())
}

fn body_reader(response: Response, idle_timeout: Duration) -> PacketReader<BoxedReader> {
    let stream = Box::pin(response.bytes_stream().map_err(io::Error::other));
    let reader: BoxedReader = Box::new(StreamReader::new(stream));
    PacketReader::new(reader).with_idle_timeout(Some(idle_timeout))
}

/// Base URL for POSTs, taken from where the advertisement was actually served.
fn base_after_redirect(response: &Response, fallback: &str) -> String {
    let mut url = response.url().clone();
    url.set_query(None);
    match url.path().strip_suffix("/info/refs") {
        Some(base_path) => {
            let base_path = base_path.to_string();
            url.set_path(&base_path);
            url.to_string()
        }
        None => fallback.to_string(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, endpoint: &Endpoint, role: Role) -> Result<Box<dyn Session>, RelayError> {
        let service = role.service();
        let base_url = endpoint.base_url();
        let url = format!("{base_url}/info/refs?service={service}");
        tracing::debug!("GET {url}");

        let request = with_protocol(authorize(self.client.get(&url), &endpoint.credential), role);
        let response = request.send().await?;
        check_status(&response, endpoint)?;
        check_content_type(&response, get_advertisement_content_type(service))?;

        let base_url = base_after_redirect(&response, &base_url);
        if base_url != endpoint.base_url() {
            tracing::info!("{endpoint} redirected to {base_url}");
        }

        let mut reader = body_reader(response, self.idle_timeout);
        skip_service_preamble(&mut reader, service).await?;

        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            endpoint: endpoint.clone(),
            role,
            base_url,
            reader,
            idle_timeout: self.idle_timeout,
        }))
    }
}

/// Resolves once the request body is fully sent and `limit` has passed since.
async fn answer_overdue(sent: oneshot::Receiver<()>, limit: Duration) {
    match sent.await {
        Ok(()) => tokio::time::sleep(limit).await,
        Err(_) => std::future::pending().await,
    }
}

/// Consumes the `# service=<name>` line and its flush, which smart HTTP servers put in front of
/// the advertisement. v2 servers may omit it.
async fn skip_service_preamble(
    reader: &mut PacketReader<BoxedReader>,
    service: ServiceType,
) -> Result<(), RelayError> {
    let Some(first) = reader.read_line().await? else {
        return Ok(());
    };
    match first.text() {
        Some(text) if text.starts_with("# service=") => {
            if text != format!("# service={service}") {
                return Err(RelayError::mismatch(format!(
                    "server announced {text:?} for {service}"
                )));
            }
            match reader.expect_line().await? {
                PacketLine::Flush => Ok(()),
                // Some servers skip the flush; keep whatever follows.
                other => {
                    reader.unread(other);
                    Ok(())
                }
            }
        }
        _ => {
            reader.unread(first);
            Ok(())
        }
    }
}

pub struct HttpSession {
    client: Client,
    endpoint: Endpoint,
    role: Role,
    base_url: String,
    reader: PacketReader<BoxedReader>,
    idle_timeout: Duration,
}

#[async_trait]
impl Session for HttpSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn role(&self) -> Role {
        self.role
    }

    fn reader(&mut self) -> &mut PacketReader<BoxedReader> {
        &mut self.reader
    }

    async fn send(&mut self, body: ProtocolStream) -> Result<(), RelayError> {
        let service = self.role.service();
        let url = format!("{}/{service}", self.base_url);
        tracing::debug!("POST {url}");

        let (sent_tx, sent_rx) = oneshot::channel();
        let end_of_body = futures::stream::once(async move {
            let _ = sent_tx.send(());
            None::<Result<Bytes, RelayError>>
        })
        .filter_map(futures::future::ready);
        let request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, get_request_content_type(service))
            .header(ACCEPT, get_content_type(service))
            .body(reqwest::Body::wrap_stream(body.chain(end_of_body)));
        let request = with_protocol(authorize(request, &self.endpoint.credential), self.role);
        let response = tokio::select! {
            response = request.send() => response?,
            () = answer_overdue(sent_rx, self.idle_timeout) => {
                return Err(RelayError::timeout(format!("waiting for {url} to answer")));
            }
        };
        check_status(&response, &self.endpoint)?;
        check_content_type(&response, get_content_type(service))?;

        self.reader = body_reader(response, self.idle_timeout);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        let empty: BoxedReader = Box::new(tokio::io::empty());
        self.reader = PacketReader::new(empty);
        Ok(())
    }
}
