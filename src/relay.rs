//! Mirrors one remote onto another by piping the source's pack straight into the target.
//!
//! The fetch side runs on its own task and hands pack chunks to the push side through a bounded
//! channel, so a slow target throttles the source instead of growing a buffer. Nothing is written
//! to disk and a failed run is never resumed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::config::RelayConfig;
use crate::errors::{EXIT_REF_REJECTED, RelayError};
use crate::hash::ObjectId;
use crate::protocol::advertisement::{Advertisement, list_refs};
use crate::protocol::negotiation::{
    FetchSummary, Negotiation, NegotiationRequest, select_fetch_capabilities,
};
use crate::protocol::push::{PushReport, PushRequest, empty_pack, read_report};
use crate::protocol::types::{Capability, ProtocolStream, Ref, RefUpdate, Role, single_chunk};
use crate::sink::LogSink;
use crate::transport::{self, Endpoint, Session, Transport};

/// Include/exclude globs over ref names. `*` matches any run of characters, `/` included.
#[derive(Debug, Clone)]
pub struct RefFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl RefFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, RelayError> {
        let compile = |globs: &[String]| -> Result<Vec<Regex>, RelayError> {
            globs
                .iter()
                .map(|g| {
                    Regex::new(&glob_to_regex(g))
                        .map_err(|e| RelayError::Config(format!("bad ref pattern {g:?}: {e}")))
                })
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Exclusions win over inclusions.
    pub fn matches(&self, name: &str) -> bool {
        self.include.iter().any(|re| re.is_match(name))
            && !self.exclude.iter().any(|re| re.is_match(name))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '[' => {
                let class: String = chars.clone().take_while(|&c| c != ']').collect();
                let closed = chars.clone().nth(class.chars().count()) == Some(']');
                if !closed || class.is_empty() {
                    pattern.push_str(r"\[");
                    continue;
                }
                for _ in 0..=class.chars().count() {
                    chars.next();
                }
                pattern.push('[');
                let body = match class.strip_prefix('!') {
                    Some(rest) => {
                        pattern.push('^');
                        rest
                    }
                    None => class.as_str(),
                };
                for c in body.chars() {
                    if matches!(c, '\\' | '[' | '^' | '&' | '~') {
                        pattern.push('\\');
                    }
                    pattern.push(c);
                }
                pattern.push(']');
            }
            c => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    pattern
}

fn mirrored(r: &Ref, filter: &RefFilter) -> bool {
    r.name.starts_with("refs/") && !r.name.ends_with("^{}") && filter.matches(&r.name)
}

/// The updates that make the target's selected refs equal the source's.
///
/// Refs outside `filter` are left alone on both sides. With `prune`, selected target refs the
/// source lacks are deleted.
pub fn plan_mirror_updates(
    target_refs: &[Ref],
    source_refs: &[Ref],
    filter: &RefFilter,
    prune: bool,
) -> Vec<RefUpdate> {
    let target: BTreeMap<&str, ObjectId> = target_refs
        .iter()
        .filter(|r| mirrored(r, filter))
        .map(|r| (r.name.as_str(), r.target))
        .collect();
    let source: BTreeMap<&str, ObjectId> = source_refs
        .iter()
        .filter(|r| mirrored(r, filter))
        .map(|r| (r.name.as_str(), r.target))
        .collect();

    let mut updates = Vec::new();
    for (name, new) in &source {
        match target.get(name) {
            Some(old) if old == new => {}
            Some(old) => updates.push(RefUpdate::new(*name, *old, *new)),
            None => updates.push(RefUpdate::new(*name, ObjectId::zero(new.kind()), *new)),
        }
    }
    if prune {
        for (name, old) in &target {
            if !source.contains_key(name) {
                updates.push(RefUpdate::new(*name, *old, ObjectId::zero(old.kind())));
            }
        }
    }
    updates
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayOutcome {
    pub updates: Vec<RefUpdate>,
    /// Deletions the target could not accept.
    pub skipped: Vec<RefUpdate>,
    pub report: PushReport,
    /// Pack bytes received from the source and passed on.
    pub bytes_relayed: u64,
    pub progress_messages: u64,
    pub dry_run: bool,
}

impl RelayOutcome {
    fn unchanged(updates: Vec<RefUpdate>, dry_run: bool) -> Self {
        Self {
            updates,
            skipped: Vec::new(),
            report: PushReport::default(),
            bytes_relayed: 0,
            progress_messages: 0,
            dry_run,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.report.overall() {
            0
        } else {
            EXIT_REF_REJECTED
        }
    }
}

/// Failures worth asking the remote about; protocol-level errors already carry its words.
async fn diagnosed(session: &mut dyn Session, error: RelayError) -> RelayError {
    if error.is_connectivity() || matches!(error, RelayError::MalformedFrame(_)) {
        session.diagnose(error).await
    } else {
        error
    }
}

async fn close_quietly(session: &mut dyn Session) {
    if let Err(e) = session.close().await {
        tracing::debug!("closing {}: {e}", session.endpoint());
    }
}

async fn abort_quietly(session: &mut dyn Session) {
    if let Err(e) = session.abort().await {
        tracing::debug!("aborting {}: {e}", session.endpoint());
    }
}

async fn open_session(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    role: Role,
    limit: Duration,
) -> Result<(Box<dyn Session>, Advertisement), RelayError> {
    let mut session = tokio::time::timeout(limit, transport.open(endpoint, role))
        .await
        .map_err(|_| RelayError::timeout(format!("connecting to {endpoint}")))??;
    let advertisement =
        match tokio::time::timeout(limit, Advertisement::read(session.reader())).await {
            Ok(Ok(advertisement)) => advertisement,
            Ok(Err(e)) => {
                let e = diagnosed(&mut *session, e).await;
                close_quietly(&mut *session).await;
                return Err(e);
            }
            Err(_) => {
                let e = RelayError::timeout(format!("waiting for {endpoint} to advertise"));
                let e = diagnosed(&mut *session, e).await;
                close_quietly(&mut *session).await;
                return Err(e);
            }
        };
    tracing::debug!(
        "{endpoint}: {:?}, {} refs, capabilities: {}",
        advertisement.version,
        advertisement.refs.len(),
        advertisement.capabilities
    );
    Ok((session, advertisement))
}

/// Work left once both sides have been compared.
enum Planned {
    Finished(RelayOutcome),
    Push {
        outcome: RelayOutcome,
        push: PushRequest,
        commands: Bytes,
        /// `None` when no command needs a pack.
        fetch: Option<NegotiationRequest>,
    },
}

type FetchHandle = tokio::task::JoinHandle<Result<FetchSummary, RelayError>>;

/// Where the push body is: waiting on the source, handing chunk `n` to the target, or finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Waiting,
    Writing(u64),
    Done,
}

/// Publishes the body's progress so a target that stops reading can be noticed.
fn watched(mut body: ProtocolStream, state: watch::Sender<BodyState>) -> ProtocolStream {
    let mut handed = 0u64;
    futures::stream::poll_fn(move |cx| {
        let polled = body.poll_next_unpin(cx);
        let next = match &polled {
            Poll::Pending => BodyState::Waiting,
            Poll::Ready(Some(_)) => {
                handed += 1;
                BodyState::Writing(handed)
            }
            Poll::Ready(None) => BodyState::Done,
        };
        state.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
        polled
    })
    .boxed()
}

/// Resolves when one chunk has been with the target for `limit` without the next being asked for.
async fn write_stalled(mut state: watch::Receiver<BodyState>, limit: Duration) {
    loop {
        let current = *state.borrow_and_update();
        let changed = match current {
            BodyState::Done => break,
            BodyState::Waiting => state.changed().await,
            BodyState::Writing(_) => match tokio::time::timeout(limit, state.changed()).await {
                Ok(changed) => changed,
                Err(_) => return,
            },
        };
        if changed.is_err() {
            break;
        }
    }
    std::future::pending::<()>().await
}

/// How the push ended relative to the fetch feeding it.
enum Race {
    Pushed(Result<PushReport, RelayError>),
    SourceFailed,
    Stalled,
}

/// Runs mirror operations with one configuration and log sink.
pub struct Relay {
    config: RelayConfig,
    sink: Arc<dyn LogSink>,
    filter: RefFilter,
    transports: Option<(Arc<dyn Transport>, Arc<dyn Transport>)>,
}

impl Relay {
    pub fn new(config: RelayConfig, sink: Arc<dyn LogSink>) -> Result<Self, RelayError> {
        config.validate()?;
        let filter = RefFilter::new(&config.include_refs, &config.exclude_refs)?;
        Ok(Self {
            config,
            sink,
            filter,
            transports: None,
        })
    }

    /// Uses the given transports instead of choosing one per endpoint scheme.
    pub fn with_transports(
        mut self,
        source: Arc<dyn Transport>,
        target: Arc<dyn Transport>,
    ) -> Self {
        self.transports = Some((source, target));
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn transports_for(
        &self,
        source: &Endpoint,
        target: &Endpoint,
    ) -> Result<(Arc<dyn Transport>, Arc<dyn Transport>), RelayError> {
        match &self.transports {
            Some((s, t)) => Ok((s.clone(), t.clone())),
            None => Ok((
                transport::for_endpoint(source, &self.config)?,
                transport::for_endpoint(target, &self.config)?,
            )),
        }
    }

    /// Makes `target`'s selected refs match `source`.
    ///
    /// Per-ref rejections are returned in the outcome's report; everything else that stops the
    /// run is an error. Both sessions are closed before this returns.
    pub async fn run(
        &self,
        source: &Endpoint,
        target: &Endpoint,
    ) -> Result<RelayOutcome, RelayError> {
        let (source_transport, target_transport) = self.transports_for(source, target)?;
        let limit = self.config.connect_timeout;
        let (opened_source, opened_target) = tokio::join!(
            open_session(&*source_transport, source, Role::Fetch, limit),
            open_session(&*target_transport, target, Role::Push, limit),
        );
        let (source_session, source_adv) = match opened_source {
            Ok(opened) => opened,
            Err(e) => {
                if let Ok((mut target_session, _)) = opened_target {
                    close_quietly(&mut *target_session).await;
                }
                return Err(e);
            }
        };
        let (mut target_session, target_adv) = match opened_target {
            Ok(opened) => opened,
            Err(e) => {
                let mut source_session = source_session;
                close_quietly(&mut *source_session).await;
                return Err(e);
            }
        };

        let result = self
            .mirror(source_session, &source_adv, &mut *target_session, &target_adv)
            .await;
        close_quietly(&mut *target_session).await;
        match &result {
            Ok(outcome) => tracing::info!(
                "{} updates, {} bytes relayed from {source} to {target}",
                outcome.updates.len(),
                outcome.bytes_relayed
            ),
            Err(e) => tracing::debug!("relay from {source} to {target} failed: {e}"),
        }
        result
    }

    async fn plan(
        &self,
        source_session: &mut dyn Session,
        source_adv: &Advertisement,
        target_adv: &Advertisement,
    ) -> Result<Planned, RelayError> {
        let kind = target_adv.object_format();
        if source_adv.object_format() != kind {
            return Err(RelayError::mismatch(format!(
                "source uses {}, target uses {kind}",
                source_adv.object_format()
            )));
        }

        let source_refs = match list_refs(source_session, source_adv, "refs/").await {
            Ok(refs) => refs,
            Err(e) => return Err(diagnosed(source_session, e).await),
        };
        let updates = plan_mirror_updates(
            &target_adv.refs,
            &source_refs,
            &self.filter,
            self.config.prune,
        );
        for update in &updates {
            self.sink.emit(Level::INFO, &update.to_string());
        }
        if updates.is_empty() {
            self.sink.emit(Level::INFO, "target is up to date");
            return Ok(Planned::Finished(RelayOutcome::unchanged(updates, false)));
        }
        if self.config.dry_run {
            return Ok(Planned::Finished(RelayOutcome::unchanged(updates, true)));
        }

        let push = PushRequest::new(
            &updates,
            target_adv,
            self.config.atomic,
            &self.config.agent,
            &*self.sink,
        );
        let outcome = RelayOutcome {
            skipped: push.skipped.clone(),
            ..RelayOutcome::unchanged(updates, false)
        };
        if push.commands.is_empty() {
            return Ok(Planned::Finished(outcome));
        }

        let fetch = if push.needs_pack() {
            let allow_ofs_delta = target_adv.capabilities.contains(&Capability::OfsDelta);
            let capabilities =
                select_fetch_capabilities(source_adv, allow_ofs_delta, &self.config.agent);
            let request = NegotiationRequest::plan(&push.commands, &target_adv.refs)
                .with_capabilities(capabilities);
            request.check_advertised(&source_refs)?;
            Some(request)
        } else {
            None
        };
        Ok(Planned::Push {
            outcome,
            commands: push.encode_commands()?,
            push,
            fetch,
        })
    }

    async fn mirror(
        &self,
        mut source_session: Box<dyn Session>,
        source_adv: &Advertisement,
        target_session: &mut dyn Session,
        target_adv: &Advertisement,
    ) -> Result<RelayOutcome, RelayError> {
        let planned = self.plan(&mut *source_session, source_adv, target_adv).await;
        let (mut outcome, push, commands, fetch) = match planned {
            Ok(Planned::Push {
                outcome,
                push,
                commands,
                fetch,
            }) => (outcome, push, commands, fetch),
            Ok(Planned::Finished(outcome)) => {
                close_quietly(&mut *source_session).await;
                return Ok(outcome);
            }
            Err(e) => {
                close_quietly(&mut *source_session).await;
                return Err(e);
            }
        };

        let source_failed = CancellationToken::new();
        let (body, fetch): (ProtocolStream, Option<FetchHandle>) = match fetch {
            Some(request) if !request.wants.is_empty() => {
                let (tx, rx) = mpsc::channel(self.config.chunk_window.max(1));
                let negotiation = Negotiation::new(
                    request,
                    source_adv.version,
                    self.sink.clone(),
                    self.config.chunk_size,
                );
                let handle = tokio::spawn(fetch_task(
                    negotiation,
                    source_session,
                    tx,
                    source_failed.clone(),
                ));
                // a failed source must not look like the end of the pack
                let aborted = source_failed.clone();
                let tail = futures::stream::once(async move {
                    aborted
                        .is_cancelled()
                        .then_some(Err(RelayError::PackAborted))
                })
                .filter_map(futures::future::ready);
                let body = futures::stream::once(async move { Ok(commands) })
                    .chain(ReceiverStream::new(rx))
                    .chain(tail)
                    .boxed();
                (body, Some(handle))
            }
            Some(_) => {
                tracing::debug!("target holds every object, sending an empty pack");
                close_quietly(&mut *source_session).await;
                let mut body = commands.to_vec();
                body.extend_from_slice(&empty_pack(target_adv.object_format()));
                (single_chunk(Bytes::from(body)), None)
            }
            None => {
                close_quietly(&mut *source_session).await;
                (single_chunk(commands), None)
            }
        };

        let (progress, progress_rx) = watch::channel(BodyState::Waiting);
        let body = watched(body, progress);
        let raced = {
            let pushing = self.push(&mut *target_session, body, &push);
            tokio::pin!(pushing);
            tokio::select! {
                biased;
                () = source_failed.cancelled() => Race::SourceFailed,
                () = write_stalled(progress_rx, self.config.idle_timeout) => Race::Stalled,
                pushed = &mut pushing => Race::Pushed(pushed),
            }
        };
        let summary = match (raced, fetch) {
            (Race::Pushed(Ok(report)), fetch) => {
                outcome.report = report;
                match fetch {
                    Some(handle) => join_fetch(handle).await?,
                    None => FetchSummary::default(),
                }
            }
            (Race::SourceFailed, fetch) => {
                tracing::debug!(
                    "source failed, aborting the push to {}",
                    target_session.endpoint()
                );
                abort_quietly(target_session).await;
                return Err(match fetch {
                    Some(handle) => join_fetch(handle).await.err(),
                    None => None,
                }
                .unwrap_or(RelayError::PackAborted));
            }
            (Race::Stalled, fetch) => {
                if let Some(handle) = fetch {
                    handle.abort();
                }
                let error = RelayError::timeout(format!(
                    "{} stopped reading the pack",
                    target_session.endpoint()
                ));
                abort_quietly(target_session).await;
                return Err(error);
            }
            (Race::Pushed(Err(e)), None) => return Err(e),
            (Race::Pushed(Err(e)), Some(handle)) => {
                if source_failed.is_cancelled() {
                    if let Err(source_error) = join_fetch(handle).await {
                        return Err(source_error);
                    }
                } else {
                    tracing::debug!("push failed, abandoning the fetch");
                    handle.abort();
                }
                return Err(e);
            }
        };
        outcome.bytes_relayed = summary.bytes;
        outcome.progress_messages = summary.progress_messages;

        for (name, reason) in outcome.report.rejected() {
            self.sink.emit(Level::WARN, &format!("{name} rejected: {reason}"));
        }
        Ok(outcome)
    }

    async fn push(
        &self,
        session: &mut dyn Session,
        body: ProtocolStream,
        push: &PushRequest,
    ) -> Result<PushReport, RelayError> {
        let exchanged = async {
            session.send(body).await?;
            read_report(session.reader(), push, &*self.sink).await
        }
        .await;
        let report = match exchanged {
            Ok(report) => report,
            Err(RelayError::PackAborted) => return Err(RelayError::PackAborted),
            Err(e) => return Err(diagnosed(session, e).await),
        };
        let mut report = report.unwrap_or_else(|| PushReport::assumed_ok(&push.commands));
        if let Err(reason) = &report.unpack {
            return Err(RelayError::PushFailed(format!("unpack failed: {reason}")));
        }
        report.fill_missing(&push.commands);
        Ok(report)
    }
}

async fn join_fetch(handle: FetchHandle) -> Result<FetchSummary, RelayError> {
    handle
        .await
        .map_err(|e| RelayError::connection(format!("fetch task ended abnormally: {e}")))?
}

/// Drives the source to the end of its pack. On failure `source_failed` is cancelled before
/// anything else, and the push body ends in [`RelayError::PackAborted`] so the target never
/// sees a pack that looks complete.
async fn fetch_task(
    mut negotiation: Negotiation,
    mut session: Box<dyn Session>,
    tx: mpsc::Sender<Result<Bytes, RelayError>>,
    source_failed: CancellationToken,
) -> Result<FetchSummary, RelayError> {
    let result = match negotiation.run(&mut *session, &tx).await {
        Ok(summary) => Ok(summary),
        Err(RelayError::PackAborted) => Err(RelayError::PackAborted),
        Err(e) => {
            source_failed.cancel();
            let _ = tx.try_send(Err(RelayError::PackAborted));
            let e = diagnosed(&mut *session, e).await;
            tracing::debug!("fetch failed in state {:?}: {e}", negotiation.state());
            Err(e)
        }
    };
    drop(tx);
    close_quietly(&mut *session).await;
    result
}
