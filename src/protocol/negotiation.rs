//! The want/have dialogue with the source's `git-upload-pack`, and the forwarding of the pack
//! it answers with.
//!
//! The relay holds no objects, so negotiation is a single round: the wants are the new tips,
//! the haves are everything the target already points at, and `done` follows immediately. The
//! source computes the minimal pack from that.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::Level;

use super::advertisement::Advertisement;
use super::pktline::{PacketLine, PacketReader, PacketWriter, SideBandFrame, line_text};
use super::types::{
    Capability, CapabilitySet, ObjectSet, ProtocolVersion, Ref, RefUpdate, SideBand, single_chunk,
};
use crate::errors::RelayError;
use crate::hash::ObjectId;
use crate::sink::LogSink;
use crate::transport::{BoxedReader, Session};

/// Pack chunks handed from the fetch side to the push side.
pub type PackSender = mpsc::Sender<Result<Bytes, RelayError>>;

/// What to ask the source for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationRequest {
    pub wants: ObjectSet,
    pub haves: ObjectSet,
    pub capabilities: CapabilitySet,
}

impl NegotiationRequest {
    /// Wants are the new tips of `updates` the target does not already point at; haves are all
    /// of the target's tips.
    pub fn plan(updates: &[RefUpdate], target_refs: &[Ref]) -> Self {
        let haves: ObjectSet = target_refs
            .iter()
            .map(|r| r.target)
            .filter(|id| !id.is_zero())
            .collect();
        let wants = updates
            .iter()
            .map(|u| u.new)
            .filter(|id| !id.is_zero() && !haves.contains(id))
            .collect();
        NegotiationRequest {
            wants,
            haves,
            capabilities: CapabilitySet::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fails if a want is not among the source's advertised tips.
    pub fn check_advertised(&self, source_refs: &[Ref]) -> Result<(), RelayError> {
        let advertised: BTreeSet<ObjectId> = source_refs
            .iter()
            .flat_map(|r| std::iter::once(r.target).chain(r.peeled))
            .collect();
        match self.wants.iter().find(|id| !advertised.contains(id)) {
            Some(id) => Err(RelayError::NegotiationFailed(format!(
                "{id} is not advertised by the source"
            ))),
            None => Ok(()),
        }
    }
}

/// Capabilities to use when fetching from `source`, limited to what it advertised.
/// `allow_ofs_delta` says whether the consumer of the pack understands offset deltas.
pub fn select_fetch_capabilities(
    source: &Advertisement,
    allow_ofs_delta: bool,
    agent: &str,
) -> CapabilitySet {
    let advertised = &source.capabilities;
    let mut selected = CapabilitySet::new();
    if source.version == ProtocolVersion::V2 {
        if advertised.has_key("agent") {
            selected.insert(Capability::Agent(agent.to_string()));
        }
        if advertised.has_key("object-format") {
            selected.insert(Capability::ObjectFormat(source.object_format().to_string()));
        }
        if allow_ofs_delta {
            selected.insert(Capability::OfsDelta);
        }
        return selected;
    }

    if advertised.contains(&Capability::MultiAckDetailed) {
        selected.insert(Capability::MultiAckDetailed);
    }
    if let Some(side_band) = advertised.side_band() {
        selected.insert(side_band);
    }
    if allow_ofs_delta && advertised.contains(&Capability::OfsDelta) {
        selected.insert(Capability::OfsDelta);
    }
    if advertised.has_key("agent") {
        selected.insert(Capability::Agent(agent.to_string()));
    }
    if advertised.has_key("object-format") {
        selected.insert(Capability::ObjectFormat(source.object_format().to_string()));
    }
    selected
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Init,
    Negotiating,
    PackIncoming,
    Done,
    Failed(String),
}

/// Totals for one fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub bytes: u64,
    pub chunks: u64,
    pub progress_messages: u64,
}

pub struct Negotiation {
    request: NegotiationRequest,
    version: ProtocolVersion,
    state: NegotiationState,
    sink: Arc<dyn LogSink>,
    chunk_size: usize,
    summary: FetchSummary,
}

impl Negotiation {
    pub fn new(
        request: NegotiationRequest,
        version: ProtocolVersion,
        sink: Arc<dyn LogSink>,
        chunk_size: usize,
    ) -> Self {
        Self {
            request,
            version,
            state: NegotiationState::Init,
            sink,
            chunk_size: chunk_size.max(1),
            summary: FetchSummary::default(),
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn request(&self) -> &NegotiationRequest {
        &self.request
    }

    fn side_band(&self) -> bool {
        self.version == ProtocolVersion::V2 || self.request.capabilities.side_band().is_some()
    }

    /// The complete fetch request for this session's dialect.
    pub fn request_body(&self) -> Result<Bytes, RelayError> {
        let mut writer = PacketWriter::new();
        if self.version == ProtocolVersion::V2 {
            writer.line("command=fetch")?;
            for cap in self.request.capabilities.iter() {
                if matches!(cap, Capability::Agent(_) | Capability::ObjectFormat(_)) {
                    writer.line(cap.to_string())?;
                }
            }
            writer.delim();
            if self.request.capabilities.contains(&Capability::OfsDelta) {
                writer.line("ofs-delta")?;
            }
            for want in &self.request.wants {
                writer.line(format!("want {want}"))?;
            }
            for have in &self.request.haves {
                writer.line(format!("have {have}"))?;
            }
            writer.line("done")?;
            writer.flush();
        } else {
            for (index, want) in self.request.wants.iter().enumerate() {
                if index == 0 && !self.request.capabilities.is_empty() {
                    writer.line(format!("want {want} {}", self.request.capabilities))?;
                } else {
                    writer.line(format!("want {want}"))?;
                }
            }
            writer.flush();
            for have in &self.request.haves {
                writer.line(format!("have {have}"))?;
            }
            writer.line("done")?;
        }
        Ok(writer.freeze())
    }

    /// Runs the dialogue on `session` and forwards every pack chunk into `pack`.
    ///
    /// With no wants nothing is sent and the state goes straight to `Done`.
    pub async fn run(
        &mut self,
        session: &mut dyn Session,
        pack: &PackSender,
    ) -> Result<FetchSummary, RelayError> {
        if self.request.wants.is_empty() {
            self.state = NegotiationState::Done;
            return Ok(self.summary);
        }
        match self.exchange(session, pack).await {
            Ok(()) => {
                self.state = NegotiationState::Done;
                tracing::debug!(
                    "fetched {} bytes in {} chunks",
                    self.summary.bytes,
                    self.summary.chunks
                );
                Ok(self.summary)
            }
            Err(e) => {
                self.state = NegotiationState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn exchange(
        &mut self,
        session: &mut dyn Session,
        pack: &PackSender,
    ) -> Result<(), RelayError> {
        self.state = NegotiationState::Negotiating;
        tracing::debug!(
            "negotiating {} wants, {} haves over {:?}",
            self.request.wants.len(),
            self.request.haves.len(),
            self.version
        );
        session.send(single_chunk(self.request_body()?)).await?;

        let reader = session.reader();
        match self.version {
            ProtocolVersion::V2 => self.read_v2_sections(reader).await?,
            _ => self.read_v1_acks(reader).await?,
        }

        self.state = NegotiationState::PackIncoming;
        if self.side_band() {
            self.forward_side_band(reader, pack).await
        } else {
            self.forward_raw(reader, pack).await
        }
    }

    /// Skips to the start of the `packfile` section.
    async fn read_v2_sections(
        &mut self,
        reader: &mut PacketReader<BoxedReader>,
    ) -> Result<(), RelayError> {
        loop {
            let header = match reader.expect_line().await? {
                PacketLine::Data(data) => line_text(&data),
                other => {
                    return Err(RelayError::malformed(format!(
                        "expected a section header, got {other:?}"
                    )));
                }
            };
            if let Some(message) = header.strip_prefix("ERR ") {
                return Err(RelayError::NegotiationFailed(message.to_string()));
            }
            match header.as_str() {
                "packfile" => return Ok(()),
                "acknowledgments" | "shallow-info" | "wanted-refs" | "packfile-uris" => {
                    let (lines, end) = reader.read_section().await?;
                    if header == "acknowledgments" {
                        for line in &lines {
                            tracing::trace!("source: {}", line_text(line));
                        }
                    }
                    if end != PacketLine::Delimiter {
                        return Err(RelayError::NegotiationFailed(format!(
                            "source ended the response after {header} without a pack"
                        )));
                    }
                }
                other => {
                    return Err(RelayError::mismatch(format!(
                        "unexpected fetch response section {other:?}"
                    )));
                }
            }
        }
    }

    /// Reads `ACK`/`NAK` lines up to the one that announces the pack.
    async fn read_v1_acks(
        &mut self,
        reader: &mut PacketReader<BoxedReader>,
    ) -> Result<(), RelayError> {
        loop {
            let text = match reader.expect_line().await? {
                PacketLine::Data(data) => line_text(&data),
                PacketLine::Flush => continue,
                other => {
                    return Err(RelayError::malformed(format!(
                        "unexpected {other:?} during negotiation"
                    )));
                }
            };
            if text == "NAK" {
                return Ok(());
            }
            if let Some(message) = text.strip_prefix("ERR ") {
                return Err(RelayError::NegotiationFailed(message.to_string()));
            }
            match text.strip_prefix("ACK ") {
                // `ACK <oid>` alone is the final acknowledgement; `common`, `ready` and
                // `continue` variants precede it.
                Some(rest) if !rest.contains(' ') => return Ok(()),
                Some(_) => continue,
                None => {
                    return Err(RelayError::mismatch(format!(
                        "unexpected negotiation line {text:?}"
                    )));
                }
            }
        }
    }

    async fn forward(&mut self, pack: &PackSender, chunk: Bytes) -> Result<(), RelayError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.summary.bytes += chunk.len() as u64;
        self.summary.chunks += 1;
        pack.send(Ok(chunk))
            .await
            .map_err(|_| RelayError::PackAborted)
    }

    async fn forward_side_band(
        &mut self,
        reader: &mut PacketReader<BoxedReader>,
        pack: &PackSender,
    ) -> Result<(), RelayError> {
        loop {
            let payload = match reader.read_line().await? {
                None | Some(PacketLine::Flush) | Some(PacketLine::ResponseEnd) => return Ok(()),
                Some(PacketLine::Delimiter) => {
                    return Err(RelayError::malformed("delimiter inside the pack stream"));
                }
                Some(PacketLine::Data(payload)) => payload,
            };
            match SideBand::demux(payload)? {
                SideBandFrame::Data(chunk) => self.forward(pack, chunk).await?,
                SideBandFrame::Progress(message) => {
                    self.summary.progress_messages += 1;
                    let text = String::from_utf8_lossy(&message);
                    for part in text.split(['\r', '\n']).filter(|p| !p.trim().is_empty()) {
                        self.sink.emit(Level::INFO, &format!("source: {}", part.trim_end()));
                    }
                }
                SideBandFrame::Error(message) => {
                    let text = line_text(&message);
                    self.sink.emit(Level::ERROR, &format!("source: {text}"));
                    return Err(RelayError::NegotiationFailed(text));
                }
            }
        }
    }

    async fn forward_raw(
        &mut self,
        reader: &mut PacketReader<BoxedReader>,
        pack: &PackSender,
    ) -> Result<(), RelayError> {
        while let Some(chunk) = reader.read_raw(self.chunk_size).await? {
            self.forward(pack, chunk).await?;
        }
        Ok(())
    }
}
