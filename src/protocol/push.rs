//! The target's side: ref-update commands, the pack that follows them, and the status report.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::Level;

use super::advertisement::Advertisement;
use super::pktline::{
    PacketLine, PacketReader, PacketWriter, SideBandFrame, decode_line, frame_length, line_text,
};
use super::types::{Capability, CapabilitySet, NUL, RefUpdate, SideBand};
use crate::errors::RelayError;
use crate::hash::HashKind;
use crate::sink::LogSink;
use crate::transport::BoxedReader;

/// Outcome for one ref as reported by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RefStatus {
    Ok,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    #[serde(serialize_with = "unpack_text")]
    pub unpack: Result<(), String>,
    pub per_ref: BTreeMap<String, RefStatus>,
}

fn unpack_text<S: serde::Serializer>(
    unpack: &Result<(), String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match unpack {
        Ok(()) => serializer.serialize_str("ok"),
        Err(reason) => serializer.serialize_str(reason),
    }
}

impl Default for PushReport {
    fn default() -> Self {
        Self {
            unpack: Ok(()),
            per_ref: BTreeMap::new(),
        }
    }
}

impl PushReport {
    /// What a target without `report-status` implies by closing cleanly.
    pub fn assumed_ok(commands: &[RefUpdate]) -> Self {
        Self {
            unpack: Ok(()),
            per_ref: commands
                .iter()
                .map(|c| (c.name.clone(), RefStatus::Ok))
                .collect(),
        }
    }

    /// Parses `unpack ...`, `ok <ref>` and `ng <ref> <reason>` lines.
    pub fn parse(lines: &[Bytes]) -> Result<Self, RelayError> {
        let mut unpack = None;
        let mut per_ref = BTreeMap::new();
        for line in lines {
            let text = line_text(line);
            if let Some(status) = text.strip_prefix("unpack ") {
                unpack = Some(match status {
                    "ok" => Ok(()),
                    reason => Err(reason.to_string()),
                });
            } else if let Some(name) = text.strip_prefix("ok ") {
                per_ref.insert(name.to_string(), RefStatus::Ok);
            } else if let Some(rest) = text.strip_prefix("ng ") {
                let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
                per_ref.insert(name.to_string(), RefStatus::Rejected(reason.to_string()));
            } else if text.starts_with("option ") {
                // report-status-v2 detail, not requested
            } else {
                tracing::warn!("ignoring report line {text:?}");
            }
        }
        let unpack = unpack.ok_or_else(|| RelayError::malformed("report without unpack status"))?;
        Ok(Self { unpack, per_ref })
    }

    /// Marks commands the target said nothing about as rejected.
    pub fn fill_missing(&mut self, commands: &[RefUpdate]) {
        for command in commands {
            self.per_ref
                .entry(command.name.clone())
                .or_insert_with(|| RefStatus::Rejected("no status reported".to_string()));
        }
    }

    pub fn rejected(&self) -> impl Iterator<Item = (&str, &str)> {
        self.per_ref.iter().filter_map(|(name, status)| match status {
            RefStatus::Rejected(reason) => Some((name.as_str(), reason.as_str())),
            RefStatus::Ok => None,
        })
    }

    /// True when the pack unpacked and every ref was accepted.
    pub fn overall(&self) -> bool {
        self.unpack.is_ok() && self.rejected().next().is_none()
    }
}

/// The commands sent to `git-receive-pack`, and the capabilities they request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub commands: Vec<RefUpdate>,
    /// Deletions dropped because the target does not accept them.
    pub skipped: Vec<RefUpdate>,
    pub capabilities: CapabilitySet,
}

impl PushRequest {
    pub fn new(
        updates: &[RefUpdate],
        target: &Advertisement,
        allow_atomic: bool,
        agent: &str,
        sink: &dyn LogSink,
    ) -> Self {
        let advertised = &target.capabilities;
        let mut capabilities = CapabilitySet::new();
        if advertised.contains(&Capability::ReportStatus) {
            capabilities.insert(Capability::ReportStatus);
        }
        if let Some(side_band) = advertised.side_band() {
            capabilities.insert(side_band);
        }
        if allow_atomic && advertised.contains(&Capability::Atomic) {
            capabilities.insert(Capability::Atomic);
        }
        if advertised.has_key("object-format") {
            capabilities.insert(Capability::ObjectFormat(target.object_format().to_string()));
        }
        if advertised.has_key("agent") {
            capabilities.insert(Capability::Agent(agent.to_string()));
        }

        let can_delete = advertised.contains(&Capability::DeleteRefs);
        let (commands, skipped): (Vec<_>, Vec<_>) = updates
            .iter()
            .cloned()
            .partition(|u| can_delete || !u.is_delete());
        for update in &skipped {
            sink.emit(
                Level::WARN,
                &format!("target does not accept deletions, keeping {}", update.name),
            );
        }
        Self {
            commands,
            skipped,
            capabilities,
        }
    }

    /// A pack is owed only when some command points a ref at an object.
    pub fn needs_pack(&self) -> bool {
        self.commands.iter().any(|c| !c.is_delete())
    }

    pub fn report_status(&self) -> bool {
        self.capabilities.contains(&Capability::ReportStatus)
    }

    pub fn side_band(&self) -> bool {
        self.capabilities.side_band().is_some()
    }

    /// The command list and its flush; capabilities ride on the first command after a NUL.
    pub fn encode_commands(&self) -> Result<Bytes, RelayError> {
        let mut writer = PacketWriter::new();
        for (index, command) in self.commands.iter().enumerate() {
            if index == 0 {
                writer.line(format!(
                    "{}{NUL} {}",
                    command.command_line(),
                    self.capabilities
                ))?;
            } else {
                writer.line(command.command_line())?;
            }
        }
        writer.flush();
        Ok(writer.freeze())
    }
}

/// A version 2 pack with no objects.
pub fn empty_pack(kind: HashKind) -> Bytes {
    let mut pack = BytesMut::with_capacity(12 + kind.size());
    pack.put_slice(b"PACK");
    pack.put_u32(2);
    pack.put_u32(0);
    match kind {
        HashKind::Sha1 => {
            let digest = Sha1::digest(&pack);
            pack.put_slice(&digest);
        }
        HashKind::Sha256 => {
            let digest = Sha256::digest(&pack);
            pack.put_slice(&digest);
        }
    }
    pack.freeze()
}

/// Reads the target's answer after the pack has been sent.
///
/// With side-band the report lines travel, themselves pkt-line framed, inside channel 1.
/// Without `report-status` there is nothing to parse and `None` is returned once the target
/// closes.
pub async fn read_report(
    reader: &mut PacketReader<BoxedReader>,
    request: &PushRequest,
    sink: &dyn LogSink,
) -> Result<Option<PushReport>, RelayError> {
    if !request.report_status() {
        while let Some(line) = reader.read_line().await? {
            if let PacketLine::Data(payload) = line
                && request.side_band()
            {
                relay_side_band(payload, sink)?;
            }
        }
        return Ok(None);
    }

    if !request.side_band() {
        let lines = reader.read_until_flush().await?;
        return PushReport::parse(&lines).map(Some);
    }

    let mut nested = BytesMut::new();
    let mut lines = Vec::new();
    let mut finished = false;
    while !finished {
        let payload = match reader.read_line().await? {
            None | Some(PacketLine::Flush) => break,
            Some(PacketLine::Data(payload)) => payload,
            Some(other) => {
                return Err(RelayError::malformed(format!(
                    "unexpected {other:?} in push report"
                )));
            }
        };
        let Some(data) = relay_side_band(payload, sink)? else {
            continue;
        };
        nested.extend_from_slice(&data);
        while nested.len() >= 4 {
            let length = frame_length(&nested)?;
            if nested.len() < length {
                break;
            }
            let mut frame = nested.split_to(length).freeze();
            match decode_line(&mut frame)? {
                PacketLine::Data(line) => lines.push(line),
                PacketLine::Flush => {
                    finished = true;
                    break;
                }
                other => {
                    return Err(RelayError::malformed(format!(
                        "unexpected {other:?} inside push report"
                    )));
                }
            }
        }
    }
    PushReport::parse(&lines).map(Some)
}

/// Channel 2 goes to the sink, channel 3 fails the push, channel 1 is handed back.
fn relay_side_band(payload: Bytes, sink: &dyn LogSink) -> Result<Option<Bytes>, RelayError> {
    match SideBand::demux(payload)? {
        SideBandFrame::Data(data) => Ok(Some(data)),
        SideBandFrame::Progress(message) => {
            let text = String::from_utf8_lossy(&message);
            for part in text.split(['\r', '\n']).filter(|p| !p.trim().is_empty()) {
                sink.emit(Level::INFO, &format!("target: {}", part.trim_end()));
            }
            Ok(None)
        }
        SideBandFrame::Error(message) => {
            let text = line_text(&message);
            sink.emit(Level::ERROR, &format!("target: {text}"));
            Err(RelayError::PushFailed(text))
        }
    }
}
