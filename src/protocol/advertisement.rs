//! Parsing of the ref advertisement a remote sends when a session opens, and of protocol v2
//! `ls-refs` output.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::io::AsyncRead;

use super::pktline::{PacketLine, PacketReader, PacketWriter, line_text};
use super::types::{
    AGENT, CAPABILITIES_PSEUDO_REF, Capability, CapabilitySet, ProtocolVersion, Ref,
    single_chunk,
};
use crate::errors::RelayError;
use crate::hash::{HashKind, ObjectId};
use crate::transport::Session;

/// Refs and capabilities announced by a remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub version: ProtocolVersion,
    /// Advertised refs in wire order. Always empty for v2, whose refs come from `ls-refs`.
    pub refs: Vec<Ref>,
    pub capabilities: CapabilitySet,
}

impl Advertisement {
    /// Reads the advertisement up to its terminating flush.
    pub async fn read<R: AsyncRead + Unpin>(
        reader: &mut PacketReader<R>,
    ) -> Result<Self, RelayError> {
        let first = reader.read_line().await?.ok_or_else(|| {
            RelayError::connection("remote closed the connection before advertising refs")
        })?;
        reader.unread(first);
        let lines = reader.read_until_flush().await?;
        Self::parse(&lines)
    }

    /// Parses the data lines of an advertisement (without the terminating flush).
    pub fn parse(lines: &[Bytes]) -> Result<Self, RelayError> {
        let Some(first) = lines.first() else {
            tracing::debug!("empty advertisement, repository has no refs");
            return Ok(Advertisement::default());
        };

        let first_text = line_text(first);
        if let Some(message) = first_text.strip_prefix("ERR ") {
            return Err(RelayError::connection(format!("remote error: {message}")));
        }
        match first_text.as_str() {
            "version 2" => Ok(Self::parse_v2(&lines[1..])),
            "version 1" => Self::parse_refs(ProtocolVersion::V1, &lines[1..]),
            text if text.starts_with("version ") => Err(RelayError::mismatch(format!(
                "unsupported protocol {text:?}"
            ))),
            _ => {
                let (id, _) = ObjectId::parse_prefix(&first_text).map_err(|_| {
                    RelayError::mismatch(format!("unexpected advertisement line {first_text:?}"))
                })?;
                tracing::trace!("first advertised id {id}");
                Self::parse_refs(ProtocolVersion::V0, lines)
            }
        }
    }

    fn parse_v2(lines: &[Bytes]) -> Self {
        let capabilities = lines
            .iter()
            .filter_map(|line| line_text(line).parse::<Capability>().ok())
            .collect();
        Advertisement {
            version: ProtocolVersion::V2,
            refs: Vec::new(),
            capabilities,
        }
    }

    fn parse_refs(version: ProtocolVersion, lines: &[Bytes]) -> Result<Self, RelayError> {
        let mut refs: Vec<Ref> = Vec::new();
        let mut capabilities = CapabilitySet::new();

        for (index, line) in lines.iter().enumerate() {
            // capabilities ride on the first line, after a NUL
            let ref_bytes = match memchr::memchr(0, line) {
                Some(pos) if index == 0 => {
                    capabilities = CapabilitySet::parse_list(&line_text(&line[pos + 1..]));
                    &line[..pos]
                }
                _ => &line[..],
            };
            let ref_part = line_text(ref_bytes);

            if ref_part.starts_with("shallow ") {
                continue;
            }

            let (id, name) = ObjectId::parse_prefix(&ref_part)
                .map_err(|e| RelayError::malformed(format!("bad ref line {ref_part:?}: {e}")))?;
            if name.is_empty() {
                return Err(RelayError::malformed(format!(
                    "ref line without a name: {ref_part:?}"
                )));
            }
            if name == CAPABILITIES_PSEUDO_REF {
                continue;
            }

            if let Some(base) = name.strip_suffix("^{}") {
                match refs.iter_mut().rev().find(|r| r.name == base) {
                    Some(tagged) => tagged.peeled = Some(id),
                    None => tracing::warn!("peeled entry for unknown ref {base}"),
                }
                continue;
            }

            if refs.iter().any(|r| r.name == name) {
                tracing::warn!("duplicate advertised ref {name}, keeping the first");
                continue;
            }
            refs.push(Ref::new(name, id));
        }

        for cap in capabilities.iter() {
            if let Capability::Symref(value) = cap
                && let Some((from, to)) = value.split_once(':')
                && let Some(symref) = refs.iter_mut().find(|r| r.name == from)
            {
                symref.symref_target = Some(to.to_string());
            }
        }

        let advertisement = Advertisement {
            version,
            refs,
            capabilities,
        };
        advertisement.check_object_format()?;
        Ok(advertisement)
    }

    fn check_object_format(&self) -> Result<(), RelayError> {
        let kind = self.object_format();
        match self.refs.iter().find(|r| r.target.kind() != kind) {
            Some(r) => Err(RelayError::mismatch(format!(
                "ref {} uses {} ids but the remote announced {kind}",
                r.name,
                r.target.kind()
            ))),
            None => Ok(()),
        }
    }

    pub fn object_format(&self) -> HashKind {
        self.capabilities.object_format()
    }

    pub fn find(&self, name: &str) -> Option<&Ref> {
        self.refs.iter().find(|r| r.name == name)
    }

    /// Ref name to tip, as used for mirror planning.
    pub fn ref_map(&self) -> BTreeMap<String, ObjectId> {
        self.refs
            .iter()
            .map(|r| (r.name.clone(), r.target))
            .collect()
    }
}

/// Parses v2 `ls-refs` output: `oid name [symref-target:<ref>] [peeled:<oid>]`.
pub fn parse_ls_refs(lines: &[Bytes]) -> Result<Vec<Ref>, RelayError> {
    let mut refs = Vec::with_capacity(lines.len());
    for line in lines {
        let text = line_text(line);
        let mut parts = text.split(' ');
        let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
            return Err(RelayError::malformed(format!("bad ls-refs line {text:?}")));
        };
        if id == "unborn" {
            continue;
        }
        let target = id
            .parse::<ObjectId>()
            .map_err(|e| RelayError::malformed(format!("bad ls-refs line {text:?}: {e}")))?;
        let mut r = Ref::new(name, target);
        for attr in parts {
            if let Some(symref) = attr.strip_prefix("symref-target:") {
                r.symref_target = Some(symref.to_string());
            } else if let Some(peeled) = attr.strip_prefix("peeled:") {
                r.peeled = Some(peeled.parse().map_err(|e| {
                    RelayError::malformed(format!("bad peeled id in {text:?}: {e}"))
                })?);
            }
        }
        refs.push(r);
    }
    Ok(refs)
}

/// Builds a v2 `ls-refs` request restricted to `prefix`.
pub fn ls_refs_request(
    advertisement: &Advertisement,
    prefix: &str,
    agent: &str,
) -> Result<Bytes, RelayError> {
    let mut writer = PacketWriter::new();
    writer.line("command=ls-refs")?;
    if advertisement.capabilities.has_key("agent") {
        writer.line(format!("agent={agent}"))?;
    }
    if advertisement.capabilities.has_key("object-format") {
        writer.line(format!("object-format={}", advertisement.object_format()))?;
    }
    writer.delim();
    writer.line("peel")?.line("symrefs")?;
    if !prefix.is_empty() {
        writer.line(format!("ref-prefix {prefix}"))?;
    }
    writer.flush();
    Ok(writer.freeze())
}

/// Lists the refs of a fetch session under `prefix`.
///
/// v2 sessions issue `ls-refs`; older dialects answer from the opening advertisement.
pub async fn list_refs(
    session: &mut dyn Session,
    advertisement: &Advertisement,
    prefix: &str,
) -> Result<Vec<Ref>, RelayError> {
    if advertisement.version != ProtocolVersion::V2 {
        return Ok(advertisement
            .refs
            .iter()
            .filter(|r| r.name.starts_with(prefix))
            .cloned()
            .collect());
    }
    if !advertisement.capabilities.has_key("ls-refs") {
        return Err(RelayError::mismatch("v2 remote does not offer ls-refs"));
    }

    let request = ls_refs_request(advertisement, prefix, AGENT)?;
    session.send(single_chunk(request)).await?;
    let reader = session.reader();
    let mut lines = Vec::new();
    loop {
        match reader.expect_line().await? {
            PacketLine::Data(data) => lines.push(data),
            PacketLine::Flush => break,
            PacketLine::ResponseEnd => break,
            PacketLine::Delimiter => {
                return Err(RelayError::malformed("delimiter in ls-refs response"));
            }
        }
    }
    let refs = parse_ls_refs(&lines)?;
    tracing::debug!("ls-refs returned {} refs", refs.len());
    Ok(refs)
}
