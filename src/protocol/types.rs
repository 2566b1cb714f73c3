use std::collections::BTreeSet;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use futures::stream::Stream;
use serde::Serialize;

use crate::errors::RelayError;
use crate::hash::{HashKind, ObjectId};

/// A stream of body chunks flowing into or out of a session.
pub type ProtocolStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

/// A body made of a single, already assembled request.
pub fn single_chunk(body: Bytes) -> ProtocolStream {
    Box::pin(futures::stream::iter([Ok(body)]))
}

/// Git service types for smart protocol
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ServiceType {
    UploadPack,
    ReceivePack,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceType::UploadPack => write!(f, "git-upload-pack"),
            ServiceType::ReceivePack => write!(f, "git-receive-pack"),
        }
    }
}

/// Which side of the relay a session serves.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Role {
    /// Read refs and objects from the source (`git-upload-pack`).
    Fetch,
    /// Update refs on the target (`git-receive-pack`).
    Push,
}

impl Role {
    pub fn service(&self) -> ServiceType {
        match self {
            Role::Fetch => ServiceType::UploadPack,
            Role::Push => ServiceType::ReceivePack,
        }
    }

    /// Protocol version the client asks for. receive-pack has no v2 dialect.
    pub fn requested_version(&self) -> ProtocolVersion {
        match self {
            Role::Fetch => ProtocolVersion::V2,
            Role::Push => ProtocolVersion::V0,
        }
    }
}

/// Wire dialect spoken by a session.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize)]
pub enum ProtocolVersion {
    #[default]
    V0,
    V1,
    V2,
}

impl ProtocolVersion {
    /// Value of the `GIT_PROTOCOL` environment variable / `Git-Protocol` header, if any.
    pub fn git_protocol_value(&self) -> Option<&'static str> {
        match self {
            ProtocolVersion::V0 => None,
            ProtocolVersion::V1 => Some("version=1"),
            ProtocolVersion::V2 => Some("version=2"),
        }
    }
}

/// Git protocol capabilities
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    MultiAck,
    MultiAckDetailed,
    NoDone,
    SideBand,
    SideBand64k,
    ReportStatus,
    ReportStatusv2,
    OfsDelta,
    ThinPack,
    NoThin,
    Shallow,
    IncludeTag,
    DeleteRefs,
    Quiet,
    Atomic,
    NoProgress,
    WaitForDone,
    AllowTipSha1InWant,
    AllowReachableSha1InWant,
    PushOptions,
    ObjectFormat(String),
    Symref(String),
    SessionId(String),
    Agent(String),
    /// v2 capability lines such as `fetch=shallow wait-for-done` or `ls-refs=unborn`, and any
    /// token this crate does not interpret.
    Unknown(String),
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("agent=") {
            return Ok(Capability::Agent(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("object-format=") {
            return Ok(Capability::ObjectFormat(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("symref=") {
            return Ok(Capability::Symref(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("session-id=") {
            return Ok(Capability::SessionId(rest.to_string()));
        }

        match s {
            "multi_ack" => Ok(Capability::MultiAck),
            "multi_ack_detailed" => Ok(Capability::MultiAckDetailed),
            "no-done" => Ok(Capability::NoDone),
            "side-band" => Ok(Capability::SideBand),
            "side-band-64k" => Ok(Capability::SideBand64k),
            "report-status" => Ok(Capability::ReportStatus),
            "report-status-v2" => Ok(Capability::ReportStatusv2),
            "ofs-delta" => Ok(Capability::OfsDelta),
            "thin-pack" => Ok(Capability::ThinPack),
            "no-thin" => Ok(Capability::NoThin),
            "shallow" => Ok(Capability::Shallow),
            "include-tag" => Ok(Capability::IncludeTag),
            "delete-refs" => Ok(Capability::DeleteRefs),
            "quiet" => Ok(Capability::Quiet),
            "atomic" => Ok(Capability::Atomic),
            "no-progress" => Ok(Capability::NoProgress),
            "wait-for-done" => Ok(Capability::WaitForDone),
            "allow-tip-sha1-in-want" => Ok(Capability::AllowTipSha1InWant),
            "allow-reachable-sha1-in-want" => Ok(Capability::AllowReachableSha1InWant),
            "push-options" => Ok(Capability::PushOptions),
            _ => Ok(Capability::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::MultiAck => write!(f, "multi_ack"),
            Capability::MultiAckDetailed => write!(f, "multi_ack_detailed"),
            Capability::NoDone => write!(f, "no-done"),
            Capability::SideBand => write!(f, "side-band"),
            Capability::SideBand64k => write!(f, "side-band-64k"),
            Capability::ReportStatus => write!(f, "report-status"),
            Capability::ReportStatusv2 => write!(f, "report-status-v2"),
            Capability::OfsDelta => write!(f, "ofs-delta"),
            Capability::ThinPack => write!(f, "thin-pack"),
            Capability::NoThin => write!(f, "no-thin"),
            Capability::Shallow => write!(f, "shallow"),
            Capability::IncludeTag => write!(f, "include-tag"),
            Capability::DeleteRefs => write!(f, "delete-refs"),
            Capability::Quiet => write!(f, "quiet"),
            Capability::Atomic => write!(f, "atomic"),
            Capability::NoProgress => write!(f, "no-progress"),
            Capability::WaitForDone => write!(f, "wait-for-done"),
            Capability::AllowTipSha1InWant => write!(f, "allow-tip-sha1-in-want"),
            Capability::AllowReachableSha1InWant => write!(f, "allow-reachable-sha1-in-want"),
            Capability::PushOptions => write!(f, "push-options"),
            Capability::ObjectFormat(format) => write!(f, "object-format={format}"),
            Capability::Symref(value) => write!(f, "symref={value}"),
            Capability::SessionId(id) => write!(f, "session-id={id}"),
            Capability::Agent(agent) => write!(f, "agent={agent}"),
            Capability::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// The capabilities a remote advertised, in wire order without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    caps: Vec<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a space separated v0/v1 capability list.
    pub fn parse_list(list: &str) -> Self {
        list.split_whitespace()
            .filter_map(|token| token.parse::<Capability>().ok())
            .collect()
    }

    pub fn insert(&mut self, cap: Capability) {
        if !self.caps.contains(&cap) {
            self.caps.push(cap);
        }
    }

    pub fn contains(&self, cap: &Capability) -> bool {
        self.caps.contains(cap)
    }

    /// Whether a capability named `key` is present, either bare or as `key=value`.
    pub fn has_key(&self, key: &str) -> bool {
        self.value_of(key).is_some()
    }

    /// The value of a `key=value` capability; `Some("")` for a bare `key`.
    pub fn value_of(&self, key: &str) -> Option<String> {
        self.caps.iter().find_map(|cap| {
            let text = cap.to_string();
            if text == key {
                Some(String::new())
            } else {
                text.strip_prefix(key)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(str::to_string)
            }
        })
    }

    /// Object format the remote uses; SHA-1 unless announced otherwise.
    pub fn object_format(&self) -> HashKind {
        self.caps
            .iter()
            .find_map(|cap| match cap {
                Capability::ObjectFormat(fmt) => fmt.parse().ok(),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Side-band flavour available, preferring the 64k variant.
    pub fn side_band(&self) -> Option<Capability> {
        if self.contains(&Capability::SideBand64k) {
            Some(Capability::SideBand64k)
        } else if self.contains(&Capability::SideBand) {
            Some(Capability::SideBand)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.iter()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::new();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cap in &self.caps {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{cap}")?;
            first = false;
        }
        Ok(())
    }
}

/// Side-band channels multiplexed over one pkt-line stream.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SideBand {
    /// Sideband 1 contains packfile data
    PackfileData,
    /// Sideband 2 contains progress information
    ProgressInfo,
    /// Sideband 3 contains error information
    Error,
}

impl SideBand {
    pub fn value(&self) -> u8 {
        match self {
            Self::PackfileData => b'\x01',
            Self::ProgressInfo => b'\x02',
            Self::Error => b'\x03',
        }
    }
}

impl TryFrom<u8> for SideBand {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, RelayError> {
        match value {
            1 => Ok(SideBand::PackfileData),
            2 => Ok(SideBand::ProgressInfo),
            3 => Ok(SideBand::Error),
            other => Err(RelayError::UnknownSidebandChannel(other)),
        }
    }
}

/// Git reference information
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ref {
    pub name: String,
    pub target: ObjectId,
    /// Object the ref points to after peeling annotated tags.
    pub peeled: Option<ObjectId>,
    /// For symbolic refs (v2 `symref-target`), the ref they point at.
    pub symref_target: Option<String>,
}

impl Ref {
    pub fn new(name: impl Into<String>, target: ObjectId) -> Self {
        Self {
            name: name.into(),
            target,
            peeled: None,
            symref_target: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum CommandType {
    Create,
    Update,
    Delete,
}

/// One ref update sent to receive-pack: `old new name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefUpdate {
    pub name: String,
    pub old: ObjectId,
    pub new: ObjectId,
}

impl RefUpdate {
    pub fn new(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }

    pub fn command_type(&self) -> CommandType {
        if self.new.is_zero() {
            CommandType::Delete
        } else if self.old.is_zero() {
            CommandType::Create
        } else {
            CommandType::Update
        }
    }

    pub fn is_delete(&self) -> bool {
        self.command_type() == CommandType::Delete
    }

    /// The command line as written to receive-pack (without capabilities or newline).
    pub fn command_line(&self) -> String {
        format!("{}{SP}{}{SP}{}", self.old, self.new, self.name)
    }
}

impl fmt::Display for RefUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command_type() {
            CommandType::Create => write!(f, "CREATE {} {}", self.name, self.new),
            CommandType::Delete => write!(f, "DELETE {} {}", self.name, self.old),
            CommandType::Update => write!(f, "UPDATE {} {}..{}", self.name, self.old, self.new),
        }
    }
}

/// Ids the remote wants us to fetch or pushes, deduplicated and ordered.
pub type ObjectSet = BTreeSet<ObjectId>;

/// Protocol constants
pub const LF: char = '\n';
pub const SP: char = ' ';
pub const NUL: char = '\0';

/// Largest encoded pkt-line, header included.
pub const MAX_PKT_LEN: usize = 65520;
/// Largest payload that fits in one pkt-line.
pub const MAX_PKT_PAYLOAD: usize = MAX_PKT_LEN - 4;

/// Pseudo-ref name used by servers to carry capabilities when they have no refs.
pub const CAPABILITIES_PSEUDO_REF: &str = "capabilities^{}";

/// Agent string sent to remotes.
pub const AGENT: &str = concat!("git-relay/", env!("CARGO_PKG_VERSION"));
