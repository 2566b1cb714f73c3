//! pkt-line framing and side-band demultiplexing.
//!
//! Every smart-protocol message is a sequence of pkt-lines: four lower-case hex digits giving the
//! total length (header included) followed by the payload. Lengths below four are control
//! packets: `0000` flush, `0001` delimiter and `0002` response-end (the last two only in protocol
//! v2). Nothing here knows about refs or negotiation.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{MAX_PKT_LEN, MAX_PKT_PAYLOAD, SideBand};
use crate::errors::RelayError;

pub const PKT_FLUSH: &[u8; 4] = b"0000";
pub const PKT_DELIM: &[u8; 4] = b"0001";
pub const PKT_RESPONSE_END: &[u8; 4] = b"0002";

/// One decoded pkt-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketLine {
    Data(Bytes),
    Flush,
    Delimiter,
    ResponseEnd,
}

impl PacketLine {
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            PacketLine::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Payload as text with a single trailing LF removed.
    pub fn text(&self) -> Option<String> {
        self.data().map(|data| line_text(data))
    }
}

/// Lossy text view of a payload with a single trailing LF removed.
pub fn line_text(data: &[u8]) -> String {
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    String::from_utf8_lossy(data).into_owned()
}

/// Frames `payload` as a single pkt-line.
pub fn encode_line(payload: impl AsRef<[u8]>) -> Result<Bytes, RelayError> {
    let mut buf = BytesMut::new();
    add_pkt_line(&mut buf, payload)?;
    Ok(buf.freeze())
}

pub fn encode_flush() -> Bytes {
    Bytes::from_static(PKT_FLUSH)
}

pub fn encode_delim() -> Bytes {
    Bytes::from_static(PKT_DELIM)
}

/// Append a pkt-line with the proper length prefix.
pub fn add_pkt_line(buf: &mut BytesMut, payload: impl AsRef<[u8]>) -> Result<(), RelayError> {
    let payload = payload.as_ref();
    if payload.len() > MAX_PKT_PAYLOAD {
        return Err(RelayError::FrameTooLarge(payload.len() + 4));
    }
    let length = payload.len() + 4;
    buf.reserve(length);
    buf.put(format!("{length:04x}").as_bytes());
    buf.put(payload);
    Ok(())
}

/// Frames `data` on a side-band channel.
pub fn encode_sideband(channel: SideBand, data: &[u8]) -> Result<Bytes, RelayError> {
    let mut payload = BytesMut::with_capacity(data.len() + 1);
    payload.put_u8(channel.value());
    payload.put(data);
    encode_line(payload)
}

fn parse_length(header: &[u8]) -> Result<usize, RelayError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| RelayError::malformed(format!("non-ASCII length header {header:?}")))?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RelayError::malformed(format!(
            "invalid length header {text:?}"
        )));
    }
    let length = usize::from_str_radix(text, 16)
        .map_err(|_| RelayError::malformed(format!("invalid length header {text:?}")))?;
    if length > MAX_PKT_LEN {
        return Err(RelayError::malformed(format!(
            "length {length} exceeds {MAX_PKT_LEN}"
        )));
    }
    Ok(length)
}

fn control_packet(length: usize) -> Result<Option<PacketLine>, RelayError> {
    match length {
        0 => Ok(Some(PacketLine::Flush)),
        1 => Ok(Some(PacketLine::Delimiter)),
        2 => Ok(Some(PacketLine::ResponseEnd)),
        3 => Err(RelayError::malformed("reserved length 0003")),
        _ => Ok(None),
    }
}

/// Total size of the frame starting with `header` (at least four bytes), header included.
pub fn frame_length(header: &[u8]) -> Result<usize, RelayError> {
    let header = header
        .get(..4)
        .ok_or_else(|| RelayError::malformed("truncated length header"))?;
    let length = parse_length(header)?;
    Ok(match control_packet(length)? {
        Some(_) => 4,
        None => length,
    })
}

/// Decodes one pkt-line from the front of `bytes`, consuming it.
pub fn decode_line(bytes: &mut Bytes) -> Result<PacketLine, RelayError> {
    if bytes.len() < 4 {
        return Err(RelayError::malformed(format!(
            "truncated length header ({} bytes)",
            bytes.len()
        )));
    }
    let length = parse_length(&bytes[..4])?;
    if let Some(control) = control_packet(length)? {
        bytes.advance(4);
        return Ok(control);
    }
    if bytes.len() < length {
        return Err(RelayError::malformed(format!(
            "truncated payload: need {} bytes, have {}",
            length - 4,
            bytes.len() - 4
        )));
    }
    bytes.advance(4);
    Ok(PacketLine::Data(bytes.split_to(length - 4)))
}

/// One demultiplexed side-band packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideBandFrame {
    Data(Bytes),
    Progress(Bytes),
    Error(Bytes),
}

impl SideBand {
    /// Splits the channel byte off a side-band payload.
    pub fn demux(mut payload: Bytes) -> Result<SideBandFrame, RelayError> {
        if payload.is_empty() {
            return Err(RelayError::malformed("empty side-band packet"));
        }
        let channel = SideBand::try_from(payload.get_u8())?;
        Ok(match channel {
            SideBand::PackfileData => SideBandFrame::Data(payload),
            SideBand::ProgressInfo => SideBandFrame::Progress(payload),
            SideBand::Error => SideBandFrame::Error(payload),
        })
    }
}

/// Builds a request body out of pkt-lines.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text` followed by LF.
    pub fn line(&mut self, text: impl AsRef<str>) -> Result<&mut Self, RelayError> {
        let text = text.as_ref();
        let mut payload = BytesMut::with_capacity(text.len() + 1);
        payload.put(text.as_bytes());
        payload.put_u8(b'\n');
        add_pkt_line(&mut self.buf, payload)?;
        Ok(self)
    }

    pub fn raw(&mut self, payload: impl AsRef<[u8]>) -> Result<&mut Self, RelayError> {
        add_pkt_line(&mut self.buf, payload)?;
        Ok(self)
    }

    pub fn flush(&mut self) -> &mut Self {
        self.buf.put(&PKT_FLUSH[..]);
        self
    }

    pub fn delim(&mut self) -> &mut Self {
        self.buf.put(&PKT_DELIM[..]);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

async fn with_idle_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, RelayError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RelayError::timeout(format!("no data for {}s", limit.as_secs_f32())))?
            .map_err(RelayError::from),
        None => fut.await.map_err(RelayError::from),
    }
}

/// Reads pkt-lines from an async byte source.
///
/// A clean end of stream before a length header yields `Ok(None)`; end of stream inside a
/// packet is a [`RelayError::MalformedFrame`]. One line can be pushed back with
/// [`PacketReader::unread`].
pub struct PacketReader<R> {
    inner: R,
    unread: Option<PacketLine>,
    idle_timeout: Option<Duration>,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            unread: None,
            idle_timeout: None,
            bytes_read: 0,
        }
    }

    pub fn with_idle_timeout(mut self, limit: Option<Duration>) -> Self {
        self.idle_timeout = limit;
        self
    }

    /// Total bytes consumed from the underlying source.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Pushes a line back so the next read returns it.
    pub fn unread(&mut self, line: PacketLine) {
        debug_assert!(self.unread.is_none(), "only one line can be pushed back");
        self.unread = Some(line);
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize, RelayError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = with_idle_timeout(self.idle_timeout, self.inner.read(&mut buf[filled..])).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.bytes_read += filled as u64;
        Ok(filled)
    }

    pub async fn read_line(&mut self) -> Result<Option<PacketLine>, RelayError> {
        if let Some(line) = self.unread.take() {
            return Ok(Some(line));
        }

        let mut header = [0u8; 4];
        match self.fill(&mut header).await? {
            0 => return Ok(None),
            4 => {}
            n => {
                return Err(RelayError::malformed(format!(
                    "truncated length header ({n} bytes)"
                )));
            }
        }
        let length = parse_length(&header)?;
        if let Some(control) = control_packet(length)? {
            return Ok(Some(control));
        }

        let mut payload = vec![0u8; length - 4];
        let got = self.fill(&mut payload).await?;
        if got < payload.len() {
            return Err(RelayError::malformed(format!(
                "truncated payload: need {} bytes, have {got}",
                payload.len()
            )));
        }
        let line = PacketLine::Data(Bytes::from(payload));
        tracing::trace!("pkt line: {:?}", line);
        Ok(Some(line))
    }

    /// Like [`PacketReader::read_line`], but end of stream is an error.
    pub async fn expect_line(&mut self) -> Result<PacketLine, RelayError> {
        self.read_line()
            .await?
            .ok_or_else(|| RelayError::malformed("unexpected end of stream"))
    }

    /// Reads data lines up to the next flush or delimiter, returning them with the terminator.
    pub async fn read_section(&mut self) -> Result<(Vec<Bytes>, PacketLine), RelayError> {
        let mut lines = Vec::new();
        loop {
            match self.expect_line().await? {
                PacketLine::Data(data) => lines.push(data),
                terminator => return Ok((lines, terminator)),
            }
        }
    }

    /// Reads data lines up to the next flush.
    pub async fn read_until_flush(&mut self) -> Result<Vec<Bytes>, RelayError> {
        let mut lines = Vec::new();
        loop {
            match self.expect_line().await? {
                PacketLine::Data(data) => lines.push(data),
                PacketLine::Flush => return Ok(lines),
                other => {
                    return Err(RelayError::malformed(format!(
                        "unexpected {other:?} before flush"
                    )));
                }
            }
        }
    }

    /// Reads up to `max` unframed bytes; `None` at end of stream.
    pub async fn read_raw(&mut self, max: usize) -> Result<Option<Bytes>, RelayError> {
        if let Some(line) = self.unread.take() {
            return Err(RelayError::malformed(format!(
                "raw read after pushed back {line:?}"
            )));
        }
        let mut buf = vec![0u8; max];
        let n = with_idle_timeout(self.idle_timeout, self.inner.read(&mut buf)).await?;
        if n == 0 {
            return Ok(None);
        }
        self.bytes_read += n as u64;
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}
