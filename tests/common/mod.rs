//! In-memory remotes for integration tests: each opened session is one end of a tokio duplex
//! pipe, and a scripted "server" task plays upload-pack or receive-pack on the other end.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::task::JoinHandle;

use git_relay::errors::RelayError;
use git_relay::hash::ObjectId;
use git_relay::protocol::pktline::{PacketLine, PacketReader, encode_line, encode_sideband, line_text};
use git_relay::protocol::{ProtocolStream, Role, SideBand};
use git_relay::transport::BoxedReader;
use git_relay::{Endpoint, Session, Transport};

pub const FLUSH: &[u8] = b"0000";

pub fn id(c: char) -> ObjectId {
    c.to_string().repeat(40).parse().unwrap()
}

pub fn zero() -> ObjectId {
    "0".repeat(40).parse().unwrap()
}

pub fn pkt(text: impl AsRef<str>) -> Vec<u8> {
    encode_line(text.as_ref()).unwrap().to_vec()
}

pub fn band(channel: SideBand, data: &[u8]) -> Vec<u8> {
    encode_sideband(channel, data).unwrap().to_vec()
}

/// A v0 advertisement; an empty repository advertises `capabilities^{}`.
pub fn advertisement(refs: &[(&str, ObjectId)], caps: &str) -> Vec<u8> {
    let mut out = Vec::new();
    match refs.split_first() {
        None => out.extend(pkt(format!("{} capabilities^{{}}\0{caps}\n", zero()))),
        Some(((name, oid), rest)) => {
            out.extend(pkt(format!("{oid} {name}\0{caps}\n")));
            for (name, oid) in rest {
                out.extend(pkt(format!("{oid} {name}\n")));
            }
        }
    }
    out.extend_from_slice(FLUSH);
    out
}

/// What the scripted servers observed, in order.
#[derive(Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    pub fn push(&self, line: impl Into<String>) {
        self.0.lock().unwrap().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

type Server = Box<dyn Fn(DuplexStream) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ScriptedTransport {
    server: Server,
    refuse: Option<RelayError>,
    opens: AtomicUsize,
    servers: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptedTransport {
    pub fn new<F, Fut>(server: F) -> Arc<Self>
    where
        F: Fn(DuplexStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            server: Box::new(move |io: DuplexStream| server(io).boxed()),
            refuse: None,
            opens: AtomicUsize::new(0),
            servers: Mutex::new(Vec::new()),
        })
    }

    /// Every open fails with `error`.
    pub fn refusing(error: RelayError) -> Arc<Self> {
        Arc::new(Self {
            server: Box::new(|_: DuplexStream| async {}.boxed()),
            refuse: Some(error),
            opens: AtomicUsize::new(0),
            servers: Mutex::new(Vec::new()),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Waits for every server task spawned so far.
    pub async fn finished(&self) {
        let handles: Vec<_> = self.servers.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, endpoint: &Endpoint, role: Role) -> Result<Box<dyn Session>, RelayError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.refuse {
            return Err(match error {
                RelayError::AuthRejected(m) => RelayError::AuthRejected(m.clone()),
                other => RelayError::connection(other.to_string()),
            });
        }
        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn((self.server)(server));
        self.servers.lock().unwrap().push(handle);
        let (read, write) = tokio::io::split(client);
        Ok(Box::new(ScriptedSession {
            endpoint: endpoint.clone(),
            role,
            reader: PacketReader::new(Box::new(read) as BoxedReader),
            writer: Some(write),
        }))
    }
}

struct ScriptedSession {
    endpoint: Endpoint,
    role: Role,
    reader: PacketReader<BoxedReader>,
    writer: Option<WriteHalf<DuplexStream>>,
}

#[async_trait]
impl Session for ScriptedSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn role(&self) -> Role {
        self.role
    }

    fn reader(&mut self) -> &mut PacketReader<BoxedReader> {
        &mut self.reader
    }

    async fn send(&mut self, mut body: ProtocolStream) -> Result<(), RelayError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RelayError::connection("closed"))?;
        while let Some(chunk) = body.next().await {
            writer.write_all(&chunk?).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}

/// Plays a v0 `git-upload-pack`: advertises, records wants and haves, then writes `response`.
pub async fn upload_pack(io: DuplexStream, adv: Vec<u8>, response: Vec<u8>, log: Transcript) {
    let (read, mut write) = tokio::io::split(io);
    write.write_all(&adv).await.unwrap();
    let mut reader = PacketReader::new(read);
    loop {
        match reader.read_line().await {
            Ok(Some(PacketLine::Data(data))) => log.push(line_text(&data)),
            Ok(Some(PacketLine::Flush)) => break,
            _ => {
                log.push("upload-pack: no request");
                return;
            }
        }
    }
    loop {
        match reader.read_line().await {
            Ok(Some(PacketLine::Data(data))) => {
                let text = line_text(&data);
                log.push(text.clone());
                if text == "done" {
                    break;
                }
            }
            Ok(Some(_)) => {}
            _ => {
                log.push("upload-pack: hung up during negotiation");
                return;
            }
        }
    }
    let _ = write.write_all(&response).await;
    let _ = write.flush().await;
}

/// Plays `git-receive-pack`: advertises, records commands, reads `pack_len` pack bytes when
/// `pack_len > 0`, then writes `report`.
pub async fn receive_pack(
    io: DuplexStream,
    adv: Vec<u8>,
    pack_len: usize,
    report: Vec<u8>,
    log: Transcript,
) {
    let (read, mut write) = tokio::io::split(io);
    write.write_all(&adv).await.unwrap();
    let mut reader = PacketReader::new(read);
    let mut commands = 0;
    loop {
        match reader.read_line().await {
            Ok(Some(PacketLine::Data(data))) => {
                commands += 1;
                log.push(format!("command {}", line_text(&data)));
            }
            Ok(Some(PacketLine::Flush)) => break,
            _ => {
                log.push("receive-pack: no commands");
                return;
            }
        }
    }
    if commands == 0 {
        log.push("receive-pack: no commands");
        return;
    }
    if pack_len > 0 {
        let mut pack = Vec::new();
        while pack.len() < pack_len {
            match reader.read_raw(pack_len - pack.len()).await {
                Ok(Some(chunk)) => pack.extend_from_slice(&chunk),
                _ => break,
            }
        }
        if pack.len() < pack_len {
            log.push(format!("receive-pack: incomplete pack ({} bytes)", pack.len()));
            return;
        }
        log.push(format!("pack {}", String::from_utf8_lossy(&pack)));
    }
    let _ = write.write_all(&report).await;
    let _ = write.flush().await;
}

/// Plays a `git-receive-pack` that takes the commands and then never reads the pack.
pub async fn stalled_receive_pack(io: DuplexStream, adv: Vec<u8>, log: Transcript) {
    let (read, mut write) = tokio::io::split(io);
    write.write_all(&adv).await.unwrap();
    let mut reader = PacketReader::new(read);
    while let Ok(Some(PacketLine::Data(data))) = reader.read_line().await {
        log.push(format!("command {}", line_text(&data)));
    }
    std::future::pending::<()>().await
}

/// A side-band `report-status` answer.
pub fn side_band_report(lines: &[&str]) -> Vec<u8> {
    let mut inner = Vec::new();
    for line in lines {
        inner.extend(pkt(format!("{line}\n")));
    }
    inner.extend_from_slice(FLUSH);
    let mut out = band(SideBand::PackfileData, &inner);
    out.extend_from_slice(FLUSH);
    out
}
