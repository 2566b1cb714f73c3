//! Mirror runs against scripted upload-pack / receive-pack peers connected through in-memory
//! pipes.

mod common;

use std::sync::Arc;

use std::time::Duration;

use common::{
    FLUSH, ScriptedTransport, Transcript, advertisement, band, id, pkt, receive_pack,
    side_band_report, stalled_receive_pack, upload_pack, zero,
};
use git_relay::errors::RelayError;
use git_relay::protocol::{RefStatus, RefUpdate, SideBand};
use git_relay::{ChannelSink, Endpoint, LogSink, Relay, RelayConfig};

const SOURCE_CAPS: &str = "multi_ack_detailed side-band-64k ofs-delta agent=git/2.45";
const TARGET_CAPS: &str = "report-status delete-refs side-band-64k atomic ofs-delta agent=git/2.45";
const PACK: &[u8] = b"PACK\0\0\0\x02\0\0\0\x02relayed-object-data";

fn endpoints() -> (Endpoint, Endpoint) {
    (
        "ssh://source.example/repo.git".parse().unwrap(),
        "ssh://target.example/repo.git".parse().unwrap(),
    )
}

fn relay(
    config: RelayConfig,
    source: Arc<ScriptedTransport>,
    target: Arc<ScriptedTransport>,
) -> (Relay, tokio::sync::mpsc::Receiver<(tracing::Level, String)>) {
    let (sink, messages) = ChannelSink::new(64);
    let sink: Arc<dyn LogSink> = Arc::new(sink);
    let relay = Relay::new(config, sink)
        .unwrap()
        .with_transports(source, target);
    (relay, messages)
}

/// A pack split over two side-band packets with a progress message in between.
fn pack_response() -> Vec<u8> {
    let mut out = pkt("NAK\n");
    out.extend(band(SideBand::PackfileData, &PACK[..10]));
    out.extend(band(SideBand::ProgressInfo, b"Counting objects: 2, done.\n"));
    out.extend(band(SideBand::PackfileData, &PACK[10..]));
    out.extend_from_slice(FLUSH);
    out
}

fn drain(messages: &mut tokio::sync::mpsc::Receiver<(tracing::Level, String)>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok((_, message)) = messages.try_recv() {
        out.push(message);
    }
    out
}

/// An empty target receives every source ref and the relayed pack byte for byte.
#[tokio::test]
async fn mirrors_into_empty_target() {
    let (fetch_log, push_log) = (Transcript::default(), Transcript::default());
    let source_adv = advertisement(
        &[
            ("HEAD", id('a')),
            ("refs/heads/main", id('a')),
            ("refs/tags/v0", id('a')),
        ],
        SOURCE_CAPS,
    );
    let log = fetch_log.clone();
    let source = ScriptedTransport::new(move |io| {
        upload_pack(io, source_adv.clone(), pack_response(), log.clone())
    });
    let log = push_log.clone();
    let target = ScriptedTransport::new(move |io| {
        receive_pack(
            io,
            advertisement(&[], TARGET_CAPS),
            PACK.len(),
            side_band_report(&["unpack ok", "ok refs/heads/main", "ok refs/tags/v0"]),
            log.clone(),
        )
    });

    let (relay, mut messages) = relay(RelayConfig::default(), source.clone(), target.clone());
    let (from, to) = endpoints();
    let outcome = relay.run(&from, &to).await.unwrap();
    source.finished().await;
    target.finished().await;

    assert_eq!(
        outcome.updates,
        vec![
            RefUpdate::new("refs/heads/main", zero(), id('a')),
            RefUpdate::new("refs/tags/v0", zero(), id('a')),
        ]
    );
    assert_eq!(outcome.report.per_ref["refs/heads/main"], RefStatus::Ok);
    assert_eq!(outcome.report.per_ref["refs/tags/v0"], RefStatus::Ok);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.bytes_relayed, PACK.len() as u64);
    assert_eq!(outcome.progress_messages, 1);

    let fetched = fetch_log.lines();
    assert!(fetched[0].starts_with(&format!(
        "want {} multi_ack_detailed side-band-64k ofs-delta",
        id('a')
    )));
    assert_eq!(fetched.iter().filter(|l| l.starts_with("want")).count(), 1);
    assert!(!fetched.iter().any(|l| l.starts_with("have")));

    let pushed = push_log.lines();
    assert!(pushed[0].starts_with(&format!(
        "command {} {} refs/heads/main\0 report-status side-band-64k atomic",
        zero(),
        id('a')
    )));
    assert_eq!(pushed[1], format!("command {} {} refs/tags/v0", zero(), id('a')));
    assert_eq!(pushed[2], format!("pack {}", String::from_utf8_lossy(PACK)));

    let logged = drain(&mut messages);
    assert!(logged.contains(&format!("CREATE refs/heads/main {}", id('a'))));
    assert!(logged.contains(&"source: Counting objects: 2, done.".to_string()));
}

/// Identical sides exchange no pack and push nothing.
#[tokio::test]
async fn identical_refs_are_a_no_op() {
    let (fetch_log, push_log) = (Transcript::default(), Transcript::default());
    let log = fetch_log.clone();
    let source = ScriptedTransport::new(move |io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], SOURCE_CAPS),
            pack_response(),
            log.clone(),
        )
    });
    let log = push_log.clone();
    let target = ScriptedTransport::new(move |io| {
        receive_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], TARGET_CAPS),
            0,
            Vec::new(),
            log.clone(),
        )
    });

    let (relay, _messages) = relay(RelayConfig::default(), source.clone(), target.clone());
    let (from, to) = endpoints();
    let outcome = relay.run(&from, &to).await.unwrap();
    source.finished().await;
    target.finished().await;

    assert!(outcome.updates.is_empty());
    assert!(outcome.report.per_ref.is_empty());
    assert_eq!(outcome.bytes_relayed, 0);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(fetch_log.lines(), ["upload-pack: no request"]);
    assert_eq!(push_log.lines(), ["receive-pack: no commands"]);
}

/// A target ref the source lacks is deleted without fetching anything.
#[tokio::test]
async fn prunes_refs_missing_from_source() {
    let (fetch_log, push_log) = (Transcript::default(), Transcript::default());
    let log = fetch_log.clone();
    let source = ScriptedTransport::new(move |io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], SOURCE_CAPS),
            pack_response(),
            log.clone(),
        )
    });
    let log = push_log.clone();
    let target = ScriptedTransport::new(move |io| {
        receive_pack(
            io,
            advertisement(
                &[("refs/heads/feature", id('b')), ("refs/heads/main", id('a'))],
                TARGET_CAPS,
            ),
            0,
            side_band_report(&["unpack ok", "ok refs/heads/feature"]),
            log.clone(),
        )
    });

    let (relay, _messages) = relay(RelayConfig::default(), source.clone(), target.clone());
    let (from, to) = endpoints();
    let outcome = relay.run(&from, &to).await.unwrap();
    source.finished().await;
    target.finished().await;

    assert_eq!(
        outcome.updates,
        vec![RefUpdate::new("refs/heads/feature", id('b'), zero())]
    );
    assert_eq!(outcome.report.per_ref["refs/heads/feature"], RefStatus::Ok);
    assert_eq!(outcome.bytes_relayed, 0);
    assert_eq!(fetch_log.lines(), ["upload-pack: no request"]);
    assert_eq!(push_log.lines().len(), 1);
    assert!(push_log.lines()[0].contains("refs/heads/feature"));
}

/// Without `delete-refs` deletions are skipped and reported, not sent.
#[tokio::test]
async fn deletions_skipped_without_delete_refs() {
    let push_log = Transcript::default();
    let source = ScriptedTransport::new(|io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], SOURCE_CAPS),
            Vec::new(),
            Transcript::default(),
        )
    });
    let log = push_log.clone();
    let target = ScriptedTransport::new(move |io| {
        receive_pack(
            io,
            advertisement(
                &[("refs/heads/feature", id('b')), ("refs/heads/main", id('a'))],
                "report-status side-band-64k",
            ),
            0,
            Vec::new(),
            log.clone(),
        )
    });

    let (relay, mut messages) = relay(RelayConfig::default(), source.clone(), target.clone());
    let (from, to) = endpoints();
    let outcome = relay.run(&from, &to).await.unwrap();
    target.finished().await;

    assert_eq!(outcome.skipped.len(), 1);
    assert!(outcome.report.per_ref.is_empty());
    assert_eq!(push_log.lines(), ["receive-pack: no commands"]);
    assert!(
        drain(&mut messages)
            .iter()
            .any(|m| m.contains("keeping refs/heads/feature"))
    );
}

/// A target that refuses the credentials fails the run once, and the source is never asked for
/// a pack.
#[tokio::test]
async fn target_auth_rejection_discards_the_fetch() {
    let fetch_log = Transcript::default();
    let log = fetch_log.clone();
    let source = ScriptedTransport::new(move |io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], SOURCE_CAPS),
            pack_response(),
            log.clone(),
        )
    });
    let target = ScriptedTransport::refusing(RelayError::AuthRejected("target.example".into()));

    let (relay, _messages) = relay(RelayConfig::default(), source.clone(), target.clone());
    let (from, to) = endpoints();
    let error = relay.run(&from, &to).await.unwrap_err();
    source.finished().await;

    assert!(matches!(error, RelayError::AuthRejected(_)), "{error}");
    assert_eq!(error.exit_code(), 2);
    assert_eq!(target.opens(), 1);
    assert_eq!(fetch_log.lines(), ["upload-pack: no request"]);
}

/// A fatal message from the source mid-pack fails the run with the remote text and hangs up on
/// the target before it sees a whole pack.
#[tokio::test]
async fn source_failure_cancels_the_push() {
    let push_log = Transcript::default();
    let mut response = pkt("NAK\n");
    response.extend(band(SideBand::PackfileData, &PACK[..10]));
    response.extend(band(SideBand::Error, b"fatal: object corrupt\n"));
    let source = ScriptedTransport::new(move |io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], SOURCE_CAPS),
            response.clone(),
            Transcript::default(),
        )
    });
    let log = push_log.clone();
    let target = ScriptedTransport::new(move |io| {
        receive_pack(
            io,
            advertisement(&[], TARGET_CAPS),
            PACK.len(),
            side_band_report(&["unpack ok", "ok refs/heads/main"]),
            log.clone(),
        )
    });

    let (relay, _messages) = relay(RelayConfig::default(), source.clone(), target.clone());
    let (from, to) = endpoints();
    let error = relay.run(&from, &to).await.unwrap_err();
    target.finished().await;

    assert!(
        matches!(&error, RelayError::NegotiationFailed(m) if m == "fatal: object corrupt"),
        "{error}"
    );
    assert!(push_log.contains("receive-pack: "), "{:?}", push_log.lines());
    assert!(!push_log.lines().iter().any(|l| l.starts_with("pack ")));
}

/// `frames` side-band packets of pack data, optionally followed by a fatal message.
fn large_pack_response(frames: usize, fatal: Option<&str>) -> Vec<u8> {
    let mut out = pkt("NAK\n");
    let frame = vec![b'x'; 60_000];
    for _ in 0..frames {
        out.extend(band(SideBand::PackfileData, &frame));
    }
    match fatal {
        Some(message) => out.extend(band(SideBand::Error, message.as_bytes())),
        None => out.extend_from_slice(FLUSH),
    }
    out
}

/// The source breaks while the target has stopped reading: the run still ends with the source's
/// error instead of waiting on the target.
#[tokio::test]
async fn source_failure_with_stalled_target() {
    let response = large_pack_response(3, Some("fatal: object corrupt\n"));
    let source = ScriptedTransport::new(move |io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], SOURCE_CAPS),
            response.clone(),
            Transcript::default(),
        )
    });
    let push_log = Transcript::default();
    let log = push_log.clone();
    let target = ScriptedTransport::new(move |io| {
        stalled_receive_pack(io, advertisement(&[], TARGET_CAPS), log.clone())
    });

    let (relay, _messages) = relay(RelayConfig::default(), source, target);
    let (from, to) = endpoints();
    let error = tokio::time::timeout(Duration::from_secs(5), relay.run(&from, &to))
        .await
        .expect("relay hung on a stalled target")
        .unwrap_err();

    assert!(
        matches!(&error, RelayError::NegotiationFailed(m) if m == "fatal: object corrupt"),
        "{error}"
    );
    assert_eq!(error.exit_code(), 2);
    assert!(push_log.contains("command "));
}

/// A target that stops reading the pack fails the run once the idle timeout passes.
#[tokio::test]
async fn stalled_target_times_out() {
    let response = large_pack_response(40, None);
    let source = ScriptedTransport::new(move |io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], SOURCE_CAPS),
            response.clone(),
            Transcript::default(),
        )
    });
    let target = ScriptedTransport::new(move |io| {
        stalled_receive_pack(io, advertisement(&[], TARGET_CAPS), Transcript::default())
    });
    let config = RelayConfig {
        idle_timeout: Duration::from_millis(300),
        ..RelayConfig::default()
    };

    let (relay, _messages) = relay(config, source, target);
    let (from, to) = endpoints();
    let error = tokio::time::timeout(Duration::from_secs(5), relay.run(&from, &to))
        .await
        .expect("relay hung on a stalled target")
        .unwrap_err();

    assert!(
        matches!(&error, RelayError::TransportTimeout(m) if m.contains("stopped reading")),
        "{error}"
    );
    assert_eq!(error.exit_code(), 3);
}

/// Creating a ref at an object the target already has sends an empty pack and fetches nothing.
#[tokio::test]
async fn known_objects_get_an_empty_pack() {
    let (fetch_log, push_log) = (Transcript::default(), Transcript::default());
    let log = fetch_log.clone();
    let source = ScriptedTransport::new(move |io| {
        upload_pack(
            io,
            advertisement(
                &[("refs/heads/copy", id('a')), ("refs/heads/main", id('a'))],
                SOURCE_CAPS,
            ),
            pack_response(),
            log.clone(),
        )
    });
    let log = push_log.clone();
    let target = ScriptedTransport::new(move |io| {
        receive_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], TARGET_CAPS),
            32,
            side_band_report(&["unpack ok", "ok refs/heads/copy"]),
            log.clone(),
        )
    });

    let (relay, _messages) = relay(RelayConfig::default(), source.clone(), target.clone());
    let (from, to) = endpoints();
    let outcome = relay.run(&from, &to).await.unwrap();
    source.finished().await;
    target.finished().await;

    assert_eq!(outcome.report.per_ref["refs/heads/copy"], RefStatus::Ok);
    assert_eq!(outcome.bytes_relayed, 0);
    assert_eq!(fetch_log.lines(), ["upload-pack: no request"]);
    assert!(push_log.lines().iter().any(|l| l.starts_with("pack PACK")));
}

/// A dry run reports the differences and touches neither side.
#[tokio::test]
async fn dry_run_only_plans() {
    let (fetch_log, push_log) = (Transcript::default(), Transcript::default());
    let log = fetch_log.clone();
    let source = ScriptedTransport::new(move |io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('b'))], SOURCE_CAPS),
            pack_response(),
            log.clone(),
        )
    });
    let log = push_log.clone();
    let target = ScriptedTransport::new(move |io| {
        receive_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], TARGET_CAPS),
            0,
            Vec::new(),
            log.clone(),
        )
    });

    let config = RelayConfig {
        dry_run: true,
        ..RelayConfig::default()
    };
    let (relay, _messages) = relay(config, source.clone(), target.clone());
    let (from, to) = endpoints();
    let outcome = relay.run(&from, &to).await.unwrap();
    source.finished().await;
    target.finished().await;

    assert!(outcome.dry_run);
    assert_eq!(
        outcome.updates,
        vec![RefUpdate::new("refs/heads/main", id('a'), id('b'))]
    );
    assert_eq!(fetch_log.lines(), ["upload-pack: no request"]);
    assert_eq!(push_log.lines(), ["receive-pack: no commands"]);
}

/// A per-ref rejection is reported in the outcome rather than as an error.
#[tokio::test]
async fn rejected_ref_sets_exit_code() {
    let source = ScriptedTransport::new(|io| {
        upload_pack(
            io,
            advertisement(&[("refs/heads/main", id('b'))], SOURCE_CAPS),
            pack_response(),
            Transcript::default(),
        )
    });
    let target = ScriptedTransport::new(|io| {
        receive_pack(
            io,
            advertisement(&[("refs/heads/main", id('a'))], TARGET_CAPS),
            PACK.len(),
            side_band_report(&["unpack ok", "ng refs/heads/main non-fast-forward"]),
            Transcript::default(),
        )
    });

    let (relay, _messages) = relay(RelayConfig::default(), source.clone(), target.clone());
    let (from, to) = endpoints();
    let outcome = relay.run(&from, &to).await.unwrap();

    assert_eq!(
        outcome.report.per_ref["refs/heads/main"],
        RefStatus::Rejected("non-fast-forward".into())
    );
    assert_eq!(outcome.exit_code(), 1);
}
