//! git-relay: mirror a Git repository from one remote to another without a local clone.
//!
//! The relay opens `git-upload-pack` on the source and `git-receive-pack` on the target, works out
//! which refs differ, asks the source for exactly the objects the target is missing and streams
//! that pack into the push as it arrives. Memory use is bounded by the chunk window, not by the
//! size of the repository.
//!
//! Modules
//! - `protocol`: pkt-line codec, ref advertisements, fetch negotiation, push commands and reports.
//! - `transport`: `file://`, `ssh://` and `http(s)://` sessions behind one `Transport` trait.
//! - `relay`: the coordinator, ref filters and mirror planning.
//! - `auth`: credentials and their providers (static, netrc, chained).
//! - `config`: `RelayConfig`, loadable from JSON.
//! - `sink`: where remote progress and ref changes are reported.
//! - `errors`: `RelayError` and the exit-code contract.
//! - `hash`: object ids in both hash formats.
//!
//! Typical Usage
//! - Parse both endpoints with `Endpoint::parse`, resolve credentials with `auth::resolve`, then
//!   `Relay::new(config, sink)?.run(&source, &target).await`.

pub mod auth;
pub mod config;
pub mod errors;
pub mod hash;
pub mod protocol;
pub mod relay;
pub mod sink;
pub mod transport;

pub use config::RelayConfig;
pub use errors::RelayError;
pub use hash::{HashKind, ObjectId};
pub use relay::{Relay, RelayOutcome, RefFilter, plan_mirror_updates};
pub use sink::{ChannelSink, LogSink, TracingSink};
pub use transport::{Endpoint, Scheme, Session, Transport};
