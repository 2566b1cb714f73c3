/// Git Protocol Module
///
/// The client half of the smart protocol as the relay speaks it: pkt-line framing, reading what a
/// remote advertises, asking `git-upload-pack` for a pack and feeding that pack to
/// `git-receive-pack`. Nothing here knows which transport carries the bytes.
pub mod advertisement;
pub mod negotiation;
pub mod pktline;
pub mod push;
pub mod types;

// Re-export main interfaces
pub use advertisement::{Advertisement, list_refs};
pub use negotiation::{FetchSummary, Negotiation, NegotiationRequest, NegotiationState};
pub use push::{PushReport, PushRequest, RefStatus};
pub use types::*;
