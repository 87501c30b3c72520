//! MPEG-TS processing core for the tsdvr recorder.
//!
//! This crate turns a live stream of 188-byte transport-stream packets
//! carrying a single service into everything a segmented, seekable recording
//! needs: regenerated PAT/PMT sections, frame boundaries and frame types
//! detected without a decoder, and optional in-place removal of AVC filler
//! NAL units.
//!
//! The crate does no I/O of its own. Diagnostics go through the [`log`]
//! facade; the embedding application decides where they end up.

pub mod channel;
pub mod frame;
pub mod nalu;
pub mod pes;
pub mod psi;
pub mod ts;

pub use channel::{Channel, IdentityNormalizer, LanguageNormalizer, TrackSink};
pub use frame::FrameDetector;
pub use nalu::{NaluDumper, NaluStreamProcessor};
pub use psi::generator::PatPmtGenerator;
pub use psi::parser::PatPmtParser;
