//! WebRTC video delivery
//!
//! - `PeerConnection` - one browser, one H.264 track
//! - `PeerConnectionSet` - connections owned by the server
//! - `VideoSource` - shared (broadcast) or per-peer track pumps

pub mod config;
pub mod peer;
pub mod peer_set;
pub mod signaling;
pub mod source;
pub mod track;

pub use config::{TurnServer, WebRtcConfig};
pub use peer::PeerConnection;
pub use peer_set::{CloseReport, MediaSession, PeerConnectionSet};
pub use signaling::{ConnectionState, SessionDescription};
pub use source::{TrackLease, VideoSource};
pub use track::{h264_track, TrackDemand, TrackSink};
