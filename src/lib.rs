//! vizstream - frame streaming and input relay for a visualization process
//!
//! A renderer publishes RGB frames into shared memory; this crate serves them
//! to browsers over WebRTC (or MJPEG) and writes the browsers' mouse and wheel
//! events back into a shared circular queue.

pub mod config;
pub mod error;
pub mod input;
pub mod lifecycle;
pub mod queue;
pub mod shm;
pub mod state;
pub mod stream;
pub mod utils;
pub mod video;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
