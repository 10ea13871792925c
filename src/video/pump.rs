//! Frame pump: adapter -> encoder -> sink
//!
//! One pump drives one [`MediaTrackAdapter`]. Encoding runs on the blocking
//! pool so the single-threaded scheduler keeps serving sockets while a frame
//! is being compressed.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::adapter::MediaTrackAdapter;
use super::encoder::{EncodedFrame, Encoder};
use crate::error::{AppError, Result};
use crate::lifecycle::ShutdownHandle;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Destination of encoded frames
#[async_trait]
pub trait FrameSink: Send {
    /// Wait until frames are wanted. Defaults to always.
    async fn ready(&mut self) {}

    /// Ask the encoder for a key frame before the next frame
    fn wants_keyframe(&mut self) -> bool {
        false
    }

    async fn deliver(&mut self, frame: EncodedFrame) -> Result<()>;
}

/// Run until `cancel` fires or the adapter hits a fatal error.
///
/// A fatal error is reported through `shutdown` and returned; everything
/// else is logged (throttled) and the pump carries on with the next tick.
pub async fn run_pump(
    label: &str,
    mut adapter: MediaTrackAdapter,
    mut encoder: Box<dyn Encoder>,
    mut sink: impl FrameSink,
    cancel: CancellationToken,
    shutdown: ShutdownHandle,
) -> Result<()> {
    let throttler = LogThrottler::default();
    let mut sequence = 0u64;
    info!("{} pump started ({} fps, {})", label, adapter.fps(), encoder.name());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sink.ready() => {}
        }

        let produced = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = adapter.produce_frame() => result.map(|frame| frame.clone()),
        };

        let frame = match produced {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() => {
                shutdown.fail(&e);
                return Err(e);
            }
            Err(e) => {
                warn_throttled!(throttler, "produce", "{} pump: frame read failed: {}", label, e);
                continue;
            }
        };

        if sink.wants_keyframe() {
            encoder.request_keyframe();
        }

        let seq = sequence;
        let joined = tokio::task::spawn_blocking(move || {
            let result = encoder.encode(&frame, seq);
            (encoder, result)
        })
        .await
        .map_err(|e| AppError::Internal(format!("{} encoder task failed: {}", label, e)))?;
        encoder = joined.0;

        match joined.1 {
            Ok(encoded) => {
                sequence += 1;
                if let Err(e) = sink.deliver(encoded).await {
                    warn_throttled!(throttler, "deliver", "{} pump: delivery failed: {}", label, e);
                }
            }
            Err(e) => {
                warn_throttled!(throttler, "encode", "{} pump: encode failed: {}", label, e);
            }
        }
    }

    debug!("{} pump stopped after {} frames", label, sequence);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::{EncodedFormat, EncoderConfig};
    use crate::video::format::Resolution;
    use crate::video::frame::RgbFrame;
    use crate::video::frame_buffer::FrameBuffer;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct RawEncoder(EncoderConfig);

    impl Encoder for RawEncoder {
        fn name(&self) -> &str {
            "raw"
        }
        fn encode(&mut self, frame: &RgbFrame, sequence: u64) -> Result<EncodedFrame> {
            Ok(EncodedFrame::new(
                Bytes::copy_from_slice(frame.data()),
                EncodedFormat::Jpeg,
                frame.resolution,
                true,
                sequence,
                frame.pts,
            ))
        }
        fn config(&self) -> &EncoderConfig {
            &self.0
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<EncodedFrame>);

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn deliver(&mut self, frame: EncodedFrame) -> Result<()> {
            self.0
                .send(frame)
                .map_err(|_| AppError::Internal("receiver gone".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_delivers_until_cancelled() {
        let res = Resolution::new(2, 2);
        let fb = FrameBuffer::in_process(1, res, res).unwrap();
        let adapter = MediaTrackAdapter::new(fb, 30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run_pump(
            "test",
            adapter,
            Box::new(RawEncoder(EncoderConfig::default())),
            ChannelSink(tx),
            cancel.clone(),
            ShutdownHandle::new(),
        ));

        for expected in 0..3u64 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.sequence, expected);
            assert_eq!(frame.pts, expected * 3000);
        }
        cancel.cancel();
        assert!(pump.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_geometry_triggers_shutdown() {
        let fb = FrameBuffer::in_process(1, Resolution::new(2, 2), Resolution::new(2, 0)).unwrap();
        let adapter = MediaTrackAdapter::new(fb, 30);
        let (tx, _rx) = mpsc::unbounded_channel();
        let shutdown = ShutdownHandle::new();

        let result = run_pump(
            "test",
            adapter,
            Box::new(RawEncoder(EncoderConfig::default())),
            ChannelSink(tx),
            CancellationToken::new(),
            shutdown.clone(),
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidGeometry(_))));
        assert!(shutdown.is_triggered());
        assert!(shutdown.fatal_error().is_some());
    }
}
