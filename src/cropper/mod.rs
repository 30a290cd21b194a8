//! Region cropper
//!
//! Binds a shared source to a rectangle and produces cropped frames into a
//! sink (the viewer session's derived video track). One producer task per
//! cropper; delivery is drop-old: each tick reads only the most recent
//! source frame, capped at 30 fps. `retarget` swaps the rectangle
//! atomically, so an offset-only region change needs no track churn.

pub mod frame;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::geometry::Rectangle;
use crate::webrtc::CroppedVideoTrack;
use frame::SourceFrame;

/// Hard ceiling on the output frame rate
pub const MAX_OUTPUT_FPS: u32 = 30;

/// Destination for cropped frames
pub trait FrameSink: Send + Sync {
    fn write(&self, data: Bytes) -> BoxFuture<'_, Result<()>>;
}

impl FrameSink for CroppedVideoTrack {
    fn write(&self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write_frame(data))
    }
}

/// Extract `rect` from a frame as a tightly packed pixel buffer.
///
/// The rectangle is clipped to the frame bounds; `None` when nothing remains.
pub fn crop_frame(frame: &SourceFrame, rect: Rectangle) -> Option<Bytes> {
    let rect = rect.clipped(frame.width, frame.height);
    if rect.area() == 0 {
        return None;
    }

    let bpp = frame.format.bytes_per_pixel() as usize;
    let stride = frame.stride as usize;
    let row_len = rect.width as usize * bpp;
    let data = frame.data();

    let mut out = Vec::with_capacity(row_len * rect.height as usize);
    for row in 0..rect.height as usize {
        let start = (rect.y as usize + row) * stride + rect.x as usize * bpp;
        out.extend_from_slice(&data[start..start + row_len]);
    }
    Some(Bytes::from(out))
}

pub struct Cropper {
    rect: Arc<Mutex<Rectangle>>,
    shutdown: watch::Sender<bool>,
}

impl Cropper {
    /// Bind a source to a rectangle and start the producer task.
    pub fn bind(
        source: watch::Receiver<Option<Arc<SourceFrame>>>,
        rect: Rectangle,
        fps: u32,
        sink: Arc<dyn FrameSink>,
    ) -> Arc<Self> {
        let fps = fps.clamp(1, MAX_OUTPUT_FPS);
        let rect = Arc::new(Mutex::new(rect));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(produce(source, rect.clone(), sink, fps, shutdown_rx));

        Arc::new(Self {
            rect,
            shutdown: shutdown_tx,
        })
    }

    /// Atomically swap the rectangle; the next produced frame uses it.
    ///
    /// Callers that change dimensions are expected to bind a fresh cropper
    /// to a fresh derived track instead.
    pub fn retarget(&self, rect: Rectangle) {
        *self.rect.lock() = rect;
    }

    pub fn rect(&self) -> Rectangle {
        *self.rect.lock()
    }

    /// Stop the producer and release the source reference. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Drop for Cropper {
    fn drop(&mut self) {
        self.close();
    }
}

async fn produce(
    mut source: watch::Receiver<Option<Arc<SourceFrame>>>,
    rect: Arc<Mutex<Rectangle>>,
    sink: Arc<dyn FrameSink>,
    fps: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_sequence: Option<u64> = None;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if source.has_changed().is_err() {
                    debug!("Source track gone, stopping cropper");
                    break;
                }

                // Most recent frame only; older frames were already dropped
                // by the watch cell.
                let frame = match source.borrow_and_update().clone() {
                    Some(frame) => frame,
                    None => continue,
                };
                if last_sequence == Some(frame.sequence) {
                    continue;
                }

                let rect = *rect.lock();
                // Zero area post-clipping produces no frames; the viewer
                // keeps its last-good picture.
                let cropped = match crop_frame(&frame, rect) {
                    Some(cropped) => cropped,
                    None => continue,
                };

                if let Err(e) = sink.write(cropped).await {
                    warn!(error = %e, "Cropped frame write failed");
                }
                last_sequence = Some(frame.sequence);
            }
        }
    }

    debug!("Cropper producer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cropper::frame::PixelFormat;
    use tokio::sync::mpsc;

    /// Frame where pixel (x, y) holds [x, y, x ^ y, 0xFF]
    fn pattern_frame(width: u32, height: u32, sequence: u64) -> Arc<SourceFrame> {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, (x ^ y) as u8, 0xFF]);
            }
        }
        Arc::new(
            SourceFrame::packed(Bytes::from(data), width, height, PixelFormat::Rgba, sequence)
                .unwrap(),
        )
    }

    struct ChannelSink {
        tx: mpsc::UnboundedSender<Bytes>,
    }

    impl FrameSink for ChannelSink {
        fn write(&self, data: Bytes) -> BoxFuture<'_, Result<()>> {
            let _ = self.tx.send(data);
            Box::pin(async { Ok(()) })
        }
    }

    fn channel_sink() -> (Arc<dyn FrameSink>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink { tx }), rx)
    }

    #[test]
    fn test_crop_full_frame_is_identity() {
        let frame = pattern_frame(8, 4, 0);
        let cropped = crop_frame(&frame, Rectangle::new(0, 0, 8, 4)).unwrap();
        assert_eq!(&cropped[..], frame.data());
    }

    #[test]
    fn test_crop_extracts_expected_pixels() {
        let frame = pattern_frame(16, 16, 0);
        let cropped = crop_frame(&frame, Rectangle::new(3, 5, 4, 2)).unwrap();
        assert_eq!(cropped.len(), 4 * 2 * 4);
        // First pixel of the crop is source pixel (3, 5)
        assert_eq!(&cropped[..4], &[3, 5, 3 ^ 5, 0xFF]);
        // First pixel of the second row is source pixel (3, 6)
        assert_eq!(&cropped[4 * 4..4 * 4 + 4], &[3, 6, 3 ^ 6, 0xFF]);
    }

    #[test]
    fn test_crop_clips_to_frame_bounds() {
        let frame = pattern_frame(8, 8, 0);
        let cropped = crop_frame(&frame, Rectangle::new(6, 6, 8, 8)).unwrap();
        // Clipped to 2x2
        assert_eq!(cropped.len(), 2 * 2 * 4);
    }

    #[test]
    fn test_crop_outside_frame_produces_nothing() {
        let frame = pattern_frame(8, 8, 0);
        assert!(crop_frame(&frame, Rectangle::new(8, 8, 4, 4)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_crops_latest_frame() {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (sink, mut rx) = channel_sink();
        let cropper = Cropper::bind(frame_rx, Rectangle::new(0, 0, 4, 4), 30, sink);

        frame_tx.send(Some(pattern_frame(16, 16, 1))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cropped = rx.recv().await.unwrap();
        assert_eq!(cropped.len(), 4 * 4 * 4);
        cropper.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_skips_duplicate_frames() {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (sink, mut rx) = channel_sink();
        let cropper = Cropper::bind(frame_rx, Rectangle::new(0, 0, 4, 4), 30, sink);

        frame_tx.send(Some(pattern_frame(16, 16, 7))).unwrap();
        // Several ticks pass with no new capture
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        cropper.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retarget_changes_offset_without_rebind() {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (sink, mut rx) = channel_sink();
        let cropper = Cropper::bind(frame_rx, Rectangle::new(0, 0, 2, 2), 30, sink);

        frame_tx.send(Some(pattern_frame(16, 16, 1))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(&first[..4], &[0, 0, 0, 0xFF]);

        cropper.retarget(Rectangle::new(5, 5, 2, 2));
        frame_tx.send(Some(pattern_frame(16, 16, 2))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = rx.recv().await.unwrap();
        assert_eq!(&second[..4], &[5, 5, 0, 0xFF]);

        cropper.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_area_region_produces_no_frames() {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (sink, mut rx) = channel_sink();
        // Rectangle entirely outside the 8x8 frame
        let cropper = Cropper::bind(frame_rx, Rectangle::new(100, 100, 4, 4), 30, sink);

        frame_tx.send(Some(pattern_frame(8, 8, 1))).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(rx.try_recv().is_err());
        cropper.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_stops_production() {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (sink, mut rx) = channel_sink();
        let cropper = Cropper::bind(frame_rx, Rectangle::new(0, 0, 4, 4), 30, sink);

        cropper.close();
        cropper.close();
        assert!(cropper.is_closed());

        frame_tx.send(Some(pattern_frame(8, 8, 1))).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
