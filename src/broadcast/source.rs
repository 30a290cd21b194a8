//! Shared source track
//!
//! The single captured stream, shared by read among all croppers. Frames
//! land in a `watch` cell: consumers always see the newest frame and old
//! ones are dropped, never queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::cropper::frame::{PixelFormat, SourceFrame};
use crate::error::{AppError, Result};
use crate::geometry::StreamGeometry;

pub struct SourceTrack {
    geometry: StreamGeometry,
    tx: watch::Sender<Option<Arc<SourceFrame>>>,
    sequence: AtomicU64,
}

impl SourceTrack {
    pub fn new(geometry: StreamGeometry) -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(Self {
            geometry,
            tx,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn geometry(&self) -> StreamGeometry {
        self.geometry
    }

    /// Publish a tightly packed frame matching the source geometry.
    pub fn publish(&self, data: Bytes, format: PixelFormat) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = SourceFrame::packed(
            data,
            self.geometry.width,
            self.geometry.height,
            format,
            sequence,
        )?;
        self.publish_frame(frame)
    }

    /// Publish a pre-built frame. Its dimensions must match the geometry.
    pub fn publish_frame(&self, frame: SourceFrame) -> Result<()> {
        if frame.width != self.geometry.width || frame.height != self.geometry.height {
            return Err(AppError::BadInput(format!(
                "frame {}x{} does not match source geometry {}",
                frame.width, frame.height, self.geometry
            )));
        }
        let _ = self.tx.send(Some(Arc::new(frame)));
        Ok(())
    }

    /// Subscribe to the latest-frame cell.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<SourceFrame>>> {
        self.tx.subscribe()
    }
}
