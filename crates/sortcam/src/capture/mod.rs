//! Frame producers
//!
//! Runs an external MJPEG camera command (`rpicam-vid` on the Pi) and
//! publishes each JPEG it emits into a [`FrameBuffer`], plus a synthetic
//! source for development without hardware.

mod camera;
mod splitter;

pub use camera::{read_mjpeg_stream, CameraCapture, CameraConfig};
pub use splitter::{JpegSplitter, DEFAULT_MAX_FRAME_SIZE};

#[cfg(feature = "test-source")]
pub use test_source::{run_test_source, TestSourceConfig};

#[cfg(feature = "test-source")]
mod test_source {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info};

    use crate::frame::{FrameBuffer, JPEG_EOI, JPEG_SOI};

    /// Configuration for the synthetic source
    #[derive(Debug, Clone)]
    pub struct TestSourceConfig {
        /// Frames per second
        pub fps: u32,
        /// Size of each fake image in bytes, markers included
        pub frame_size: usize,
    }

    impl Default for TestSourceConfig {
        fn default() -> Self {
            Self {
                fps: 5,
                frame_size: 8 * 1024,
            }
        }
    }

    /// Publish fake JPEG-framed payloads until `cancel` fires.
    ///
    /// Each payload carries the frame number after the SOI marker so a
    /// viewer can tell frames apart.
    pub async fn run_test_source(
        config: TestSourceConfig,
        frames: Arc<FrameBuffer>,
        cancel: CancellationToken,
    ) {
        let period = Duration::from_micros(1_000_000 / u64::from(config.fps.max(1)));
        let mut interval = tokio::time::interval(period);
        let mut frame_num = 0u32;

        info!(fps = config.fps, frame_size = config.frame_size, "Test source started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut data = Vec::with_capacity(config.frame_size);
            data.extend_from_slice(&JPEG_SOI);
            data.extend_from_slice(&frame_num.to_be_bytes());
            // Padding never forms a marker
            while data.len() + JPEG_EOI.len() < config.frame_size {
                data.push((frame_num & 0x7F) as u8);
            }
            data.extend_from_slice(&JPEG_EOI);

            frames.publish(data);
            frame_num = frame_num.wrapping_add(1);

            if frame_num % 300 == 0 {
                debug!(frame_num, "Test source frames");
            }
        }

        info!(frames = frame_num, "Test source stopped");
    }

}
