use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use super::JpegSplitter;
use crate::frame::FrameBuffer;

/// Camera command configuration
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Executable producing MJPEG on stdout
    pub command: String,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Appended after the standard arguments
    pub extra_args: Vec<String>,
    /// Largest accepted image in bytes
    pub max_frame_size: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            command: "rpicam-vid".to_string(),
            width: 704,
            height: 512,
            fps: 5,
            extra_args: Vec::new(),
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl CameraConfig {
    /// Full argument list passed to the camera command
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            "0".to_string(), // Run indefinitely
            "--width".to_string(),
            self.width.to_string(),
            "--height".to_string(),
            self.height.to_string(),
            "--framerate".to_string(),
            self.fps.to_string(),
            "--codec".to_string(),
            "mjpeg".to_string(),
            "-o".to_string(),
            "-".to_string(),
            "--flush".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Handle to a running camera process. Dropping it stops the camera.
pub struct CameraCapture {
    child: Option<Child>,
}

impl CameraCapture {
    /// Spawn the camera command and publish every image it emits into
    /// `frames`. Must be called from within a tokio runtime.
    pub fn start(config: CameraConfig, frames: Arc<FrameBuffer>) -> Result<Self> {
        let args = config.args();
        info!(
            command = %config.command,
            width = config.width,
            height = config.height,
            fps = config.fps,
            "Starting camera"
        );
        debug!(?args, "Camera args");

        let mut child = Command::new(&config.command)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}. Is it installed?", config.command))?;

        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("Failed to capture stdout from {}", config.command))?;

        let max_frame_size = config.max_frame_size;
        tokio::task::spawn_blocking(move || {
            read_mjpeg_stream(stdout, &frames, max_frame_size);
        });

        Ok(Self { child: Some(child) })
    }

    /// Stop the camera process
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping camera");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read MJPEG from `reader` until EOF, publishing each complete image.
///
/// Returns the number of images published.
pub fn read_mjpeg_stream<R: Read>(mut reader: R, frames: &FrameBuffer, max_frame_size: usize) -> u64 {
    let mut splitter = JpegSplitter::new(max_frame_size);
    let mut buf = vec![0u8; 64 * 1024];
    let mut published = 0u64;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("Camera stream ended (EOF)");
                break;
            }
            Ok(n) => {
                for image in splitter.push(&buf[..n]) {
                    let version = frames.publish(image);
                    published += 1;
                    if published % 100 == 0 {
                        debug!(published, version, "Camera frames");
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Error reading camera stream");
                break;
            }
        }
    }

    info!(
        published,
        dropped = splitter.dropped(),
        "Camera capture finished"
    );
    published
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{JPEG_EOI, JPEG_SOI};
    use std::io::Cursor;

    #[test]
    fn args_request_mjpeg_on_stdout() {
        let config = CameraConfig {
            extra_args: vec!["--nopreview".into()],
            ..Default::default()
        };
        let args = config.args();
        assert!(args.windows(2).any(|w| w == ["--codec", "mjpeg"]));
        assert!(args.windows(2).any(|w| w == ["-o", "-"]));
        assert!(args.windows(2).any(|w| w == ["--width", "704"]));
        assert_eq!(args.last().map(String::as_str), Some("--nopreview"));
    }

    #[test]
    fn stream_images_are_published_in_order() {
        let mut stream = Vec::new();
        for body in [&b"A"[..], b"B", b"C"] {
            stream.extend_from_slice(&JPEG_SOI);
            stream.extend_from_slice(body);
            stream.extend_from_slice(&JPEG_EOI);
        }

        let frames = FrameBuffer::new();
        let published = read_mjpeg_stream(Cursor::new(stream), &frames, 1024);
        assert_eq!(published, 3);
        assert_eq!(frames.version(), 3);
        let latest = frames.latest().unwrap();
        assert_eq!(&latest.data[..], &[0xFF, 0xD8, b'C', 0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn missing_command_fails_to_start() {
        let config = CameraConfig {
            command: "sortcam-no-such-camera".into(),
            ..Default::default()
        };
        let result = CameraCapture::start(config, Arc::new(FrameBuffer::new()));
        assert!(result.is_err());
    }
}
