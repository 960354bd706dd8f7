use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::frame::{JPEG_EOI, JPEG_SOI};

/// Default cap on a single image; anything larger is treated as garbage
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Cuts a concatenated MJPEG byte stream into whole JPEG images.
///
/// An image runs from an SOI marker to the next EOI marker, inclusive.
/// Bytes before an SOI are discarded. The image contents are never
/// inspected beyond the markers.
#[derive(Debug)]
pub struct JpegSplitter {
    buf: BytesMut,
    max_frame_size: usize,
    in_frame: bool,
    /// Where to resume the EOI search in `buf`
    scan_from: usize,
    dropped: u64,
}

impl Default for JpegSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

fn find(haystack: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}

impl JpegSplitter {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
            in_frame: false,
            scan_from: 0,
            dropped: 0,
        }
    }

    /// Feed a chunk, returning every image it completed (oldest first).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.in_frame {
                match find(&self.buf, &JPEG_SOI, 0) {
                    Some(start) => {
                        let _ = self.buf.split_to(start);
                        self.in_frame = true;
                        self.scan_from = JPEG_SOI.len();
                    }
                    None => {
                        // A trailing 0xFF may be the first half of an SOI
                        let keep = usize::from(self.buf.last() == Some(&JPEG_SOI[0]));
                        let discard = self.buf.len() - keep;
                        let _ = self.buf.split_to(discard);
                        break;
                    }
                }
            }

            match find(&self.buf, &JPEG_EOI, self.scan_from) {
                Some(end) => {
                    frames.push(self.buf.split_to(end + JPEG_EOI.len()).freeze());
                    self.in_frame = false;
                }
                None => {
                    if self.buf.len() > self.max_frame_size {
                        self.dropped += 1;
                        warn!(
                            buffered = self.buf.len(),
                            max = self.max_frame_size,
                            "No JPEG end marker within frame limit, discarding"
                        );
                        self.buf.clear();
                        self.in_frame = false;
                    } else {
                        self.scan_from = (self.buf.len() - 1).max(JPEG_SOI.len());
                    }
                    break;
                }
            }
        }

        frames
    }

    /// Oversized images discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = JPEG_SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&JPEG_EOI);
        v
    }

    #[test]
    fn splits_back_to_back_images() {
        let mut splitter = JpegSplitter::default();
        let mut stream = jpeg(b"one");
        stream.extend(jpeg(b"two"));

        let frames = splitter.push(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &jpeg(b"one")[..]);
        assert_eq!(&frames[1][..], &jpeg(b"two")[..]);
    }

    #[test]
    fn reassembles_across_chunks() {
        let mut splitter = JpegSplitter::default();
        let image = jpeg(b"abcdef");

        // One byte at a time, markers split across pushes
        let mut frames = Vec::new();
        for byte in &image {
            frames.extend(splitter.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &image[..]);
    }

    #[test]
    fn skips_leading_garbage() {
        let mut splitter = JpegSplitter::default();
        let mut stream = b"noise".to_vec();
        stream.extend(jpeg(b"x"));
        let frames = splitter.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][..2], JPEG_SOI);
    }

    #[test]
    fn soi_bytes_do_not_count_as_eoi() {
        let mut splitter = JpegSplitter::default();
        // FF D8 D9: the D8 belongs to SOI, so no image yet
        assert!(splitter.push(&[0xFF, 0xD8, 0xD9]).is_empty());
        let frames = splitter.push(&JPEG_EOI);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0xFF, 0xD8, 0xD9, 0xFF, 0xD9]);
    }

    #[test]
    fn discards_oversized_image() {
        let mut splitter = JpegSplitter::new(16);
        let mut stream = JPEG_SOI.to_vec();
        stream.extend(vec![0u8; 32]);
        assert!(splitter.push(&stream).is_empty());
        assert_eq!(splitter.dropped(), 1);

        // Tail of the oversized image is ignored, next image is fine
        let mut next = vec![1u8; 4];
        next.extend(JPEG_EOI);
        next.extend(jpeg(b"ok"));
        let frames = splitter.push(&next);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg(b"ok")[..]);
    }
}
