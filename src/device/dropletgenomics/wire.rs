//! Video feed framing.
//!
//! The rig's `/video_feed` body is an unbounded sequence of
//! `[36-byte separator][PNG image]` records with no length prefix. PNG is
//! self-delimiting, so each image is cut out by walking its chunk list up to
//! and including `IEND`. Nothing is decoded here; `decode_png` is a separate
//! step so the acquisition loop can skip decoding images it will not publish.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, ImageFormat};
use std::io::Read;

/// Size of the separator block preceding every image.
pub const SEPARATOR_LEN: usize = 36;

/// Upper bound on one encoded image; anything larger is treated as a corrupt
/// feed.
pub const MAX_PNG_BYTES: usize = 16 * 1024 * 1024;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const IEND: &[u8; 4] = b"IEND";

/// Splits a raw feed into encoded PNG images.
pub struct FeedReader<R> {
    reader: R,
    images_read: u64,
}

impl<R: Read> FeedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            images_read: 0,
        }
    }

    pub fn images_read(&self) -> u64 {
        self.images_read
    }

    /// Read the next separator and the PNG that follows it.
    pub fn next_png(&mut self) -> Result<Vec<u8>> {
        let mut separator = [0u8; SEPARATOR_LEN];
        self.reader
            .read_exact(&mut separator)
            .context("read feed separator")?;

        let mut png = Vec::with_capacity(64 * 1024);
        let mut signature = [0u8; 8];
        self.reader
            .read_exact(&mut signature)
            .context("read png signature")?;
        if signature != PNG_SIGNATURE {
            return Err(anyhow!("feed record does not start with a png signature"));
        }
        png.extend_from_slice(&signature);

        loop {
            let mut header = [0u8; 8];
            self.reader
                .read_exact(&mut header)
                .context("read png chunk header")?;
            let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let chunk_type = [header[4], header[5], header[6], header[7]];

            // Chunk data plus its 4-byte CRC.
            let body_len = length + 4;
            if png.len() + header.len() + body_len > MAX_PNG_BYTES {
                return Err(anyhow!("png image exceeds {} bytes", MAX_PNG_BYTES));
            }
            png.extend_from_slice(&header);
            let start = png.len();
            png.resize(start + body_len, 0);
            self.reader
                .read_exact(&mut png[start..])
                .with_context(|| format!("read png chunk {}", String::from_utf8_lossy(&chunk_type)))?;

            if &chunk_type == IEND {
                break;
            }
        }

        self.images_read += 1;
        Ok(png)
    }
}

/// Decode one PNG cut out of the feed.
pub fn decode_png(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory_with_format(bytes, ImageFormat::Png).context("decode png")
}
