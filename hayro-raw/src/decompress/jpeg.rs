//! Lossy baseline JPEG tiles, as used by lossy DNG files.

use std::io::Cursor;

use zune_jpeg::JpegDecoder;
use zune_jpeg::zune_core::colorspace::ColorSpace;
use zune_jpeg::zune_core::options::DecoderOptions;

use crate::error::{DecodingError, Result, bail};
use crate::log::ldebug;
use crate::scheduler::DecodedTile;

/// A decompressor for one baseline JPEG tile.
#[derive(Debug, Clone, Copy)]
pub struct JpegDecompressor<'a> {
    input: &'a [u8],
}

impl<'a> JpegDecompressor<'a> {
    /// Create a new decompressor.
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Decode the tile whose top-left pixel is at `(x, y)` of an image with `cpp`
    /// components per pixel.
    ///
    /// The JPEG must have exactly `cpp` components and may not be larger than `slot`, the
    /// size of the tile in pixels. Its 8-bit samples are widened to 16 bits.
    pub fn decode_tile(
        &self,
        x: usize,
        y: usize,
        cpp: u32,
        slot: (usize, usize),
    ) -> Result<DecodedTile<u16>> {
        let out_colorspace = match cpp {
            1 => ColorSpace::Luma,
            3 => ColorSpace::RGB,
            _ => bail!(DecodingError::ComponentMismatch {
                expected: 3,
                found: cpp,
            }),
        };

        let options = DecoderOptions::default()
            .set_max_width(u16::MAX as usize)
            .set_max_height(u16::MAX as usize);
        let mut decoder = JpegDecoder::new_with_options(Cursor::new(self.input), options);
        decoder.decode_headers().map_err(|_| DecodingError::Jpeg)?;

        let found = decoder
            .input_colorspace()
            .ok_or(DecodingError::Jpeg)?
            .num_components() as u32;

        if found != cpp {
            bail!(DecodingError::ComponentMismatch {
                expected: cpp,
                found,
            });
        }

        let (width, height) = decoder.dimensions().ok_or(DecodingError::Jpeg)?;
        ldebug!("jpeg tile: {}x{}, {} components", width, height, found);

        if width > slot.0 || height > slot.1 {
            bail!(DecodingError::Corrupt("jpeg is larger than its tile"));
        }

        decoder.set_options(options.jpeg_set_out_colorspace(out_colorspace));
        let pixels = decoder.decode().map_err(|_| DecodingError::Jpeg)?;

        let width = width * cpp as usize;

        if pixels.len() < width * height {
            bail!(DecodingError::Jpeg);
        }

        Ok(DecodedTile {
            x: x * cpp as usize,
            y,
            width,
            data: pixels[..width * height].iter().map(|p| *p as u16).collect(),
        })
    }
}
