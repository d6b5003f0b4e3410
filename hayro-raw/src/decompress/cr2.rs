//! Canon CR2 lossless JPEG with vertical slices.
//!
//! The frame is one long run of samples. It is cut into slices, each `width` columns wide and
//! as many rows high as the frame. Slices fill the image column by column, top to bottom, and
//! a slice that reaches the bottom of the image continues at the top of the next column.

use crate::cursor::ByteStream;
use crate::decompress::LJpegDecompressor;
use crate::error::{DecodingError, Result, UnsupportedError, bail};
use crate::image::{RawImage, RawImageType};
use crate::log::ldebug;

const MAX_WIDTH: usize = 19440;
const MAX_HEIGHT: usize = 5920;

/// The slice widths of a CR2 frame, in image columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cr2Slices {
    /// The number of slices.
    pub count: usize,
    /// The width of all but the last slice.
    pub width: usize,
    /// The width of the last slice.
    pub last_width: usize,
}

impl Cr2Slices {
    /// A single slice.
    pub fn single(width: usize) -> Self {
        Self {
            count: 1,
            width: 0,
            last_width: width,
        }
    }

    fn widths(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).map(|i| {
            if i + 1 == self.count {
                self.last_width
            } else {
                self.width
            }
        })
    }

    /// Walk the rows of all slices in frame order, calling `visit` with the position and width
    /// of each row in the image.
    ///
    /// Slices below the image are ignored. Fails unless the rows cover the image exactly.
    fn walk(
        &self,
        width: usize,
        height: usize,
        frame_rows: usize,
        mut visit: impl FnMut(usize, usize, usize) -> Result<()>,
    ) -> Result<()> {
        let (mut x, mut y) = (0, 0);
        let mut column_width = 0;

        'slices: for slice_width in self.widths() {
            for _ in 0..frame_rows {
                if x >= width {
                    break 'slices;
                }

                if y == 0 {
                    column_width = slice_width;
                } else if slice_width != column_width {
                    bail!(DecodingError::Corrupt("CR2 slice width changes within a column"));
                }

                if x + slice_width > width {
                    bail!(DecodingError::Corrupt("CR2 slice extends past the image"));
                }

                visit(x, y, slice_width)?;
                y += 1;

                if y == height {
                    y = 0;
                    x += slice_width;
                }
            }
        }

        if x != width || y != 0 {
            bail!(DecodingError::Corrupt("CR2 slices do not cover the image"));
        }

        Ok(())
    }
}

/// Decodes the raw data of a CR2 file.
#[derive(Debug)]
pub struct Cr2Decompressor<'a> {
    ljpeg: LJpegDecompressor<'a>,
    slices: Option<Cr2Slices>,
}

impl<'a> Cr2Decompressor<'a> {
    /// Create a decompressor. Without `slices`, the frame is expected to be a single slice.
    pub fn new(input: ByteStream<'a>, slices: Option<Cr2Slices>) -> Self {
        Self {
            ljpeg: LJpegDecompressor::new(input),
            slices,
        }
    }

    /// Decode into a single-component 16-bit image and return the sample precision.
    pub fn decode(&self, image: &mut RawImage) -> Result<u8> {
        let dim = image.uncropped_dim();
        let (width, height) = (dim.x as usize, dim.y as usize);

        if image.data_type() != RawImageType::U16 || image.cpp() != 1 {
            bail!(UnsupportedError::Feature("CR2 data for this image layout"));
        }

        if width == 0 || height == 0 || width > MAX_WIDTH || height > MAX_HEIGHT {
            bail!(DecodingError::InvalidDimensions {
                width: width as u32,
                height: height as u32,
            });
        }

        let header = self.ljpeg.frame_header()?;
        let cps = header.components as usize;

        match cps {
            2 | 4 => {}
            3 => bail!(UnsupportedError::Feature("subsampled CR2")),
            _ => bail!(DecodingError::ComponentMismatch {
                expected: 2,
                found: cps as u32,
            }),
        }

        let frame_width = header.width as usize * cps;
        // Some cameras store half of the rows in the header.
        let frame_rows = if frame_width > 2 * header.height as usize {
            2 * header.height as usize
        } else {
            header.height as usize
        };

        let slices = match self.slices {
            Some(slices) => slices,
            None if frame_width <= width => Cr2Slices::single(frame_width),
            None => bail!(DecodingError::Corrupt("unknown CR2 slicing")),
        };

        ldebug!(
            "cr2 frame {}x{} with {} components, slices {:?}",
            header.width,
            frame_rows,
            cps,
            slices
        );

        for slice_width in [slices.width, slices.last_width] {
            if slice_width % cps != 0 {
                bail!(DecodingError::Corrupt("CR2 slice width is not a multiple of the components"));
            }
        }

        if slices.widths().any(|w| w == 0) {
            bail!(DecodingError::Corrupt("CR2 slice is empty"));
        }

        if frame_width * frame_rows < width * height {
            bail!(DecodingError::Corrupt("CR2 frame is smaller than the image"));
        }

        slices.walk(width, height, frame_rows, |_, _, _| Ok(()))?;

        let (_, samples) = self.ljpeg.decode_sequential(width * height, |_| frame_rows)?;
        let mut out = image.as_array2d_mut::<u16>()?;
        let mut pos = 0;

        slices.walk(width, height, frame_rows, |x, y, w| {
            let src = samples
                .get(pos..pos + w)
                .ok_or(DecodingError::Corrupt("CR2 frame ended early"))?;
            out.row_mut(y)[x..x + w].copy_from_slice(src);
            pos += w;

            Ok(())
        })?;

        Ok(header.precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Endianness;
    use crate::image::Point;
    use crate::testutil::LJpegStream;

    fn image(width: i32, height: i32) -> RawImage {
        let mut image = RawImage::new(RawImageType::U16);
        image.set_dim(Point::new(width, height)).unwrap();
        image.create_data(1 << 16).unwrap();

        image
    }

    fn rows(image: &RawImage) -> Vec<Vec<u16>> {
        let view = image.as_array2d::<u16>().unwrap();
        view.rows().map(<[u16]>::to_vec).collect()
    }

    fn decode(data: &[u8], slices: Option<Cr2Slices>, img: &mut RawImage) -> Result<u8> {
        let input = ByteStream::from_slice(data, Endianness::Little).unwrap();
        Cr2Decompressor::new(input, slices).decode(img)
    }

    #[test]
    fn two_slices() {
        // An image of 6x3 cut into slices of 4 and 2 columns. The frame holds 3x3 pixels
        // with 2 components.
        let expected = [
            [1, 2, 3, 4, 13, 14],
            [5, 6, 7, 8, 15, 16],
            [9, 10, 11, 12, 17, 18],
        ];
        let frame: Vec<u16> = (1..=18).collect();
        let data = LJpegStream::new(3, 3, 2, 1).encode(&frame);

        let slices = Cr2Slices {
            count: 2,
            width: 4,
            last_width: 2,
        };
        let mut img = image(6, 3);

        assert_eq!(decode(&data, Some(slices), &mut img).unwrap(), 12);
        assert_eq!(rows(&img), expected.map(|r| r.to_vec()));
    }

    #[test]
    fn slice_wraps_into_next_column() {
        // A single slice of 2 columns and 4 rows fills both columns of a 4x2 image.
        let frame = [1, 2, 3, 4, 5, 6, 7, 8];
        let data = LJpegStream::new(1, 4, 2, 1).encode(&frame);
        let mut img = image(4, 2);

        decode(&data, Some(Cr2Slices::single(2)), &mut img).unwrap();
        assert_eq!(rows(&img), [vec![1, 2, 5, 6], vec![3, 4, 7, 8]]);
    }

    #[test]
    fn guessed_single_slice() {
        let frame: Vec<u16> = (0..16).collect();
        let data = LJpegStream::new(2, 4, 2, 1).encode(&frame);

        let mut img = image(4, 4);
        decode(&data, None, &mut img).unwrap();
        assert_eq!(rows(&img)[3], [12, 13, 14, 15]);

        // The frame is wider than the image.
        let mut img = image(2, 8);
        assert!(decode(&data, None, &mut img).is_err());
    }

    #[test]
    fn doubled_frame_height() {
        // The header claims one row of 3x2 samples, the data holds two.
        let samples: Vec<u16> = (10..22).collect();
        let mut stream = LJpegStream::new(3, 2, 2, 1);
        let data = stream.encode(&samples);
        let sof = data.windows(2).position(|w| w == [0xff, 0xc3]).unwrap();
        stream.height = 1;
        let mut patched = data.clone();
        patched[sof..sof + stream.sof().len()].copy_from_slice(&stream.sof());

        let mut img = image(6, 2);
        decode(&patched, None, &mut img).unwrap();
        assert_eq!(rows(&img), [(10..16).collect::<Vec<_>>(), (16..22).collect()]);
    }

    #[test]
    fn invalid_slicing() {
        let frame: Vec<u16> = (0..24).collect();
        let data = LJpegStream::new(2, 6, 2, 1).encode(&frame);

        let cases = [
            // Odd slice width.
            Cr2Slices {
                count: 2,
                width: 3,
                last_width: 3,
            },
            // The second slice changes the width in the middle of a column.
            Cr2Slices {
                count: 2,
                width: 2,
                last_width: 4,
            },
            // The slices end before the image is covered.
            Cr2Slices::single(2),
            Cr2Slices {
                count: 1,
                width: 0,
                last_width: 0,
            },
        ];

        for slices in cases {
            let mut img = image(6, 4);
            assert!(decode(&data, Some(slices), &mut img).is_err(), "{slices:?}");
        }

        // Three components are subsampled.
        let data = LJpegStream::new(2, 2, 3, 1).encode(&[0; 12]);
        let mut img = image(6, 2);
        assert!(matches!(
            decode(&data, None, &mut img),
            Err(crate::error::DecodeError::Unsupported(_))
        ));
    }
}
