//! DNG and plain TIFF raw files.

use std::sync::{Mutex, PoisonError};

use crate::buffer::{Buffer, Endianness};
use crate::camera::CameraMetadata;
use crate::cursor::ByteStream;
use crate::decoder::{DecodeSettings, DecoderContext, RawDecoder};
use crate::decompress::{
    BitPacking, DeflateDecompressor, JpegDecompressor, LJpegDecompressor, TRUNCATED,
    UncompressedDecompressor,
};
use crate::error::{DecodingError, FormatError, Result, UnsupportedError, bail};
use crate::image::{
    Array2dMut, BlackArea, CfaColor, ColorFilterArray, Point, RawImage, RawImageType, Rect,
};
use crate::log::{ldebug, lwarn};
use crate::scheduler::{DecodedTile, collect_errors, decode_rows, decode_tiles};
use crate::tiff::{IfdId, TiffIfd, TiffTree, tags};

const DECODER_VERSION: u32 = 0;

const COMPRESSION_NONE: u32 = 1;
const COMPRESSION_LJPEG: u32 = 7;
const COMPRESSION_DEFLATE: u32 = 8;
const COMPRESSION_ADOBE_DEFLATE: u32 = 32946;
const COMPRESSION_LOSSY_JPEG: u32 = 34892;

const PHOTOMETRIC_CFA: u32 = 32803;

/// A strip or tile of the raw IFD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slice {
    offset: u32,
    count: u32,
    /// The position in pixels.
    x: u32,
    y: u32,
    /// The size of the slot in pixels. Slots at the right and bottom edges may extend past
    /// the image.
    width: u32,
    height: u32,
}

impl Slice {
    /// The part of the slot inside the image, in pixels.
    fn clipped(&self, layout: &RawLayout) -> (usize, usize) {
        (
            self.width.min(layout.width - self.x) as usize,
            self.height.min(layout.height - self.y) as usize,
        )
    }
}

/// Read an uncompressed slice of `width` samples and `height` rows into its own buffer.
///
/// A short slice keeps the complete rows and records the truncation.
fn read_tile<T: Copy + Default>(
    slice: &Slice,
    width: usize,
    height: usize,
    cpp: usize,
    errors: &Mutex<Vec<String>>,
    read: impl FnOnce(&mut Array2dMut<'_, T>) -> Result<usize>,
) -> Result<DecodedTile<T>> {
    let mut data = vec![T::default(); width * height];
    let rows = read(&mut Array2dMut::new(&mut data, width, height, width)?)?;

    if rows < height {
        lwarn!("strip at row {} ends after {} of {} rows", slice.y, rows, height);
        errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TRUNCATED.to_string());
        data.truncate(rows * width);
    }

    Ok(DecodedTile {
        x: slice.x as usize * cpp,
        y: slice.y as usize,
        width,
        data,
    })
}

/// The layout of the raw IFD.
#[derive(Debug, Clone, Copy)]
struct RawLayout {
    compression: u32,
    width: u32,
    height: u32,
    bits_per_sample: u32,
    cpp: u32,
    predictor: u32,
}

/// A decoder for DNG files and TIFF files that store the raw data in a regular IFD.
pub struct TiffDecoder<'a> {
    buffer: Buffer<'a>,
    tree: TiffTree<'a>,
    ctx: DecoderContext,
}

impl<'a> TiffDecoder<'a> {
    /// Parse the TIFF structure of the file.
    pub fn new(buffer: Buffer<'a>, settings: DecodeSettings) -> Result<Self> {
        Ok(Self {
            buffer,
            tree: TiffTree::parse(buffer)?,
            ctx: DecoderContext::new(settings, DECODER_VERSION),
        })
    }

    /// The parsed TIFF tree.
    pub fn tree(&self) -> &TiffTree<'a> {
        &self.tree
    }

    fn is_dng(&self) -> bool {
        self.tree.has_entry_recursive(tags::DNGVERSION)
    }

    /// DNG 1.0 writers emitted broken 16-bit differences in lossless JPEG data.
    fn needs_ljpeg_fix(&self) -> bool {
        let Some(version) = self.tree.get_entry_recursive(self.tree.root(), tags::DNGVERSION) else {
            return false;
        };

        match (version.get_u8(0), version.get_u8(1)) {
            (Ok(major), Ok(minor)) => major <= 1 && minor < 1,
            _ => false,
        }
    }

    /// Find the IFD with the raw data.
    ///
    /// Candidates have a compression and strip or tile offsets and are not reduced
    /// resolution images. Full resolution images (`NEWSUBFILETYPE` 0) win over others, then
    /// the largest width.
    fn raw_ifd(&self) -> Result<IfdId> {
        let mut best: Option<(bool, u32, IfdId)> = None;

        for id in self.tree.get_ifds_with_tag(tags::COMPRESSION) {
            let ifd = self.tree.ifd(id);

            if !ifd.has_entry(tags::STRIPOFFSETS) && !ifd.has_entry(tags::TILEOFFSETS) {
                continue;
            }

            let subfile = ifd
                .find_entry(tags::NEWSUBFILETYPE)
                .and_then(|e| e.get_u32(0).ok())
                .unwrap_or(0);

            if subfile & 1 != 0 {
                continue;
            }

            let width = ifd
                .find_entry(tags::IMAGEWIDTH)
                .and_then(|e| e.get_u32(0).ok())
                .unwrap_or(0);
            let key = (subfile == 0, width, id);

            if best.is_none_or(|(main, w, _)| (key.0, key.1) > (main, w)) {
                best = Some(key);
            }
        }

        best.map(|(_, _, id)| id)
            .ok_or(FormatError::Corrupt("no raw image data found").into())
    }

    fn layout(&self, ifd: &TiffIfd<'a>) -> Result<RawLayout> {
        let value = |tag| -> Result<u32> { ifd.get_entry(tag)?.get_u32(0) };
        let value_or = |tag, default| -> Result<u32> {
            ifd.find_entry(tag).map_or(Ok(default), |e| e.get_u32(0))
        };

        let layout = RawLayout {
            compression: value(tags::COMPRESSION)?,
            width: value(tags::IMAGEWIDTH)?,
            height: value(tags::IMAGELENGTH)?,
            bits_per_sample: value(tags::BITSPERSAMPLE)?,
            cpp: value_or(tags::SAMPLESPERPIXEL, 1)?,
            predictor: value_or(tags::PREDICTOR, 1)?,
        };

        if !(1..=4).contains(&layout.cpp) {
            bail!(UnsupportedError::Feature("more than 4 samples per pixel"));
        }

        if layout.width == 0 || layout.height == 0 {
            bail!(DecodingError::InvalidDimensions {
                width: layout.width,
                height: layout.height,
            });
        }

        Ok(layout)
    }

    /// The strips or tiles of the raw IFD, in row-major order.
    fn slices(&self, ifd: &TiffIfd<'a>, layout: &RawLayout) -> Result<Vec<Slice>> {
        let (width, height) = (layout.width, layout.height);

        if let Some(offsets) = ifd.find_entry(tags::TILEOFFSETS) {
            let counts = ifd.get_entry(tags::TILEBYTECOUNTS)?;
            let tile_width = ifd.get_entry(tags::TILEWIDTH)?.get_u32(0)?;
            let tile_height = ifd.get_entry(tags::TILELENGTH)?.get_u32(0)?;
            let max = self.ctx.settings().max_dimension;

            if tile_width == 0 || tile_height == 0 || tile_width > max || tile_height > max {
                bail!(DecodingError::InvalidDimensions {
                    width: tile_width,
                    height: tile_height,
                });
            }

            let tiles_x = width.div_ceil(tile_width);
            let tiles_y = height.div_ceil(tile_height);

            if offsets.count() as u64 != tiles_x as u64 * tiles_y as u64
                || counts.count() != offsets.count()
            {
                bail!(FormatError::Corrupt("tile count does not match the image size"));
            }

            return (0..offsets.count())
                .map(|i| -> Result<Slice> {
                    Ok(Slice {
                        offset: offsets.get_u32(i)?,
                        count: counts.get_u32(i)?,
                        x: (i % tiles_x) * tile_width,
                        y: (i / tiles_x) * tile_height,
                        width: tile_width,
                        height: tile_height,
                    })
                })
                .collect();
        }

        let offsets = ifd.get_entry(tags::STRIPOFFSETS)?;
        let counts = ifd.get_entry(tags::STRIPBYTECOUNTS)?;

        if counts.count() != offsets.count() {
            bail!(FormatError::Corrupt("strip offsets and byte counts do not match"));
        }

        let rows_per_strip = ifd
            .find_entry(tags::ROWSPERSTRIP)
            .map_or(Ok(height), |e| e.get_u32(0))?
            .clamp(1, height);

        let mut slices = Vec::with_capacity(offsets.count() as usize);

        for i in 0..offsets.count() {
            let y = i as u64 * rows_per_strip as u64;

            if y >= height as u64 {
                lwarn!("skipping strip {} that starts below the image", i);
                continue;
            }

            slices.push(Slice {
                offset: offsets.get_u32(i)?,
                count: counts.get_u32(i)?,
                x: 0,
                y: y as u32,
                width,
                height: rows_per_strip,
            });
        }

        Ok(slices)
    }

    fn slice_stream(&self, slice: &Slice) -> Result<ByteStream<'a>> {
        ByteStream::new(self.buffer, self.tree.ifd(self.tree.root()).endianness())
            .get_sub_stream(slice.offset, slice.count)
    }

    fn decode_uncompressed(
        &self,
        image: &mut RawImage,
        slices: Vec<Slice>,
        layout: &RawLayout,
    ) -> Result<()> {
        let endianness = self.tree.ifd(self.tree.root()).endianness();
        let bits = layout.bits_per_sample;
        let cpp = layout.cpp as usize;
        let threads = self.ctx.settings().threads;

        if image.data_type() == RawImageType::F32 && endianness != Endianness::Little {
            bail!(UnsupportedError::Feature("big-endian floating-point samples"));
        }

        let packing = if bits == 16 && endianness == Endianness::Little {
            BitPacking::Lsb
        } else {
            BitPacking::Msb
        };

        let pitch = |slice: &Slice| -> Result<u32> {
            let pitch = (slice.width as u64 * layout.cpp as u64 * bits as u64).div_ceil(8);

            u32::try_from(pitch).map_err(|_| DecodingError::Corrupt("row is too large").into())
        };

        collect_errors(image, |image, errors| match image.data_type() {
            RawImageType::F32 => {
                if bits != 32 {
                    bail!(UnsupportedError::BitsPerSample(bits));
                }

                let mut view = image.as_array2d_mut::<f32>()?;

                decode_tiles(&mut view, slices, threads, errors, |_, slice| {
                    let (width, height) = slice.clipped(layout);
                    let mut input = UncompressedDecompressor::new(self.slice_stream(&slice)?);
                    let pitch = pitch(&slice)?;

                    read_tile(&slice, width * cpp, height, cpp, errors, |out| {
                        input.read_float_rows(out, pitch)
                    })
                })
            }
            RawImageType::U16 => {
                let mut view = image.as_array2d_mut::<u16>()?;

                decode_tiles(&mut view, slices, threads, errors, |_, slice| {
                    let (width, height) = slice.clipped(layout);
                    let mut input = UncompressedDecompressor::new(self.slice_stream(&slice)?);
                    let pitch = pitch(&slice)?;

                    read_tile(&slice, width * cpp, height, cpp, errors, |out| {
                        input.read_rows(out, pitch, bits, packing)
                    })
                })
            }
        })
    }

    fn decode_ljpeg(
        &self,
        image: &mut RawImage,
        slices: Vec<Slice>,
        layout: &RawLayout,
        fix_dng_16_bug: bool,
    ) -> Result<()> {
        let cpp = layout.cpp as usize;
        let threads = self.ctx.settings().threads;

        collect_errors(image, |image, errors| {
            let mut view = image.as_array2d_mut::<u16>()?;

            decode_tiles(&mut view, slices, threads, errors, |_, slice| {
                let (width, height) = slice.clipped(layout);

                LJpegDecompressor::new(self.slice_stream(&slice)?)
                    .fix_dng_16_bug(fix_dng_16_bug)
                    .decode_tile(
                        slice.x as usize * cpp,
                        slice.y as usize,
                        (slice.width as usize * cpp, slice.height as usize),
                        (width * cpp, height),
                    )
            })
        })
    }

    fn decode_deflate(
        &self,
        image: &mut RawImage,
        slices: Vec<Slice>,
        layout: &RawLayout,
    ) -> Result<()> {
        let threads = self.ctx.settings().threads;
        let layout = *layout;

        let new_decoder = |slice: &Slice| {
            DeflateDecompressor::new(
                self.slice_stream(slice)?,
                layout.predictor,
                layout.bits_per_sample,
                layout.cpp,
            )
        };

        collect_errors(image, |image, errors| match image.data_type() {
            RawImageType::F32 => {
                let mut view = image.as_array2d_mut::<f32>()?;

                decode_tiles(&mut view, slices, threads, errors, |_, slice| {
                    let (width, height) = slice.clipped(&layout);

                    new_decoder(&slice)?.decode_float_tile(
                        slice.x as usize,
                        slice.y as usize,
                        slice.width as usize,
                        width,
                        height,
                    )
                })
            }
            RawImageType::U16 => {
                let mut view = image.as_array2d_mut::<u16>()?;

                decode_tiles(&mut view, slices, threads, errors, |_, slice| {
                    let (width, height) = slice.clipped(&layout);

                    new_decoder(&slice)?.decode_int_tile(
                        slice.x as usize,
                        slice.y as usize,
                        slice.width as usize,
                        width,
                        height,
                    )
                })
            }
        })
    }

    fn decode_lossy_jpeg(
        &self,
        image: &mut RawImage,
        slices: Vec<Slice>,
        layout: &RawLayout,
    ) -> Result<()> {
        let threads = self.ctx.settings().threads;
        let cpp = layout.cpp;

        collect_errors(image, |image, errors| {
            let mut view = image.as_array2d_mut::<u16>()?;

            decode_tiles(&mut view, slices, threads, errors, |_, slice| -> Result<DecodedTile<u16>> {
                let input = self.slice_stream(&slice)?;

                JpegDecompressor::new(input.peek_remaining()).decode_tile(
                    slice.x as usize,
                    slice.y as usize,
                    cpp,
                    (slice.width as usize, slice.height as usize),
                )
            })
        })
    }

    /// Read black and white levels of a DNG raw IFD.
    fn read_levels(&self, ifd: &TiffIfd<'a>, image: &mut RawImage, layout: &RawLayout) -> Result<()> {
        if image.data_type() == RawImageType::U16 && layout.bits_per_sample <= 16 {
            image.metadata.white_point = Some((1 << layout.bits_per_sample) - 1);
        }

        if let Some(white) = ifd.find_entry(tags::WHITELEVEL)
            && white.is_int()
        {
            image.metadata.white_point = Some(white.get_u32(0)?);
        }

        if self.read_masked_areas(ifd, image)? {
            return Ok(());
        }

        let Some(black) = ifd.find_entry(tags::BLACKLEVEL) else {
            return Ok(());
        };

        let (rows, cols) = match ifd.find_entry(tags::BLACKLEVELREPEATDIM) {
            Some(dim) if dim.count() == 2 => (dim.get_u32(0)?, dim.get_u32(1)?),
            Some(_) => bail!(FormatError::Corrupt("black level repeat size has wrong count")),
            None => (1, 1),
        };

        if rows == 0 || cols == 0 || image.cpp() != 1 {
            return Ok(());
        }

        if rows < 2 || cols < 2 {
            image.metadata.black_level = Some(black.get_float(0)?.round() as i32);

            return Ok(());
        }

        if black.count() as u64 != rows as u64 * cols as u64 {
            bail!(FormatError::Corrupt("black level count does not match its repeat size"));
        }

        let mut separate = [0; 4];

        for (i, level) in separate.iter_mut().enumerate() {
            let (row, col) = (i as u32 / 2, i as u32 % 2);
            *level = black.get_float(row * cols + col)?.round() as i32;
        }

        image.metadata.black_level_separate = Some(separate);

        Ok(())
    }

    /// Record `MASKEDAREAS` that span the active area as black areas and measure the black
    /// levels from them.
    fn read_masked_areas(&self, ifd: &TiffIfd<'a>, image: &mut RawImage) -> Result<bool> {
        let Some(masked) = ifd.find_entry(tags::MASKEDAREAS) else {
            return Ok(false);
        };

        if !masked.is_int() {
            return Ok(false);
        }

        let dim = image.uncropped_dim();
        let active = match ifd.find_entry(tags::ACTIVEAREA) {
            Some(area) if area.count() == 4 => {
                let [top, left, bottom, right] = [0, 1, 2, 3].map(|i| area.get_u32(i).unwrap_or(0) as i32);
                Rect::new(left, top, right - left, bottom - top)
            }
            _ => Rect::new(0, 0, dim.x, dim.y),
        };

        let values = masked.get_u32_array(masked.count() / 4 * 4)?;

        for rect in values.chunks_exact(4) {
            let [top, left, bottom, right] = [0, 1, 2, 3].map(|j| rect[j] as i64);

            if left <= active.pos.x as i64 && right >= active.right() {
                image.metadata.black_areas.push(BlackArea {
                    offset: top as u32,
                    size: (bottom - top).max(0) as u32,
                    is_vertical: false,
                });
            } else if top <= active.pos.y as i64 && bottom >= active.bottom() {
                image.metadata.black_areas.push(BlackArea {
                    offset: left as u32,
                    size: (right - left).max(0) as u32,
                    is_vertical: true,
                });
            }
        }

        if image.metadata.black_areas.is_empty() {
            return Ok(false);
        }

        image.measure_black_areas(active)
    }

    /// Map the samples through `LINEARIZATIONTABLE`. Values past the end of the table map to
    /// its last entry.
    fn linearize(&self, ifd: &TiffIfd<'a>, image: &mut RawImage) -> Result<()> {
        let Some(entry) = ifd.find_entry(tags::LINEARIZATIONTABLE) else {
            return Ok(());
        };

        if image.data_type() != RawImageType::U16 {
            lwarn!("ignoring linearization table of floating-point image");

            return Ok(());
        }

        let table = entry.get_u16_array(entry.count().min(1 << 16))?;

        let Some(&last) = table.last() else {
            return Ok(());
        };

        ldebug!("linearization table with {} entries", table.len());

        let lookup: Vec<u16> = (0..1 << 16)
            .map(|v| table.get(v).copied().unwrap_or(last))
            .collect();
        let threads = self.ctx.settings().threads;

        collect_errors(image, |image, errors| {
            decode_rows(image.as_array2d_mut::<u16>()?, threads, errors, |_, band| {
                for row in 0..band.height() {
                    for v in band.row_mut(row) {
                        *v = lookup[*v as usize];
                    }
                }

                Ok(())
            })
        })
    }

    /// Apply `ACTIVEAREA` and the default crop of a DNG raw IFD.
    fn apply_crop(&self, ifd: &TiffIfd<'a>, image: &mut RawImage) -> Result<()> {
        let masked = !image.metadata.black_areas.is_empty();

        if let Some(area) = ifd.find_entry(tags::ACTIVEAREA) {
            if area.count() != 4 {
                bail!(FormatError::Corrupt("active area does not have 4 values"));
            }

            let [top, left, bottom, right] = [0, 1, 2, 3].map(|i| area.get_u32(i).unwrap_or(0) as i32);
            image.sub_frame(Rect::new(left, top, right - left, bottom - top));

            if !masked && image.crop().pos == Point::new(left, top) {
                if top > 0 {
                    image.metadata.black_areas.push(BlackArea {
                        offset: 0,
                        size: top as u32,
                        is_vertical: false,
                    });
                }

                if left > 0 {
                    image.metadata.black_areas.push(BlackArea {
                        offset: 0,
                        size: left as u32,
                        is_vertical: true,
                    });
                }
            }
        }

        if let (Some(origin), Some(size)) = (
            ifd.find_entry(tags::DEFAULTCROPORIGIN),
            ifd.find_entry(tags::DEFAULTCROPSIZE),
        ) {
            let origin = origin.get_float_array(2)?;
            let size = size.get_float_array(2)?;

            image.sub_frame(Rect::new(
                origin[0] as i32,
                origin[1] as i32,
                size[0] as i32,
                size[1] as i32,
            ));
        }

        Ok(())
    }
}

/// Read the CFA of a DNG raw IFD.
fn parse_cfa(ifd: &TiffIfd<'_>) -> Result<Option<ColorFilterArray>> {
    let Some(pattern) = ifd.find_entry(tags::CFAPATTERN) else {
        return Ok(None);
    };

    if let Some(layout) = ifd.find_entry(tags::CFALAYOUT)
        && layout.get_u32(0)? != 1
    {
        bail!(UnsupportedError::Feature("non-rectangular CFA layout"));
    }

    let (width, height) = match ifd.find_entry(tags::CFAREPEATPATTERNDIM) {
        Some(dim) if dim.count() == 2 => (dim.get_u32(1)?, dim.get_u32(0)?),
        Some(_) => bail!(FormatError::Corrupt("CFA repeat size has wrong count")),
        None => (2, 2),
    };

    if pattern.count() as u64 != width as u64 * height as u64 {
        bail!(FormatError::Corrupt("CFA pattern does not match its size"));
    }

    let colors = (0..pattern.count())
        .map(|i| pattern.get_u8(i).map(CfaColor::from_dng))
        .collect::<Result<Vec<_>>>()?;

    ColorFilterArray::from_colors(width, height, &colors).map(Some)
}

impl RawDecoder for TiffDecoder<'_> {
    fn check_support(&mut self, meta: &dyn CameraMetadata) -> Result<()> {
        if self.is_dng() {
            // Converted files of unknown cameras are fine.
            let Ok(id) = self.tree.get_id() else {
                return Ok(());
            };

            if !self.ctx.check_camera_known(meta, &id.make, &id.model, "dng")? {
                self.ctx.check_camera_known(meta, &id.make, &id.model, "")?;
            }

            return Ok(());
        }

        let id = self.tree.get_id()?;
        self.ctx.check_camera_supported(meta, &id.make, &id.model, "")?;

        Ok(())
    }

    fn decode_raw(&mut self) -> Result<RawImage> {
        let id = self.raw_ifd()?;
        let ifd = self.tree.ifd(id);
        let layout = self.layout(ifd)?;

        let ty = match ifd.find_entry(tags::SAMPLEFORMAT).map(|e| e.get_u32(0)).transpose()? {
            None | Some(1) => RawImageType::U16,
            Some(3) => RawImageType::F32,
            Some(_) => bail!(UnsupportedError::Feature("sample format")),
        };

        ldebug!(
            "raw ifd: {}x{}, {} bits, {} samples per pixel, compression {}",
            layout.width,
            layout.height,
            layout.bits_per_sample,
            layout.cpp,
            layout.compression
        );

        let mut image = RawImage::new(ty);
        image.set_dim(Point::new(layout.width as i32, layout.height as i32))?;
        image.set_cpp(layout.cpp)?;

        let photometric = ifd
            .find_entry(tags::PHOTOMETRICINTERPRETATION)
            .and_then(|e| e.get_u32(0).ok());

        if (layout.cpp == 1 || photometric == Some(PHOTOMETRIC_CFA))
            && let Some(cfa) = parse_cfa(ifd)?
        {
            image.metadata.cfa = cfa;
        }

        image.create_data(self.ctx.settings().max_dimension)?;

        let slices = self.slices(ifd, &layout)?;

        if slices.is_empty() {
            bail!(FormatError::Corrupt("raw image has no strips or tiles"));
        }

        match layout.compression {
            COMPRESSION_NONE => self.decode_uncompressed(&mut image, slices, &layout)?,
            COMPRESSION_LJPEG => {
                if ty != RawImageType::U16 {
                    bail!(UnsupportedError::Feature("floating-point lossless JPEG"));
                }

                let fix = self.needs_ljpeg_fix();
                self.decode_ljpeg(&mut image, slices, &layout, fix)?;
            }
            COMPRESSION_DEFLATE | COMPRESSION_ADOBE_DEFLATE => {
                self.decode_deflate(&mut image, slices, &layout)?;
            }
            COMPRESSION_LOSSY_JPEG => {
                if ty != RawImageType::U16 {
                    bail!(UnsupportedError::Feature("floating-point lossy JPEG"));
                }

                self.decode_lossy_jpeg(&mut image, slices, &layout)?;
            }
            c => bail!(UnsupportedError::Compression(c)),
        }

        if self.is_dng() {
            self.linearize(ifd, &mut image)?;
            self.read_levels(ifd, &mut image, &layout)?;

            if self.ctx.settings().apply_crop {
                self.apply_crop(ifd, &mut image)?;
            }
        } else if ty == RawImageType::U16 && layout.bits_per_sample <= 16 {
            image.metadata.white_point = Some((1 << layout.bits_per_sample) - 1);
        }

        Ok(image)
    }

    fn decode_metadata(&mut self, meta: &dyn CameraMetadata, image: &mut RawImage) -> Result<()> {
        let root = self.tree.root();
        let iso = self
            .tree
            .get_entry_recursive(root, tags::ISOSPEEDRATINGS)
            .and_then(|e| e.get_u32(0).ok())
            .unwrap_or(0);

        if let Some(neutral) = self.tree.get_entry_recursive(root, tags::ASSHOTNEUTRAL)
            && neutral.count() == 3
        {
            let values = neutral.get_float_array(3)?;

            if values.iter().all(|v| *v > 0.0) {
                image.metadata.wb_coeffs = Some([1.0 / values[0], 1.0 / values[1], 1.0 / values[2], 0.0]);
            }
        }

        let id = self.tree.get_id();

        if !self.is_dng() {
            let id = id?;

            return self.ctx.set_metadata(meta, image, &id.make, &id.model, "", iso);
        }

        image.metadata.iso_speed = iso;

        if let Ok(id) = id {
            let mode = ["dng", ""]
                .into_iter()
                .find(|mode| meta.get_camera(&id.make, &id.model, mode).is_some());

            image.metadata.make = id.make;
            image.metadata.model = id.model;
            image.metadata.mode = mode.unwrap_or_default().to_string();
        }

        Ok(())
    }

    fn context(&self) -> &DecoderContext {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::decoder::decode;
    use crate::decoder::tests::camera;
    use crate::error::DecodeError;
    use crate::testutil::{LJpegStream, TestEntry, TiffWriter};
    use crate::tiff::TiffDataType;

    fn dng_entries(w: &TiffWriter, width: u32, height: u32, bits: u16) -> Vec<TestEntry> {
        vec![
            w.longs(tags::NEWSUBFILETYPE, &[0]),
            w.longs(tags::IMAGEWIDTH, &[width]),
            w.longs(tags::IMAGELENGTH, &[height]),
            w.shorts(tags::BITSPERSAMPLE, &[bits]),
            w.shorts(tags::PHOTOMETRICINTERPRETATION, &[PHOTOMETRIC_CFA as u16]),
            w.shorts(tags::SAMPLESPERPIXEL, &[1]),
            w.shorts(tags::CFAREPEATPATTERNDIM, &[2, 2]),
            TestEntry::raw(tags::CFAPATTERN, TiffDataType::Byte, 4, vec![0, 1, 1, 2]),
            TestEntry::raw(tags::DNGVERSION, TiffDataType::Byte, 4, vec![1, 4, 0, 0]),
            w.ascii(tags::MAKE, "Canon"),
            w.ascii(tags::MODEL, "EOS 5D"),
        ]
    }

    enum Storage {
        Strips(u32),
        Tiles(u32, u32),
    }

    /// A little-endian DNG storing `slices` in order.
    fn dng_from_slices(
        width: u32,
        height: u32,
        bits: u16,
        compression: u16,
        storage: Storage,
        slices: &[Vec<u8>],
        extra: Vec<TestEntry>,
    ) -> Vec<u8> {
        let mut w = TiffWriter::new(false);
        let mut offsets = Vec::new();
        let mut counts = Vec::new();

        for slice in slices {
            offsets.push(w.append(slice));
            counts.push(slice.len() as u32);
        }

        let mut entries = dng_entries(&w, width, height, bits);
        entries.push(w.shorts(tags::COMPRESSION, &[compression]));

        match storage {
            Storage::Strips(rows) => {
                entries.push(w.longs(tags::ROWSPERSTRIP, &[rows]));
                entries.push(w.longs(tags::STRIPOFFSETS, &offsets));
                entries.push(w.longs(tags::STRIPBYTECOUNTS, &counts));
            }
            Storage::Tiles(tile_width, tile_height) => {
                entries.push(w.longs(tags::TILEWIDTH, &[tile_width]));
                entries.push(w.longs(tags::TILELENGTH, &[tile_height]));
                entries.push(w.longs(tags::TILEOFFSETS, &offsets));
                entries.push(w.longs(tags::TILEBYTECOUNTS, &counts));
            }
        }

        entries.extend(extra);
        entries.sort_by_key(|e| e.tag);

        let ifd = w.write_ifd(&entries, 0);
        w.set_first_ifd(ifd);
        let mut data = w.finish();
        data.resize(data.len().max(200), 0);

        data
    }

    /// A little-endian DNG with 16-bit uncompressed strips of two rows each.
    fn uncompressed_dng(width: u32, height: u32, extra: Vec<TestEntry>) -> Vec<u8> {
        let strips: Vec<Vec<u8>> = (0..height.div_ceil(2))
            .map(|strip| {
                let rows = 2.min(height - strip * 2);

                (0..rows * width)
                    .flat_map(|i| ((strip * 2 * width + i) as u16 * 10).to_le_bytes())
                    .collect()
            })
            .collect();

        dng_from_slices(width, height, 16, 1, Storage::Strips(2), &strips, extra)
    }

    fn value(x: u32, y: u32) -> u16 {
        ((y * 6 + x) * 50) as u16
    }

    fn ljpeg_strip(width: u32, y: u32, rows: u32) -> Vec<u8> {
        let samples: Vec<u16> = (y..y + rows)
            .flat_map(|y| (0..width).map(move |x| value(x, y)))
            .collect();

        LJpegStream::new(width as u16, rows as u16, 1, 1).encode(&samples)
    }

    fn decode_dng(data: &[u8]) -> crate::decoder::DecodedRaw {
        decode(data, &Vec::<Camera>::new(), &DecodeSettings::default()).unwrap()
    }

    fn assert_rows(image: &RawImage, rows: core::ops::Range<u32>, width: u32) {
        let view = image.as_array2d::<u16>().unwrap();

        for y in rows {
            for x in 0..width {
                assert_eq!(*view.get(y as usize, x as usize).unwrap(), value(x, y), "({x}, {y})");
            }
        }
    }

    #[test]
    fn uncompressed_strips() {
        let data = uncompressed_dng(6, 5, Vec::new());
        let decoded = decode(&data, &Vec::<Camera>::new(), &DecodeSettings::default()).unwrap();
        let image = &decoded.image;

        assert_eq!(image.dim(), Point::new(6, 5));
        let view = image.as_array2d::<u16>().unwrap();

        for y in 0..5 {
            for x in 0..6 {
                assert_eq!(*view.get(y, x).unwrap(), ((y * 6 + x) * 10) as u16);
            }
        }

        assert_eq!(decoded.metadata.cfa, ColorFilterArray::rggb());
        assert_eq!(decoded.metadata.white_point, Some(65535));
        assert_eq!(decoded.metadata.make, "Canon");
        assert_eq!(decoded.metadata.mode, "");
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn dng_levels_and_crop() {
        let w = TiffWriter::new(false);
        let extra = vec![
            w.shorts(tags::WHITELEVEL, &[4095]),
            w.shorts(tags::BLACKLEVELREPEATDIM, &[2, 2]),
            w.shorts(tags::BLACKLEVEL, &[10, 11, 12, 13]),
            w.longs(tags::ACTIVEAREA, &[1, 2, 5, 6]),
            w.shorts(tags::ISOSPEEDRATINGS, &[400]),
        ];
        let data = uncompressed_dng(6, 5, extra);
        let meta = vec![camera("Canon", "EOS 5D", "dng")];

        let decoded = decode(&data, &meta, &DecodeSettings::default()).unwrap();
        let metadata = &decoded.metadata;

        assert_eq!(decoded.image.crop(), Rect::new(2, 1, 4, 4));
        assert_eq!(metadata.white_point, Some(4095));
        assert_eq!(metadata.black_level_separate, Some([10, 11, 12, 13]));
        assert_eq!(metadata.iso_speed, 400);
        assert_eq!(metadata.mode, "dng");
        // The crop starts on an odd row.
        assert_eq!(metadata.cfa.color_at(0, 0), CfaColor::Green);
        assert_eq!(
            metadata.black_areas,
            [
                BlackArea {
                    offset: 0,
                    size: 1,
                    is_vertical: false
                },
                BlackArea {
                    offset: 0,
                    size: 2,
                    is_vertical: true
                },
            ]
        );

        let settings = DecodeSettings {
            apply_crop: false,
            ..DecodeSettings::default()
        };
        let decoded = decode(&data, &meta, &settings).unwrap();
        assert_eq!(decoded.image.dim(), Point::new(6, 5));
    }

    #[test]
    fn broken_strip_is_a_warning() {
        let mut data = uncompressed_dng(6, 4, Vec::new());
        let pos = data
            .windows(4)
            .position(|w| w == 24_u32.to_le_bytes())
            .unwrap();
        // Make the first strip longer than the file.
        data[pos..pos + 4].copy_from_slice(&0x00ff_0000_u32.to_le_bytes());

        let decoded = decode(&data, &Vec::<Camera>::new(), &DecodeSettings::default()).unwrap();
        assert_eq!(decoded.warnings.len(), 1);

        let strict = DecodeSettings {
            strict: true,
            ..DecodeSettings::default()
        };
        assert!(decode(&data, &Vec::<Camera>::new(), &strict).is_err());
    }

    #[test]
    fn deflate_tiles() {
        use std::io::Write;

        use flate2::Compression;
        use flate2::write::ZlibEncoder;

        let (width, height, tile) = (6_u32, 4_u32, 4_u32);
        let mut w = TiffWriter::new(false);
        let mut offsets = Vec::new();
        let mut counts = Vec::new();

        for ty in 0..1 {
            for tx in 0..2 {
                let samples: Vec<u8> = (0..tile * tile)
                    .flat_map(|i| ((tx * 100 + ty * 10 + i) as u16).to_le_bytes())
                    .collect();
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&samples).unwrap();
                let compressed = encoder.finish().unwrap();

                offsets.push(w.append(&compressed));
                counts.push(compressed.len() as u32);
            }
        }

        let mut entries = dng_entries(&w, width, height, 16);
        entries.push(w.shorts(tags::COMPRESSION, &[8]));
        entries.push(w.longs(tags::TILEWIDTH, &[tile]));
        entries.push(w.longs(tags::TILELENGTH, &[tile]));
        entries.push(w.longs(tags::TILEOFFSETS, &offsets));
        entries.push(w.longs(tags::TILEBYTECOUNTS, &counts));
        entries.sort_by_key(|e| e.tag);

        let ifd = w.write_ifd(&entries, 0);
        w.set_first_ifd(ifd);
        let mut data = w.finish();
        data.resize(data.len().max(200), 0);

        let decoded = decode(&data, &Vec::<Camera>::new(), &DecodeSettings::default()).unwrap();
        let view = decoded.image.as_array2d::<u16>().unwrap();

        assert_eq!(*view.get(0, 0).unwrap(), 0);
        assert_eq!(*view.get(1, 3).unwrap(), 7);
        assert_eq!(*view.get(0, 4).unwrap(), 100);
        assert_eq!(*view.get(3, 5).unwrap(), 113);
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn plain_tiff_needs_known_camera() {
        let mut data = uncompressed_dng(4, 2, Vec::new());
        // Turn the DNG version tag into an unknown private tag.
        let tag = tags::DNGVERSION.to_le_bytes();
        let pos = data.windows(2).position(|w| w == tag).unwrap();
        data[pos..pos + 2].copy_from_slice(&0xc000_u16.to_le_bytes());

        let settings = DecodeSettings {
            fail_on_unknown: true,
            ..DecodeSettings::default()
        };

        assert!(matches!(
            decode(&data, &Vec::<Camera>::new(), &settings),
            Err(DecodeError::Unsupported(UnsupportedError::UnknownCamera { .. }))
        ));

        let mut cam = camera("Canon", "EOS 5D", "");
        cam.crop_size = Point::new(2, 2);
        let decoded = decode(&data, &vec![cam], &settings).unwrap();
        assert_eq!(decoded.metadata.white_point, Some(4000));
        assert_eq!(decoded.image.dim(), Point::new(2, 2));
    }

    #[test]
    fn raw_ifd_selection() {
        let mut w = TiffWriter::new(true);
        let preview = [
            w.longs(tags::NEWSUBFILETYPE, &[1]),
            w.longs(tags::IMAGEWIDTH, &[4000]),
            w.shorts(tags::COMPRESSION, &[1]),
            w.longs(tags::STRIPOFFSETS, &[8]),
        ];
        let raw = [
            w.longs(tags::NEWSUBFILETYPE, &[0]),
            w.longs(tags::IMAGEWIDTH, &[100]),
            w.shorts(tags::COMPRESSION, &[7]),
            w.longs(tags::STRIPOFFSETS, &[8]),
        ];
        let second = w.write_ifd(&raw, 0);
        let first = w.write_ifd(&preview, second);
        w.set_first_ifd(first);
        let data = w.finish();

        let decoder = TiffDecoder::new(Buffer::new(&data).unwrap(), DecodeSettings::default()).unwrap();
        let id = decoder.raw_ifd().unwrap();
        let width = decoder.tree().ifd(id).get_entry(tags::IMAGEWIDTH).unwrap();
        assert_eq!(width.get_u32(0).unwrap(), 100);
    }

    #[test]
    fn short_strip_keeps_complete_rows() {
        let strips: Vec<Vec<u8>> = [0_u32, 2]
            .iter()
            .map(|&y| {
                (y * 6..(y + 2) * 6)
                    .flat_map(|i| value(i % 6, i / 6).to_le_bytes())
                    .collect()
            })
            .collect();
        // The second strip ends after one of its two rows.
        let short = [strips[0].clone(), strips[1][..12].to_vec()];
        let data = dng_from_slices(6, 4, 16, 1, Storage::Strips(2), &short, Vec::new());

        let decoded = decode_dng(&data);
        assert_rows(&decoded.image, 0..3, 6);
        let view = decoded.image.as_array2d::<u16>().unwrap();
        assert_eq!(view.row(3), [0; 6]);
        assert_eq!(decoded.warnings, [TRUNCATED]);
    }

    #[test]
    fn ljpeg_strips() {
        // The last strip is stored with the single row left in the image.
        let strips = [ljpeg_strip(6, 0, 2), ljpeg_strip(6, 2, 2), ljpeg_strip(6, 4, 1)];
        let data = dng_from_slices(6, 5, 12, 7, Storage::Strips(2), &strips, Vec::new());

        let decoded = decode_dng(&data);
        assert_rows(&decoded.image, 0..5, 6);
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn ljpeg_tiles() {
        // Two components per frame column, so a frame of 2x4 covers a tile of 4x4 pixels.
        let tiles: Vec<Vec<u8>> = [0_u32, 4]
            .iter()
            .map(|&x0| {
                let samples: Vec<u16> = (0..4)
                    .flat_map(|y| (x0..x0 + 4).map(move |x| if x < 6 { value(x, y) } else { 0 }))
                    .collect();

                LJpegStream::new(2, 4, 2, 1).encode(&samples)
            })
            .collect();
        let data = dng_from_slices(6, 4, 12, 7, Storage::Tiles(4, 4), &tiles, Vec::new());

        let decoded = decode_dng(&data);
        assert_rows(&decoded.image, 0..4, 6);
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn ljpeg_frame_taller_than_strip() {
        // The first frame holds four rows for a strip of two.
        let strips = [ljpeg_strip(6, 0, 4), ljpeg_strip(6, 2, 2)];
        let data = dng_from_slices(6, 4, 12, 7, Storage::Strips(2), &strips, Vec::new());

        let decoded = decode_dng(&data);
        let view = decoded.image.as_array2d::<u16>().unwrap();
        assert_eq!(view.row(0), [0; 6]);
        assert_eq!(view.row(1), [0; 6]);
        assert_rows(&decoded.image, 2..4, 6);
        assert_eq!(decoded.warnings.len(), 1);
    }

    #[test]
    fn ljpeg_frame_shorter_than_strip() {
        let strips = [ljpeg_strip(6, 0, 2), ljpeg_strip(6, 2, 1)];
        let data = dng_from_slices(6, 4, 12, 7, Storage::Strips(2), &strips, Vec::new());

        let decoded = decode_dng(&data);
        assert_rows(&decoded.image, 0..2, 6);
        let view = decoded.image.as_array2d::<u16>().unwrap();
        assert_eq!(view.row(2), [0; 6]);
        assert_eq!(decoded.warnings.len(), 1);

        // A single strip that fails fails the decode.
        let data = dng_from_slices(6, 2, 12, 7, Storage::Strips(2), &strips[1..], Vec::new());
        assert!(decode(&data, &Vec::<Camera>::new(), &DecodeSettings::default()).is_err());
    }

    #[test]
    fn lossy_jpeg_strip() {
        use image::ExtendedColorType;
        use image::codecs::jpeg::JpegEncoder;

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 100)
            .encode(&[128; 16 * 8], 16, 8, ExtendedColorType::L8)
            .unwrap();
        let data = dng_from_slices(16, 8, 8, 34892, Storage::Strips(8), &[jpeg], Vec::new());

        let decoded = decode_dng(&data);
        let view = decoded.image.as_array2d::<u16>().unwrap();

        assert!(view.rows().flatten().all(|v| (126..=130).contains(v)));
        assert_eq!(decoded.metadata.white_point, Some(255));
    }

    #[test]
    fn huge_tile_width() {
        let tiles = [vec![0; 64]];
        let data = dng_from_slices(6, 4, 16, 8, Storage::Tiles(u32::MAX, 4), &tiles, Vec::new());

        assert!(matches!(
            decode(&data, &Vec::<Camera>::new(), &DecodeSettings::default()),
            Err(DecodeError::Decoding(DecodingError::InvalidDimensions { .. }))
        ));
    }

    #[test]
    fn linearization_table() {
        let w = TiffWriter::new(false);
        let table: Vec<u16> = (0..200).map(|v| v / 10).collect();
        let data = uncompressed_dng(6, 5, vec![w.shorts(tags::LINEARIZATIONTABLE, &table)]);

        let decoded = decode_dng(&data);
        let view = decoded.image.as_array2d::<u16>().unwrap();

        assert_eq!(view.row(0), [0, 1, 2, 3, 4, 5]);
        // Values from 200 on are past the end of the table.
        assert_eq!(view.row(4), [19; 6]);
    }

    #[test]
    fn masked_area_black_levels() {
        let w = TiffWriter::new(false);
        let extra = vec![
            w.longs(tags::ACTIVEAREA, &[2, 0, 5, 6]),
            w.shorts(tags::MASKEDAREAS, &[0, 0, 2, 6]),
            w.shorts(tags::BLACKLEVEL, &[7]),
        ];
        let data = uncompressed_dng(6, 5, extra);

        let decoded = decode_dng(&data);
        let metadata = &decoded.metadata;

        // Rows 0 and 1 hold 0, 10, .., 110.
        assert_eq!(metadata.black_level_separate, Some([20, 30, 80, 90]));
        assert_eq!(metadata.black_level, Some(55));
        assert_eq!(
            metadata.black_areas,
            [BlackArea {
                offset: 0,
                size: 2,
                is_vertical: false
            }]
        );
        assert_eq!(decoded.image.crop(), Rect::new(0, 2, 6, 3));
    }
}
