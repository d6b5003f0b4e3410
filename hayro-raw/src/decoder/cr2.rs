//! Canon CR2 files.

use crate::buffer::{Buffer, Endianness};
use crate::camera::CameraMetadata;
use crate::cursor::ByteStream;
use crate::decoder::{DecodeSettings, DecoderContext, RawDecoder};
use crate::decompress::{Cr2Decompressor, Cr2Slices};
use crate::error::{DecodingError, FormatError, Result, UnsupportedError, bail};
use crate::image::{ColorFilterArray, Point, RawImage, RawImageType};
use crate::log::ldebug;
use crate::tiff::{IfdId, TiffEntry, TiffTree, tags};

const DECODER_VERSION: u32 = 0;

/// The IFD with the raw data, counting from zero.
const RAW_IFD: usize = 3;

/// `CANON_SRAWTYPE` of subsampled files.
const SRAW: u32 = 4;

/// Black and white levels in the color data are stored at this precision.
const COLOR_DATA_PRECISION: u8 = 14;

/// Where the white balance and the levels are found in a version of the color data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColorDataLayout {
    /// The index of the as-shot white balance.
    wb: u32,
    /// The indices of the four black levels and of the white level.
    levels: Option<(u32, u32)>,
    /// Whether the levels need to be scaled to the sample precision.
    rescale: bool,
}

impl ColorDataLayout {
    fn detect(entry: &TiffEntry<'_>) -> Option<Self> {
        let layout = |wb, levels| Self {
            wb,
            levels,
            rescale: true,
        };

        match entry.count() {
            582 => return Some(layout(25, None)),
            653 => return Some(layout(34, None)),
            _ => {}
        }

        Some(match entry.get_u16(0).ok()? as i16 {
            1..=3 => layout(63, None),
            4 | 5 => layout(63, Some((692, 697))),
            6 | 7 => layout(63, Some((715, 720))),
            9 => layout(63, Some((719, 724))),
            -4 => layout(71, Some((333, 1386))),
            -3 => Self {
                wb: 71,
                levels: Some((264, 662)),
                rescale: false,
            },
            10 if matches!(entry.count(), 1273 | 1275) => layout(63, Some((479, 484))),
            10 => layout(63, Some((504, 509))),
            11 => layout(63, Some((728, 733))),
            12 | 13 | 15 => layout(63, Some((778, 783))),
            14 => layout(63, Some((556, 561))),
            _ => return None,
        })
    }
}

/// A decoder for Canon CR2 files.
///
/// Only files with the raw data in the fourth IFD are supported. Older files store a bare
/// lossless JPEG stream elsewhere.
pub struct Cr2Decoder<'a> {
    buffer: Buffer<'a>,
    tree: TiffTree<'a>,
    ctx: DecoderContext,
    precision: u8,
}

impl<'a> Cr2Decoder<'a> {
    /// Parse the TIFF structure of the file.
    pub fn new(buffer: Buffer<'a>, settings: DecodeSettings) -> Result<Self> {
        let tree = TiffTree::parse(buffer)?;

        if tree.ifd(tree.root()).sub_ifds().count() <= RAW_IFD {
            bail!(UnsupportedError::Feature("CR2 files with fewer than four IFDs"));
        }

        if tree.get_id()?.make != "Canon" {
            bail!(FormatError::Corrupt("CR2 file is not from a Canon camera"));
        }

        Ok(Self {
            buffer,
            tree,
            ctx: DecoderContext::new(settings, DECODER_VERSION),
            precision: 0,
        })
    }

    /// Whether the data starts like a CR2 file.
    pub fn is_cr2(data: &[u8]) -> bool {
        TiffTree::is_tiff(data) && data.get(8..10) == Some(b"CR")
    }

    fn raw_ifd(&self) -> Result<IfdId> {
        self.tree
            .ifd(self.tree.root())
            .sub_ifds()
            .nth(RAW_IFD)
            .ok_or(FormatError::Corrupt("CR2 file has no raw IFD").into())
    }

    fn is_subsampled(&self) -> bool {
        self.raw_ifd().is_ok_and(|id| {
            self.tree
                .get_entry_recursive(id, tags::CANON_SRAWTYPE)
                .and_then(|e| e.get_u32(0).ok())
                == Some(SRAW)
        })
    }

    fn slices(&self, raw: IfdId) -> Result<Option<Cr2Slices>> {
        let Some(entry) = self.tree.get_entry_recursive(raw, tags::CANONCR2SLICE) else {
            return Ok(None);
        };

        if entry.count() != 3 {
            bail!(FormatError::Corrupt("CR2 slice entry does not have 3 values"));
        }

        let [count, width, last_width] = [0, 1, 2].map(|i| entry.get_u16(i).map(usize::from));
        let (count, width, last_width) = (count?, width?, last_width?);

        match (count, width, last_width) {
            (_, 1.., 1..) => Ok(Some(Cr2Slices {
                count: count + 1,
                width,
                last_width,
            })),
            (0, 0, 1..) => Ok(None),
            _ => bail!(DecodingError::Corrupt("unexpected CR2 slices")),
        }
    }

    fn iso_speed(&self) -> u32 {
        let value = |tag| {
            self.tree
                .get_entry_recursive(self.tree.root(), tag)
                .and_then(|e| e.get_u32(0).ok())
        };

        match value(tags::ISOSPEEDRATINGS) {
            Some(65535) => value(tags::RECOMMENDEDEXPOSUREINDEX).unwrap_or(65535),
            iso => iso.unwrap_or(0),
        }
    }

    /// Read the white balance and the levels from the color data.
    fn read_color_data(&self, image: &mut RawImage) -> Result<()> {
        let Some(entry) = self
            .tree
            .get_entry_recursive(self.tree.root(), tags::CANONCOLORDATA)
        else {
            return Ok(());
        };

        let Some(layout) = ColorDataLayout::detect(entry) else {
            ldebug!("unknown CR2 color data with {} values", entry.count());

            return Ok(());
        };

        let value = |index: u32| entry.get_u16(index);
        image.metadata.wb_coeffs = Some([
            value(layout.wb)? as f32,
            value(layout.wb + 1)? as f32,
            value(layout.wb + 3)? as f32,
            0.0,
        ]);

        let Some((black, white)) = layout.levels else {
            return Ok(());
        };

        let mut levels = [0; 4];

        for (i, level) in levels.iter_mut().enumerate() {
            *level = value(black + i as u32)? as i32;
        }

        let mut white = value(white)? as u32;

        if let Some(shift) = COLOR_DATA_PRECISION.checked_sub(self.precision)
            && shift > 0
        {
            if layout.rescale {
                levels = levels.map(|l| l >> shift);
            }

            white >>= shift;
        }

        image.metadata.black_level_separate = Some(levels);
        image.metadata.white_point = Some(white);

        Ok(())
    }
}

impl RawDecoder for Cr2Decoder<'_> {
    fn check_support(&mut self, meta: &dyn CameraMetadata) -> Result<()> {
        if self.is_subsampled() {
            bail!(UnsupportedError::Feature("subsampled CR2"));
        }

        let id = self.tree.get_id()?;
        self.ctx.check_camera_supported(meta, &id.make, &id.model, "")?;

        Ok(())
    }

    fn decode_raw(&mut self) -> Result<RawImage> {
        let sensor = self
            .tree
            .get_entry_recursive(self.tree.root(), tags::CANON_SENSOR_INFO)
            .ok_or(FormatError::MissingEntry {
                tag: tags::CANON_SENSOR_INFO,
            })?;
        let (width, height) = (sensor.get_u16(1)?, sensor.get_u16(2)?);

        let raw = self.raw_ifd()?;
        let slices = self.slices(raw)?;
        let ifd = self.tree.ifd(raw);
        let offset = ifd.get_entry(tags::STRIPOFFSETS)?.get_u32(0)?;
        let count = ifd.get_entry(tags::STRIPBYTECOUNTS)?.get_u32(0)?;

        ldebug!("cr2 image: {}x{}, data at {} ({} bytes)", width, height, offset, count);

        let mut image = RawImage::new(RawImageType::U16);
        image.set_dim(Point::new(width as i32, height as i32))?;
        image.set_cpp(1)?;
        image.create_data(self.ctx.settings().max_dimension)?;

        let input = ByteStream::new(self.buffer, Endianness::Little).get_sub_stream(offset, count)?;
        self.precision = Cr2Decompressor::new(input, slices).decode(&mut image)?;
        image.metadata.white_point = Some((1 << self.precision) - 1);

        Ok(image)
    }

    fn decode_metadata(&mut self, meta: &dyn CameraMetadata, image: &mut RawImage) -> Result<()> {
        image.metadata.cfa = ColorFilterArray::rggb();

        if let Err(e) = self.read_color_data(image) {
            image.set_error(format!("failed to read color data: {e}"));
        }

        let id = self.tree.get_id()?;
        let iso = self.iso_speed();

        self.ctx
            .set_metadata(meta, image, &id.make, &id.model, "", iso)
    }

    fn context(&self) -> &DecoderContext {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::decoder::{decode, get_decoder};
    use crate::decoder::tests::camera;
    use crate::error::DecodeError;
    use crate::testutil::{LJpegStream, TestEntry, TiffWriter};

    /// A CR2 file with a 6x3 image in two slices of 4 and 2 columns.
    fn cr2_file(color_data: Option<Vec<u16>>, raw_ifds: usize) -> Vec<u8> {
        let mut w = TiffWriter::new(false);
        w.append(b"CR\x02\0");

        let frame: Vec<u16> = (1..=18).map(|v| v * 100).collect();
        let ljpeg = LJpegStream::new(3, 3, 2, 1).encode(&frame);
        let offset = w.append(&ljpeg);

        let raw = [
            w.longs(tags::STRIPOFFSETS, &[offset]),
            w.longs(tags::STRIPBYTECOUNTS, &[ljpeg.len() as u32]),
            w.shorts(tags::CANONCR2SLICE, &[1, 4, 2]),
        ];
        let mut next = w.write_ifd(&raw, 0);

        for _ in 2..raw_ifds {
            let filler = [w.longs(tags::NEWSUBFILETYPE, &[1])];
            next = w.write_ifd(&filler, next);
        }

        let mut first: Vec<TestEntry> = vec![
            w.shorts(tags::CANON_SENSOR_INFO, &[34, 6, 3, 0, 0]),
            w.ascii(tags::MAKE, "Canon"),
            w.ascii(tags::MODEL, "EOS 5D"),
            w.shorts(tags::ISOSPEEDRATINGS, &[800]),
        ];

        if let Some(color_data) = color_data {
            first.push(w.shorts(tags::CANONCOLORDATA, &color_data));
        }

        first.sort_by_key(|e| e.tag);
        let ifd0 = w.write_ifd(&first, next);
        w.set_first_ifd(ifd0);

        let mut data = w.finish();
        data.resize(data.len().max(200), 0);

        data
    }

    #[test]
    fn sliced_image() {
        let mut color_data = vec![0_u16; 653];
        color_data[34..38].copy_from_slice(&[2000, 1024, 1024, 1500]);

        let data = cr2_file(Some(color_data), 4);
        assert!(Cr2Decoder::is_cr2(&data));

        let meta = vec![camera("Canon", "EOS 5D", "")];
        let decoded = decode(&data, &meta, &DecodeSettings::default()).unwrap();
        let view = decoded.image.as_array2d::<u16>().unwrap();

        let rows: Vec<Vec<u16>> = view.rows().map(<[u16]>::to_vec).collect();
        assert_eq!(
            rows,
            [
                vec![100, 200, 300, 400, 1300, 1400],
                vec![500, 600, 700, 800, 1500, 1600],
                vec![900, 1000, 1100, 1200, 1700, 1800],
            ]
        );

        let metadata = &decoded.metadata;
        assert_eq!(metadata.cfa, ColorFilterArray::rggb());
        assert_eq!(metadata.wb_coeffs, Some([2000.0, 1024.0, 1500.0, 0.0]));
        assert_eq!(metadata.iso_speed, 800);
        assert_eq!(metadata.make, "Canon");
        // The camera database wins over the file.
        assert_eq!(metadata.white_point, Some(4000));
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn color_data_levels() {
        let mut color_data = vec![0_u16; 800];
        color_data[0] = 6;
        color_data[63..67].copy_from_slice(&[1800, 1024, 1024, 1400]);
        color_data[715..719].copy_from_slice(&[2048, 2052, 2044, 2048]);
        color_data[720] = 15000;

        let data = cr2_file(Some(color_data), 4);
        let decoded = decode(&data, &Vec::<Camera>::new(), &DecodeSettings::default()).unwrap();
        let metadata = &decoded.metadata;

        // The samples have 12 bits, the levels 14.
        assert_eq!(metadata.black_level_separate, Some([512, 513, 511, 512]));
        assert_eq!(metadata.white_point, Some(3750));
        assert_eq!(metadata.wb_coeffs, Some([1800.0, 1024.0, 1400.0, 0.0]));
    }

    #[test]
    fn without_color_data() {
        let data = cr2_file(None, 4);
        let decoded = decode(&data, &Vec::<Camera>::new(), &DecodeSettings::default()).unwrap();

        assert_eq!(decoded.metadata.wb_coeffs, None);
        assert_eq!(decoded.metadata.white_point, Some(4095));
    }

    #[test]
    fn too_few_ifds() {
        let data = cr2_file(None, 2);

        assert!(matches!(
            Cr2Decoder::new(Buffer::new(&data).unwrap(), DecodeSettings::default()),
            Err(DecodeError::Unsupported(UnsupportedError::Feature(_)))
        ));
    }

    #[test]
    fn falls_back_to_tiff() {
        let data = cr2_file(None, 2);
        assert!(Cr2Decoder::is_cr2(&data));

        assert!(get_decoder(&data, &DecodeSettings::default()).is_ok());
    }

    #[test]
    fn subsampled_is_unsupported() {
        let mut data = cr2_file(None, 4);
        // Turn the slice entry of the raw IFD into an sRaw type.
        let mut slice_entry = tags::CANONCR2SLICE.to_le_bytes().to_vec();
        slice_entry.extend_from_slice(&[3, 0, 3, 0, 0, 0]);
        let pos = data.windows(8).position(|w| w == slice_entry).unwrap();
        data[pos..pos + 2].copy_from_slice(&tags::CANON_SRAWTYPE.to_le_bytes());
        data[pos + 4..pos + 8].copy_from_slice(&1_u32.to_le_bytes());
        data[pos + 8..pos + 12].copy_from_slice(&[4, 0, 0, 0]);

        assert!(matches!(
            decode(&data, &Vec::<Camera>::new(), &DecodeSettings::default()),
            Err(DecodeError::Unsupported(UnsupportedError::Feature(_)))
        ));
    }
}
