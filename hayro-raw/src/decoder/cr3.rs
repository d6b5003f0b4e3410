//! Canon CR3 files.

use crate::bmff::{BoxType, CanonBox, CanonTimedMetadata, CrawBox, IsoMFile, TrackBox};
use crate::buffer::Buffer;
use crate::camera::CameraMetadata;
use crate::decoder::{DecodeSettings, DecoderContext, RawDecoder};
use crate::decompress::CrxDecompressor;
use crate::error::{FormatError, Result, UnsupportedError, bail};
use crate::image::{BlackArea, Point, RawImage, RawImageType};
use crate::log::{ldebug, lwarn};
use crate::tiff::{TiffTree, tags};

const DECODER_VERSION: u32 = 0;

const RAW_TRACK: usize = 2;
const METADATA_TRACK: usize = 3;

/// The timed metadata record with the color data.
const COLOR_RECORD: u16 = 8;

const DEFAULT_WB_OFFSET: u32 = 126;

const SUPPORTED_VERSIONS: &[&str] = &[
    "CanonCR3_001/00.09.00/00.00.00",
    "CanonCR3_001/00.10.00/00.00.00",
    "CanonCR3_001/01.09.00/00.00.00",
    "CanonCR3_002/00.10.00/00.00.00",
    "CanonCR3_003/00.10.00/00.00.00",
];

/// Versions that are known to use other codecs.
const UNSUPPORTED_VERSIONS: &[(&str, &str)] = &[
    ("CanonHEIF001/10.00.00/00.00.00", "HEIF"),
    ("CanonHEIF001/10.00.01/00.00.00", "HEIF"),
    ("CanonCR3_001/01.09.00/01.00.00", "raw burst roll"),
    ("CanonCRM0001/02.09.00/00.00.00", "CRM movie"),
];

/// A decoder for Canon CR3 files.
pub struct Cr3Decoder<'a> {
    file: IsoMFile<'a>,
    ctx: DecoderContext,
}

impl<'a> Cr3Decoder<'a> {
    /// Parse the box structure of the file.
    pub fn new(buffer: Buffer<'a>, settings: DecodeSettings) -> Result<Self> {
        Ok(Self {
            file: IsoMFile::parse(buffer)?,
            ctx: DecoderContext::new(settings, DECODER_VERSION),
        })
    }

    fn canon(&self) -> Result<&CanonBox<'a>> {
        self.file
            .moov
            .canon
            .as_ref()
            .ok_or(FormatError::MissingBox(BoxType::Uuid.fourcc()).into())
    }

    fn track(&self, index: usize) -> Result<&TrackBox<'a>> {
        self.file
            .moov
            .tracks
            .get(index)
            .ok_or(FormatError::Corrupt("CR3 file has too few tracks").into())
    }

    fn craw(&self) -> Result<CrawBox> {
        let entry = self
            .track(RAW_TRACK)?
            .sample_entries
            .first()
            .ok_or(FormatError::Corrupt("raw track has no sample entry"))?;

        CrawBox::parse(entry)
    }

    fn iso_speed(&self) -> u32 {
        let Ok(exif) = self.canon().and_then(|c| c.cmt(2)) else {
            return 0;
        };
        let value = |tag| {
            exif.get_entry_recursive(exif.root(), tag)
                .and_then(|e| e.get_u32(0).ok())
        };

        // 65535 means the value did not fit.
        match value(tags::ISOSPEEDRATINGS) {
            Some(65535) => value(tags::RECOMMENDEDEXPOSUREINDEX).unwrap_or(65535),
            iso => iso.unwrap_or(0),
        }
    }

    /// Read the as-shot white balance from the color data of the timed metadata.
    fn wb_coeffs(&self) -> Result<[f32; 4]> {
        let chunk = self
            .track(METADATA_TRACK)?
            .chunks
            .first()
            .ok_or(FormatError::Corrupt("metadata track has no chunk"))?;
        let ctmd = CanonTimedMetadata::parse(*chunk)?;
        let ifd: TiffTree<'_> = ctmd.record_ifd(COLOR_RECORD)?;

        let color_data = ifd
            .get_entry_recursive(ifd.root(), tags::CANONCOLORDATA)
            .ok_or(FormatError::MissingEntry {
                tag: tags::CANONCOLORDATA,
            })?;

        let hints = self.ctx.hints();
        let offset = hints.get_or("wb_offset", DEFAULT_WB_OFFSET);
        let mut c = [0.0; 4];

        for (i, coeff) in c.iter_mut().enumerate() {
            *coeff = color_data.get_u16(offset + i as u32)? as f32 / 1024.0;
        }

        Ok(if hints.contains("swapped_wb") {
            [c[2], c[0], c[1], 0.0]
        } else {
            [c[0], c[1], c[3], 0.0]
        })
    }
}

impl RawDecoder for Cr3Decoder<'_> {
    fn check_support(&mut self, meta: &dyn CameraMetadata) -> Result<()> {
        let version = self.canon()?.compressor_version.as_str();

        if let Some((_, kind)) = UNSUPPORTED_VERSIONS.iter().find(|(v, _)| *v == version) {
            lwarn!("unsupported CR3 variant: {}", kind);
            bail!(UnsupportedError::CodecVersion);
        }

        if !SUPPORTED_VERSIONS.contains(&version) {
            lwarn!("unknown CR3 compressor version: {}", version);
            bail!(UnsupportedError::CodecVersion);
        }

        let id = self.canon()?.cmt(1)?.get_id()?;
        self.craw()?;
        self.ctx.check_camera_supported(meta, &id.make, &id.model, "")?;

        Ok(())
    }

    fn decode_raw(&mut self) -> Result<RawImage> {
        let craw = self.craw()?;
        let cmp1 = &craw.cmp1;

        ldebug!(
            "CRX image: {}x{}, {} planes, {} bits",
            cmp1.f_width,
            cmp1.f_height,
            cmp1.n_planes,
            cmp1.n_bits
        );

        let chunk = *self
            .track(RAW_TRACK)?
            .chunks
            .first()
            .ok_or(FormatError::Corrupt("raw track has no chunk"))?;

        let decompressor = CrxDecompressor::new(cmp1, chunk)?;

        let mut image = RawImage::new(RawImageType::U16);
        image.set_dim(Point::new(cmp1.f_width as i32, cmp1.f_height as i32))?;
        image.set_cpp(1)?;
        image.create_data(self.ctx.settings().max_dimension)?;

        decompressor.decode(&mut image, self.ctx.settings().threads)?;

        Ok(image)
    }

    fn decode_metadata(&mut self, meta: &dyn CameraMetadata, image: &mut RawImage) -> Result<()> {
        let id = self.canon()?.cmt(1)?.get_id()?;

        match self.wb_coeffs() {
            Ok(wb) => image.metadata.wb_coeffs = Some(wb),
            Err(e) => image.set_error(format!("failed to read white balance: {e}")),
        }

        let iso = self.iso_speed();
        self.ctx
            .set_metadata(meta, image, &id.make, &id.model, "", iso)?;

        let iad1 = self.craw()?.iad1;

        if image.metadata.black_areas.is_empty() {
            let mut left = iad1.left_optical_black_rect();
            let mut top = iad1.top_optical_black_rect();

            // The first 12 pixels of both areas are not reliable.
            if left.dim.x >= 16 {
                left.pos.x += 12;
                left.dim.x -= 12;
            }

            if top.dim.y >= 16 {
                top.pos.y += 12;
                top.dim.y -= 12;
            }

            image.metadata.black_areas.push(BlackArea {
                offset: left.pos.x as u32,
                size: left.dim.x as u32,
                is_vertical: true,
            });
            image.metadata.black_areas.push(BlackArea {
                offset: top.pos.y as u32,
                size: top.dim.y as u32,
                is_vertical: false,
            });
        }

        if self.ctx.settings().apply_crop {
            image.sub_frame(iad1.crop_rect());
        }

        Ok(())
    }

    fn context(&self) -> &DecoderContext {
        &self.ctx
    }
}
