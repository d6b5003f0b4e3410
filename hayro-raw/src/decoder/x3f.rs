//! Sigma X3F files.
//!
//! X3F images come from Foveon sensors and carry all three color channels for every pixel,
//! so the decoded image has three components per pixel and no CFA.

use crate::buffer::{Buffer, Endianness};
use crate::camera::CameraMetadata;
use crate::decoder::{DecodeSettings, DecoderContext, RawDecoder};
use crate::decompress::SigmaDecompressor;
use crate::error::{FormatError, Result, UnsupportedError, bail};
use crate::image::{Point, RawImage, RawImageType};
use crate::log::ldebug;
use crate::tiff::{TiffId, TiffTree};
use crate::x3f::{FORMAT_JPEG, IMAGE_TYPE_PREVIEW, X3fFile};

const DECODER_VERSION: u32 = 1;

/// `Exif` at offset 6 of a JPEG preview, read as a little endian integer.
const EXIF_MARKER: u32 = 0x6669_7845;
const EXIF_TIFF_OFFSET: u32 = 12;

/// Previews that are too small to hold an Exif block.
const MIN_PREVIEW_SIZE: u32 = 100;

/// A decoder for Sigma X3F files.
pub struct X3fDecoder<'a> {
    file: X3fFile<'a>,
    ctx: DecoderContext,
}

impl<'a> X3fDecoder<'a> {
    /// Parse the directory and the sections of the file.
    pub fn new(buffer: Buffer<'a>, settings: DecodeSettings) -> Result<Self> {
        Ok(Self {
            file: X3fFile::parse(buffer)?,
            ctx: DecoderContext::new(settings, DECODER_VERSION),
        })
    }

    /// The parsed file.
    pub fn file(&self) -> &X3fFile<'a> {
        &self.file
    }

    /// The camera make and model, from the properties or the Exif block of a JPEG preview.
    fn camera_id(&self) -> Option<TiffId> {
        if let (Some(make), Some(model)) = (
            self.file.property("CAMMANUF"),
            self.file.property("CAMMODEL"),
        ) {
            return Some(TiffId {
                make: make.to_string(),
                model: model.to_string(),
            });
        }

        self.file
            .images
            .iter()
            .filter(|i| {
                i.ty == IMAGE_TYPE_PREVIEW
                    && i.format == FORMAT_JPEG
                    && i.data.size() > MIN_PREVIEW_SIZE
            })
            .find_map(|i| {
                let buffer = i.data.buffer();

                if buffer.read_u32(6, Endianness::Little).ok()? != EXIF_MARKER {
                    return None;
                }

                let tree = TiffTree::parse(buffer.get_sub_view_from(EXIF_TIFF_OFFSET).ok()?).ok()?;

                tree.get_id().ok()
            })
    }
}

impl RawDecoder for X3fDecoder<'_> {
    fn check_support(&mut self, meta: &dyn CameraMetadata) -> Result<()> {
        if let Some(id) = self.camera_id() {
            if !self.ctx.check_camera_supported(meta, &id.make, &id.model, "")? {
                bail!(UnsupportedError::UnknownCamera {
                    make: id.make,
                    model: id.model,
                    mode: String::new(),
                });
            }

            return Ok(());
        }

        // Without a name, only accept raw sections in a known compressed format.
        if self
            .file
            .images
            .iter()
            .any(|i| i.is_raw() && matches!(i.format, 30 | 35))
        {
            ldebug!("x3f file without camera name, decoding anyway");

            return Ok(());
        }

        bail!(FormatError::Corrupt("unable to determine camera name"))
    }

    fn decode_raw(&mut self) -> Result<RawImage> {
        let raw = self
            .file
            .raw_image()
            .ok_or(FormatError::Corrupt("no raw image section"))?;

        let mut image = RawImage::new(RawImageType::U16);
        image.set_dim(Point::new(raw.width as i32, raw.height as i32))?;
        image.set_cpp(3)?;
        image.create_data(self.ctx.settings().max_dimension)?;

        SigmaDecompressor::new(raw.data, raw.format)
            .decode(&mut image, self.ctx.settings().threads)?;

        Ok(image)
    }

    fn decode_metadata(&mut self, meta: &dyn CameraMetadata, image: &mut RawImage) -> Result<()> {
        let iso = self
            .file
            .property("ISO")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        match self.camera_id() {
            Some(id) => self.ctx.set_metadata(meta, image, &id.make, &id.model, "", iso)?,
            None => image.metadata.iso_speed = iso,
        }

        Ok(())
    }

    fn context(&self) -> &DecoderContext {
        &self.ctx
    }
}
