//! Minolta MRW files.

use crate::buffer::Buffer;
use crate::camera::CameraMetadata;
use crate::decoder::{DecodeSettings, DecoderContext, RawDecoder};
use crate::decompress::{Packed12, UncompressedDecompressor};
use crate::error::{FormatError, Result};
use crate::image::{Point, RawImage, RawImageType};
use crate::mrw::MrwFile;
use crate::tiff::TiffId;

const DECODER_VERSION: u32 = 0;

/// A decoder for Minolta MRW files.
pub struct MrwDecoder<'a> {
    file: MrwFile<'a>,
    ctx: DecoderContext,
}

impl<'a> MrwDecoder<'a> {
    /// Parse the header blocks of the file.
    pub fn new(buffer: Buffer<'a>, settings: DecodeSettings) -> Result<Self> {
        Ok(Self {
            file: MrwFile::parse(buffer)?,
            ctx: DecoderContext::new(settings, DECODER_VERSION),
        })
    }

    fn id(&self) -> Result<TiffId> {
        self.file
            .tiff
            .as_ref()
            .ok_or(FormatError::Corrupt("MRW file has no make and model"))?
            .get_id()
    }
}

impl RawDecoder for MrwDecoder<'_> {
    fn check_support(&mut self, meta: &dyn CameraMetadata) -> Result<()> {
        let id = self.id()?;
        self.ctx.check_camera_supported(meta, &id.make, &id.model, "")?;

        Ok(())
    }

    fn decode_raw(&mut self) -> Result<RawImage> {
        let (width, height) = (self.file.width, self.file.height);

        let mut image = RawImage::new(RawImageType::U16);
        image.set_dim(Point::new(width as i32, height as i32))?;
        image.set_cpp(1)?;
        image.create_data(self.ctx.settings().max_dimension)?;

        let mut decompressor = UncompressedDecompressor::new(self.file.image_data);

        if self.file.packed {
            decompressor.decode_12bit_raw(&mut image, width, height, Packed12::Big)?;
        } else {
            decompressor.decode_raw_unpacked::<12, true>(&mut image, width, height)?;
        }

        Ok(image)
    }

    fn decode_metadata(&mut self, meta: &dyn CameraMetadata, image: &mut RawImage) -> Result<()> {
        let id = self.id()?;
        self.ctx.set_metadata(meta, image, &id.make, &id.model, "", 0)?;

        if let Some(c) = self.file.wb_coeffs.map(|c| c.map(f32::from)) {
            image.metadata.wb_coeffs = Some(if self.ctx.hints().contains("swapped_wb") {
                [c[2], c[0], c[1], 0.0]
            } else {
                [c[0], c[1], c[3], 0.0]
            });
        }

        Ok(())
    }

    fn context(&self) -> &DecoderContext {
        &self.ctx
    }
}
