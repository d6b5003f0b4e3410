//! Format decoders and the decoding entry point.
//!
//! Every container format has a decoder that implements [`RawDecoder`]. [`decode`] picks the
//! decoder by the file signature, checks that the camera is supported, decodes the pixels
//! and finally applies the metadata of the camera database.

pub mod cr2;
pub mod cr3;
pub mod crw;
mod loader;
pub mod mrw;
pub mod tiff;
pub mod x3f;

use std::sync::Arc;

use crate::bmff::IsoMFile;
use crate::buffer::Buffer;
use crate::camera::{CameraMetadata, Hints, SupportStatus};
use crate::ciff::CiffTree;
use crate::error::{
    DecodeError, DecodingError, FormatError, Result, UnsupportedError, bail, err,
};
use crate::image::{ImageMetadata, RawImage, Rect};
use crate::log::{ldebug, lwarn};
use crate::mrw::MrwFile;
use crate::tiff::TiffTree;
use crate::util::trim_string;
use crate::x3f::X3fFile;

pub use cr2::Cr2Decoder;
pub use cr3::Cr3Decoder;
pub use crw::CrwDecoder;
pub use loader::{FileError, FileLoader};
pub use mrw::MrwDecoder;
pub use tiff::TiffDecoder;
pub use x3f::X3fDecoder;

/// Files up to this size cannot hold a raw image.
const MIN_FILE_SIZE: usize = 104;

/// Settings that control decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeSettings {
    /// The number of worker threads. `0` uses all available cores.
    pub threads: usize,
    /// Whether to crop the image to the area recommended by the file or camera database.
    pub apply_crop: bool,
    /// Whether to fail for cameras that are missing from the camera database.
    pub fail_on_unknown: bool,
    /// The largest accepted width or height.
    pub max_dimension: u32,
    /// Whether errors recorded on the image during decoding should fail the decode.
    pub strict: bool,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            threads: 0,
            apply_crop: true,
            fail_on_unknown: false,
            max_dimension: 65535,
            strict: false,
        }
    }
}

/// A decoder for one container format.
pub trait RawDecoder {
    /// Check that the file holds a raw image this decoder can handle.
    fn check_support(&mut self, meta: &dyn CameraMetadata) -> Result<()>;

    /// Decode the pixel data.
    fn decode_raw(&mut self) -> Result<RawImage>;

    /// Read the metadata of the file and apply the camera database to `image`.
    fn decode_metadata(&mut self, meta: &dyn CameraMetadata, image: &mut RawImage) -> Result<()>;

    /// The state shared by all decoders.
    fn context(&self) -> &DecoderContext;
}

/// The state every decoder carries: the settings and the hints of the camera.
#[derive(Debug, Clone)]
pub struct DecoderContext {
    settings: DecodeSettings,
    decoder_version: u32,
    hints: Hints,
}

impl DecoderContext {
    /// Create a context for a decoder of the given version.
    pub fn new(settings: DecodeSettings, decoder_version: u32) -> Self {
        Self {
            settings,
            decoder_version,
            hints: Hints::new(),
        }
    }

    /// The decode settings.
    pub fn settings(&self) -> &DecodeSettings {
        &self.settings
    }

    /// The hints of the camera, available after a successful support check.
    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    /// Check the camera against the database.
    ///
    /// Returns whether the camera is known. Unknown cameras only fail if
    /// [`DecodeSettings::fail_on_unknown`] is set.
    pub fn check_camera_supported(
        &mut self,
        meta: &dyn CameraMetadata,
        make: &str,
        model: &str,
        mode: &str,
    ) -> Result<bool> {
        self.check_camera(meta, make, model, mode, self.settings.fail_on_unknown)
    }

    /// Like [`DecoderContext::check_camera_supported`], but never fails for unknown cameras.
    pub fn check_camera_known(
        &mut self,
        meta: &dyn CameraMetadata,
        make: &str,
        model: &str,
        mode: &str,
    ) -> Result<bool> {
        self.check_camera(meta, make, model, mode, false)
    }

    fn check_camera(
        &mut self,
        meta: &dyn CameraMetadata,
        make: &str,
        model: &str,
        mode: &str,
        fail_on_unknown: bool,
    ) -> Result<bool> {
        let make = trim_string(make);
        let model = trim_string(model);

        if make.is_empty() || model.is_empty() {
            bail!(FormatError::Corrupt("camera make or model is empty"));
        }

        let Some(camera) = meta.get_camera(&make, &model, mode) else {
            return handle_unknown(&make, &model, mode, fail_on_unknown);
        };

        match camera.support {
            SupportStatus::Supported => {}
            SupportStatus::NoSamples => {
                lwarn!(
                    "camera '{}' '{}', mode '{}' has no test samples, please consider submitting some",
                    make,
                    model,
                    mode
                );
            }
            SupportStatus::Unsupported => bail!(UnsupportedError::Camera),
            SupportStatus::Unknown => return handle_unknown(&make, &model, mode, fail_on_unknown),
        }

        if camera.decoder_version > self.decoder_version {
            bail!(UnsupportedError::DecoderVersion {
                required: camera.decoder_version,
            });
        }

        self.hints = camera.hints.clone();

        Ok(true)
    }

    /// Apply the camera database entry of `make`, `model` and `mode` to `image`.
    ///
    /// Sets the ISO speed, the CFA, the crop, black areas, black and white levels and the
    /// `final_cfa_black` override. Images of unknown cameras only get the ISO speed.
    pub fn set_metadata(
        &self,
        meta: &dyn CameraMetadata,
        image: &mut RawImage,
        make: &str,
        model: &str,
        mode: &str,
        iso_speed: u32,
    ) -> Result<()> {
        image.metadata.iso_speed = iso_speed;

        let make = trim_string(make);
        let model = trim_string(model);

        let Some(camera) = meta.get_camera(&make, &model, mode) else {
            handle_unknown(&make, &model, mode, self.settings.fail_on_unknown)?;

            return Ok(());
        };

        if !camera.cfa.is_empty() {
            image.metadata.cfa = camera.cfa.clone();
        }

        image.metadata.make = make;
        image.metadata.model = model;
        image.metadata.mode = mode.to_string();

        if self.settings.apply_crop {
            let dim = image.dim();
            let pos = camera.crop_pos;
            let mut size = camera.crop_size;

            // Relative to the right and bottom edge.
            if size.x <= 0 {
                size.x += dim.x - pos.x;
            }

            if size.y <= 0 {
                size.y += dim.y - pos.y;
            }

            image.sub_frame(Rect::new(pos.x, pos.y, size.x, size.y));
        }

        image.metadata.black_areas = camera.black_areas.clone();

        if let Some(sensor) = camera.sensor_info(iso_speed) {
            image.metadata.black_level = Some(sensor.black_level);
            image.metadata.white_point = u32::try_from(sensor.white_level).ok();

            let separate = &sensor.black_level_separate;
            let (cfa_width, cfa_height) = image.metadata.cfa.size();
            let needed = if image.metadata.cfa.is_empty() {
                image.cpp() as usize
            } else {
                (cfa_width * cfa_height) as usize
            };

            if image.metadata.black_areas.is_empty()
                && !separate.is_empty()
                && needed <= separate.len().min(4)
            {
                let mut levels = [0; 4];
                levels[..needed].copy_from_slice(&separate[..needed]);
                image.metadata.black_level_separate = Some(levels);
            }
        }

        if let Some(value) = camera.hints.get("final_cfa_black") {
            match parse_cfa_black(value) {
                Some(levels) => image.metadata.black_level_separate = Some(levels),
                None => image.set_error(
                    "Expected 4 values '10,20,30,20' as values for final_cfa_black hint.",
                ),
            }
        }

        Ok(())
    }
}

fn handle_unknown(make: &str, model: &str, mode: &str, fail_on_unknown: bool) -> Result<bool> {
    lwarn!(
        "unable to find camera in database: '{}' '{}' '{}', please consider submitting samples",
        make,
        model,
        mode
    );

    if fail_on_unknown {
        bail!(UnsupportedError::UnknownCamera {
            make: make.to_string(),
            model: model.to_string(),
            mode: mode.to_string(),
        });
    }

    Ok(false)
}

fn parse_cfa_black(value: &str) -> Option<[i32; 4]> {
    let values = value
        .split(',')
        .map(|v| v.trim().parse().ok())
        .collect::<Option<Vec<i32>>>()?;

    values.try_into().ok()
}

/// A decoded raw image with its metadata.
#[derive(Debug, Clone)]
pub struct DecodedRaw {
    /// The image.
    pub image: Arc<RawImage>,
    /// The metadata of the image.
    pub metadata: ImageMetadata,
    /// Non-fatal errors that occurred while decoding.
    pub warnings: Vec<String>,
}

type Constructor<'a> = fn(Buffer<'a>, DecodeSettings) -> Result<Box<dyn RawDecoder + 'a>>;

fn boxed<'a, D: RawDecoder + 'a>(decoder: Result<D>) -> Result<Box<dyn RawDecoder + 'a>> {
    Ok(Box::new(decoder?))
}

/// Pick the decoder for a file by its signature.
///
/// Decoders whose signature matches are tried in order. The first one that can parse the file
/// wins. If all of them fail, the error of the last one is returned.
pub fn get_decoder<'a>(data: &'a [u8], settings: &DecodeSettings) -> Result<Box<dyn RawDecoder + 'a>> {
    if data.len() <= MIN_FILE_SIZE {
        bail!(FormatError::Corrupt("file is too small"));
    }

    let buffer = Buffer::new(data)?;
    let settings = *settings;

    let candidates: [(&str, bool, Constructor<'a>); 6] = [
        ("cr2", Cr2Decoder::is_cr2(data), |b, s| boxed(Cr2Decoder::new(b, s))),
        ("tiff", TiffTree::is_tiff(data), |b, s| boxed(TiffDecoder::new(b, s))),
        ("crw", CiffTree::is_ciff(data), |b, s| boxed(CrwDecoder::new(b, s))),
        ("cr3", IsoMFile::is_isom(data), |b, s| boxed(Cr3Decoder::new(b, s))),
        ("mrw", MrwFile::is_mrw(data), |b, s| boxed(MrwDecoder::new(b, s))),
        ("x3f", X3fFile::is_x3f(data), |b, s| boxed(X3fDecoder::new(b, s))),
    ];

    let mut last_error = None;

    for (name, _, construct) in candidates.into_iter().filter(|(_, matches, _)| *matches) {
        match construct(buffer, settings) {
            Ok(decoder) => return Ok(decoder),
            Err(e) => {
                ldebug!("{} decoder rejected the file: {}", name, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => err!(UnsupportedError::UnknownFormat),
    }
}

/// Decode a raw file.
///
/// `meta` is the camera database. Low-level buffer errors are reported as
/// [`DecodingError::Truncated`].
pub fn decode(
    data: &[u8],
    meta: &dyn CameraMetadata,
    settings: &DecodeSettings,
) -> Result<DecodedRaw> {
    decode_inner(data, meta, settings).map_err(DecodeError::normalize)
}

fn decode_inner(
    data: &[u8],
    meta: &dyn CameraMetadata,
    settings: &DecodeSettings,
) -> Result<DecodedRaw> {
    let mut decoder = get_decoder(data, settings)?;

    decoder.check_support(meta)?;

    let mut image = decoder.decode_raw()?;
    image.metadata.pixel_aspect_ratio = decoder
        .context()
        .hints()
        .get_or("pixel_aspect_ratio", 1.0);

    decoder.decode_metadata(meta, &mut image)?;

    let warnings = image.errors();
    ldebug!("decoded {:?} image with {} warnings", image.dim(), warnings.len());

    if settings.strict && !warnings.is_empty() {
        bail!(DecodingError::Corrupt("image has errors and strict decoding is enabled"));
    }

    let metadata = image.metadata.clone();

    Ok(DecodedRaw {
        image: Arc::new(image),
        metadata,
        warnings,
    })
}
