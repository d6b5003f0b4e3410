//! Canon CRW files.

use crate::buffer::{Buffer, Endianness};
use crate::camera::CameraMetadata;
use crate::ciff::{CiffDataType, CiffEntry, CiffTree, tags};
use crate::cursor::ByteStream;
use crate::decoder::{DecodeSettings, DecoderContext, RawDecoder};
use crate::decompress::CrwDecompressor;
use crate::error::{FormatError, Result, UnsupportedError, bail};
use crate::image::{ColorFilterArray, Point, RawImage, RawImageType};
use crate::log::ldebug;

const DECODER_VERSION: u32 = 0;

/// The raw data starts right after the file header.
const RAW_DATA_OFFSET: u32 = 26;

const DEFAULT_WB_OFFSET: u32 = 120;

/// The XOR key of white balance values in some files.
const WB_KEY: [u16; 2] = [0x410, 0x45f3];

/// A decoder for Canon CRW files.
pub struct CrwDecoder<'a> {
    buffer: Buffer<'a>,
    tree: CiffTree<'a>,
    ctx: DecoderContext,
}

impl<'a> CrwDecoder<'a> {
    /// Parse the heap structure of the file.
    pub fn new(buffer: Buffer<'a>, settings: DecodeSettings) -> Result<Self> {
        Ok(Self {
            buffer,
            tree: CiffTree::parse(buffer)?,
            ctx: DecoderContext::new(settings, DECODER_VERSION),
        })
    }

    fn entry(&self, tag: u16) -> Option<&CiffEntry<'a>> {
        self.tree.get_entry_recursive(self.tree.root(), tag)
    }

    fn make_model(&self) -> Result<(String, String)> {
        let mut strings = self
            .entry(tags::MAKEMODEL)
            .ok_or(FormatError::MissingEntry {
                tag: tags::MAKEMODEL,
            })?
            .get_strings()?
            .into_iter();

        match (strings.next(), strings.next()) {
            (Some(make), Some(model)) => Ok((make, model)),
            _ => bail!(FormatError::Corrupt("CRW file has no make and model")),
        }
    }

    fn iso_speed(&self) -> u32 {
        self.entry(tags::SHOTINFO)
            .filter(|e| e.ty() == CiffDataType::Short && e.count() >= 2)
            .and_then(|e| e.get_u16(2).ok())
            .map_or(0, |ev| (2_f32.powf(canon_ev(ev as i32)) * 100.0 / 32.0) as u32)
    }

    /// Read the as-shot white balance from the first color info entry that has one.
    fn wb_coeffs(&self) -> Result<Option<[f32; 4]>> {
        if let Some(wb) = self.entry(tags::COLORINFO1) {
            if wb.count() == 768 {
                let inv = |i| -> Result<f32> { Ok(1024.0 / wb.get_u16(i)? as f32) };

                return Ok(Some([inv(72)?, (inv(73)? + inv(74)?) / 2.0, inv(75)?, 0.0]));
            }

            if wb.ty() == CiffDataType::Byte && wb.count() > 768 {
                let hints = self.ctx.hints();
                let offset = hints.get_or("wb_offset", DEFAULT_WB_OFFSET) / 2;
                let key = if hints.contains("wb_mangle") { WB_KEY } else { [0; 2] };

                return Ok(Some([
                    (wb.get_u16(offset + 1)? ^ key[1]) as f32,
                    (wb.get_u16(offset)? ^ key[0]) as f32,
                    (wb.get_u16(offset + 2)? ^ key[0]) as f32,
                    0.0,
                ]));
            }

            return Ok(None);
        }

        if let Some(wb) = self.entry(tags::COLORINFO2) {
            if wb.ty() != CiffDataType::Short {
                return Ok(None);
            }

            let v = |i| -> Result<f32> { Ok(wb.get_u16(i)? as f32) };

            return Ok(Some(if v(0)? > 512.0 {
                [v(62)?, v(63)?, v(60)?, v(61)?]
            } else {
                [v(51)?, (v(50)? + v(53)?) / 2.0, v(52)?, 0.0]
            }));
        }

        if let Some(shot_info) = self.entry(tags::SHOTINFO)
            && let Some(wb) = self.entry(tags::WHITEBALANCE)
        {
            let index = shot_info.get_u16(7)? as usize;
            // The position of each white balance preset in the table.
            let preset = b"0134567028"
                .get(index)
                .ok_or(FormatError::Corrupt("unknown white balance preset"))?;
            let offset = 1 + (preset - b'0') as u32 * 4;
            let v = |i| -> Result<f32> { Ok(wb.get_u16(i)? as f32) };

            return Ok(Some([v(offset)?, v(offset + 1)?, v(offset + 3)?, 0.0]));
        }

        Ok(None)
    }
}

/// Convert a Canon exposure value to stops.
fn canon_ev(value: i32) -> f32 {
    let sign = if value < 0 { -1.0 } else { 1.0 };
    let mut value = value.abs();
    let frac = value & 0x1f;
    value -= frac;

    // Thirds of a stop are stored as 0x0c and 0x14.
    let frac = match frac {
        0x0c => 32.0 / 3.0,
        0x14 => 64.0 / 3.0,
        f => f as f32,
    };

    sign * (value as f32 + frac) / 32.0
}

impl RawDecoder for CrwDecoder<'_> {
    fn check_support(&mut self, meta: &dyn CameraMetadata) -> Result<()> {
        let (make, model) = self.make_model()?;
        self.ctx.check_camera_supported(meta, &make, &model, "")?;

        Ok(())
    }

    fn decode_raw(&mut self) -> Result<RawImage> {
        let sensor = self
            .entry(tags::SENSORINFO)
            .ok_or(FormatError::MissingEntry {
                tag: tags::SENSORINFO,
            })?;

        if sensor.ty() != CiffDataType::Short || sensor.count() < 6 {
            bail!(sensor.wrong_type());
        }

        let width = sensor.get_u16(1)?;
        let height = sensor.get_u16(2)?;

        let table = match self.entry(tags::DECODERTABLE) {
            Some(e) if e.ty() == CiffDataType::Long => e.get_u32(0)?,
            Some(e) => bail!(e.wrong_type()),
            None => bail!(FormatError::MissingEntry {
                tag: tags::DECODERTABLE,
            }),
        };

        if table > 2 {
            bail!(UnsupportedError::Feature("CRW decoder table"));
        }

        let low_bits = !self.ctx.hints().contains("no_decompressed_lowbits");
        ldebug!("CRW image {}x{}, decoder table {}", width, height, table);

        let mut image = RawImage::new(RawImageType::U16);
        image.set_dim(Point::new(width as i32, height as i32))?;
        image.set_cpp(1)?;
        image.metadata.cfa = ColorFilterArray::rggb();
        image.create_data(self.ctx.settings().max_dimension)?;

        let input =
            ByteStream::new(self.buffer, Endianness::Little).get_sub_stream_from(RAW_DATA_OFFSET)?;
        CrwDecompressor::new(&image, table, low_bits, input)?.decode(&mut image)?;

        Ok(image)
    }

    fn decode_metadata(&mut self, meta: &dyn CameraMetadata, image: &mut RawImage) -> Result<()> {
        let (make, model) = self.make_model()?;

        match self.wb_coeffs() {
            Ok(wb) => image.metadata.wb_coeffs = wb,
            Err(e) => image.set_error(format!("failed to read white balance: {e}")),
        }

        self.ctx
            .set_metadata(meta, image, &make, &model, "", self.iso_speed())
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
    use crate::decompress::crw::GAP;
    use crate::decompress::crw::tests::{encode, pixels};
    use crate::error::{DecodeError, DecodingError};
    use crate::testutil::{HeapEntry, ciff_file, ciff_heap};

    fn shorts(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// A 24x8 CRW file and the high bits of its pixels.
    fn crw_file_with_low_bits(low_bits: Option<u8>, extra: Vec<HeapEntry>) -> (Vec<u8>, Vec<i32>) {
        let expected = pixels(24, 8);
        let mut raw = match low_bits {
            Some(packed) => vec![packed; 24 * 8 / 4],
            None => Vec::new(),
        };
        raw.extend([0; GAP as usize]);
        raw.extend(encode(&expected, 24, 1));

        let mut entries = vec![
            // The raw data must come first so that it starts right after the header.
            HeapEntry::Value(tags::RAWDATA, raw),
            HeapEntry::Value(tags::MAKEMODEL, b"Canon\0Canon EOS D30\0".to_vec()),
            HeapEntry::Value(tags::SENSORINFO, shorts(&[0, 24, 8, 0, 0, 0])),
            HeapEntry::Inline(tags::DECODERTABLE, [1, 0, 0, 0, 0, 0, 0, 0]),
        ];
        entries.extend(extra);

        (ciff_file(&ciff_heap(&entries)), expected)
    }

    fn crw_file(extra: Vec<HeapEntry>) -> (Vec<u8>, Vec<i32>) {
        crw_file_with_low_bits(None, extra)
    }

    fn low_bits_disabled() -> Vec<Camera> {
        let mut cam = camera("Canon", "Canon EOS D30", "");
        cam.hints.insert("no_decompressed_lowbits", "");

        vec![cam]
    }

    #[test]
    fn decode_file() {
        let mut color = vec![0; 54];
        color[50..54].copy_from_slice(&[500, 1000, 700, 520]);
        let (data, expected) = crw_file(vec![
            HeapEntry::Value(tags::COLORINFO2, shorts(&color)),
            HeapEntry::Value(tags::SHOTINFO, shorts(&[0, 0, 0xa0])),
        ]);

        let decoded = decode(&data, &low_bits_disabled(), &DecodeSettings::default()).unwrap();
        let view = decoded.image.as_array2d::<u16>().unwrap();
        let pixels: Vec<i32> = view.rows().flatten().map(|p| *p as i32).collect();

        assert_eq!(pixels, expected);
        assert_eq!(decoded.metadata.cfa, ColorFilterArray::rggb());
        assert_eq!(decoded.metadata.iso_speed, 100);
        assert_eq!(decoded.metadata.wb_coeffs, Some([1000.0, 510.0, 700.0, 0.0]));
        assert_eq!(decoded.metadata.make, "Canon");
        assert_eq!(decoded.metadata.white_point, Some(4000));
    }

    #[test]
    fn low_bits_are_merged_by_default() {
        // Every pixel gets the low bits 0b10.
        let (data, expected) = crw_file_with_low_bits(Some(0b1010_1010), Vec::new());
        let meta: Vec<Camera> = Vec::new();

        let decoded = decode(&data, &meta, &DecodeSettings::default()).unwrap();
        let view = decoded.image.as_array2d::<u16>().unwrap();
        let pixels: Vec<i32> = view.rows().flatten().map(|p| *p as i32).collect();
        let expected: Vec<i32> = expected.iter().map(|p| (p << 2) | 2).collect();

        assert_eq!(pixels, expected);
    }

    #[test]
    fn white_balance_presets() {
        let mut table = vec![0; 40];
        // Preset 2 is stored at position 3.
        table[13..17].copy_from_slice(&[300, 200, 0, 400]);
        let (data, _) = crw_file(vec![
            HeapEntry::Value(tags::SHOTINFO, shorts(&[0, 0, 0, 0, 0, 0, 0, 2])),
            HeapEntry::Value(tags::WHITEBALANCE, shorts(&table)),
        ]);

        let decoded = decode(&data, &low_bits_disabled(), &DecodeSettings::default()).unwrap();
        assert_eq!(decoded.metadata.wb_coeffs, Some([300.0, 200.0, 400.0, 0.0]));
        assert!(decoded.warnings.is_empty());

        let (data, _) = crw_file(vec![
            HeapEntry::Value(tags::SHOTINFO, shorts(&[0, 0, 0, 0, 0, 0, 0, 12])),
            HeapEntry::Value(tags::WHITEBALANCE, shorts(&table)),
        ]);
        let decoded = decode(&data, &low_bits_disabled(), &DecodeSettings::default()).unwrap();
        assert_eq!(decoded.metadata.wb_coeffs, None);
        assert_eq!(decoded.warnings.len(), 1);
    }

    #[test]
    fn exposure_values() {
        assert_eq!(canon_ev(0x60), 3.0);
        assert_eq!(canon_ev(0x6c), 3.0 + 1.0 / 3.0);
        assert_eq!(canon_ev(0x74), 3.0 + 2.0 / 3.0);
        assert_eq!(canon_ev(-0x48), -2.25);
    }

    #[test]
    fn invalid_sensor_info() {
        let (mut data, _) = crw_file(Vec::new());
        let info = shorts(&[0, 24, 8, 0, 0, 0]);
        let pos = data.windows(info.len()).position(|w| w == info).unwrap();
        // An odd width.
        data[pos + 2] = 23;

        assert_eq!(
            decode(&data, &low_bits_disabled(), &DecodeSettings::default()).unwrap_err(),
            DecodeError::Decoding(DecodingError::InvalidDimensions {
                width: 23,
                height: 8,
            })
        );
    }
}
