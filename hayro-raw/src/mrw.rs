//! Minolta MRW containers.
//!
//! An MRW file starts with an `\0MRM` block whose payload is a sequence of tagged blocks.
//! The image data follows directly after that block. Everything is big endian.

use crate::buffer::{Buffer, Endianness};
use crate::cursor::ByteStream;
use crate::error::{DecodingError, FormatError, Result, UnsupportedError, bail};
use crate::log::ltrace;
use crate::tiff::TiffTree;

const MAGIC: &[u8; 4] = b"\0MRM";

const PRD: u32 = 0x0050_5244;
const TTW: u32 = 0x0054_5457;
const WBG: u32 = 0x0057_4247;

const MAX_WIDTH: u32 = 3280;
const MAX_HEIGHT: u32 = 2456;

const STORAGE_UNPACKED: u8 = 0x52;
const STORAGE_PACKED: u8 = 0x59;

/// A parsed MRW file.
#[derive(Debug, Clone)]
pub struct MrwFile<'a> {
    /// The sensor width in pixels.
    pub width: u32,
    /// The sensor height in pixels.
    pub height: u32,
    /// The number of bits per stored sample, 12 or 16.
    pub bits_per_sample: u32,
    /// Whether 12-bit samples are packed.
    pub packed: bool,
    /// The four white balance gains of the `WBG` block.
    pub wb_coeffs: Option<[u16; 4]>,
    /// The TIFF tree of the `TTW` block. Offsets in it are relative to the block.
    pub tiff: Option<TiffTree<'a>>,
    /// The image data.
    pub image_data: ByteStream<'a>,
}

struct Prd {
    width: u32,
    height: u32,
    bits_per_sample: u32,
    packed: bool,
}

impl<'a> MrwFile<'a> {
    /// Check whether the data looks like an MRW file.
    pub fn is_mrw(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    /// Parse the header blocks and locate the image data.
    pub fn parse(buffer: Buffer<'a>) -> Result<Self> {
        let mut bs = ByteStream::new(buffer, Endianness::Big);

        if !bs.skip_prefix(MAGIC) {
            bail!(FormatError::InvalidSignature("MRW"));
        }

        let header_size = bs.get_u32()?;
        let mut blocks = bs.get_stream(header_size)?;
        let data_offset = bs.position();

        let mut prd = None;
        let mut tiff = None;
        let mut wb_coeffs = None;

        while !blocks.at_end() {
            let tag = blocks.get_u32()?;
            let len = blocks.get_u32()?;

            if len == 0 {
                bail!(FormatError::Corrupt("found MRW block of zero length"));
            }

            let mut block = blocks.get_stream(len)?;

            match tag {
                PRD => prd = Some(parse_prd(&mut block)?),
                TTW => tiff = Some(TiffTree::parse(block.buffer())?),
                WBG => {
                    // One exponent per gain.
                    block.skip_bytes(4)?;

                    let mut gains = [0; 4];

                    for gain in &mut gains {
                        *gain = block.get_u16()?;
                    }

                    wb_coeffs = Some(gains);
                }
                _ => ltrace!("ignoring MRW block 0x{:06x}", tag),
            }
        }

        let Some(prd) = prd else {
            bail!(FormatError::Corrupt("MRW file has no PRD block"));
        };

        let image_bytes = prd.width as u64 * prd.height as u64 * prd.bits_per_sample as u64 / 8;
        // Truncated files keep every complete row.
        let available = bs.remain_size() as u64;
        let image_data = bs.get_sub_stream(data_offset, image_bytes.min(available) as u32)?;

        Ok(Self {
            width: prd.width,
            height: prd.height,
            bits_per_sample: prd.bits_per_sample,
            packed: prd.packed,
            wb_coeffs,
            tiff,
            image_data,
        })
    }
}

fn parse_prd(bs: &mut ByteStream<'_>) -> Result<Prd> {
    // Version string.
    bs.skip_bytes(8)?;
    let height = bs.get_u16()? as u32;
    let width = bs.get_u16()? as u32;

    if width == 0 || height == 0 || width > MAX_WIDTH || height > MAX_HEIGHT {
        bail!(DecodingError::InvalidDimensions { width, height });
    }

    // Output image size.
    bs.skip_bytes(4)?;

    let bits_per_sample = bs.get_u8()? as u32;

    if !matches!(bits_per_sample, 12 | 16) {
        bail!(UnsupportedError::BitsPerSample(bits_per_sample));
    }

    if (width * height * bits_per_sample) % 8 != 0 {
        bail!(DecodingError::InvalidDimensions { width, height });
    }

    if bs.get_u8()? != 12 {
        bail!(FormatError::Corrupt("unexpected MRW pixel size"));
    }

    let packed = match bs.get_u8()? {
        STORAGE_UNPACKED => false,
        STORAGE_PACKED => true,
        _ => bail!(UnsupportedError::Feature("MRW storage method")),
    };

    if packed != (bits_per_sample == 12) {
        bail!(FormatError::Corrupt("MRW packing does not match the sample size"));
    }

    Ok(Prd {
        width,
        height,
        bits_per_sample,
        packed,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::testutil::TiffWriter;
    use crate::tiff::tags;

    pub(crate) fn prd(width: u16, height: u16, bits: u8, storage: u8) -> Vec<u8> {
        let mut out = b"21810002".to_vec();
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&[bits, 12, storage, 0, 0, 0, 0, 1]);

        out
    }

    pub(crate) fn ttw(make: &str, model: &str) -> Vec<u8> {
        let mut w = TiffWriter::new(true);
        let entries = [w.ascii(tags::MAKE, make), w.ascii(tags::MODEL, model)];
        let ifd = w.write_ifd(&entries, 0);
        w.set_first_ifd(ifd);

        w.finish()
    }

    pub(crate) fn wbg(gains: [u16; 4]) -> Vec<u8> {
        let mut out = vec![0; 4];

        for g in gains {
            out.extend_from_slice(&g.to_be_bytes());
        }

        out
    }

    pub(crate) fn mrw_file(blocks: &[(&[u8; 3], Vec<u8>)], image: &[u8]) -> Vec<u8> {
        let mut header = Vec::new();

        for (tag, payload) in blocks {
            header.push(0);
            header.extend_from_slice(*tag);
            header.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            header.extend_from_slice(payload);
        }

        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&(header.len() as u32).to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(image);

        out
    }

    #[test]
    fn packed_file() {
        let data = mrw_file(
            &[
                (b"PRD", prd(4, 2, 12, STORAGE_PACKED)),
                (b"TTW", ttw("MINOLTA", "DiMAGE 7")),
                (b"WBG", wbg([400, 256, 256, 300])),
                (b"PAD", vec![0; 12]),
            ],
            &[0xab; 12],
        );

        let mrw = MrwFile::parse(Buffer::new(&data).unwrap()).unwrap();

        assert_eq!((mrw.width, mrw.height, mrw.bits_per_sample), (4, 2, 12));
        assert!(mrw.packed);
        assert_eq!(mrw.wb_coeffs, Some([400, 256, 256, 300]));
        assert_eq!(mrw.image_data.size(), 12);

        let id = mrw.tiff.unwrap().get_id().unwrap();
        assert_eq!((id.make.as_str(), id.model.as_str()), ("MINOLTA", "DiMAGE 7"));
    }

    #[test]
    fn truncated_image_data() {
        let data = mrw_file(&[(b"PRD", prd(4, 4, 16, STORAGE_UNPACKED))], &[0; 20]);
        let mrw = MrwFile::parse(Buffer::new(&data).unwrap()).unwrap();

        assert!(!mrw.packed);
        assert_eq!(mrw.image_data.size(), 20);
    }

    #[test]
    fn invalid_headers() {
        let parse = |data: &[u8]| MrwFile::parse(Buffer::new(data).unwrap()).map(|_| ());

        assert_eq!(
            parse(&b"\0MRX\0\0\0\0"[..]),
            Err(DecodeError::Format(FormatError::InvalidSignature("MRW")))
        );
        assert_eq!(
            parse(&mrw_file(&[(b"WBG", wbg([1; 4]))], &[])),
            Err(DecodeError::Format(FormatError::Corrupt("MRW file has no PRD block")))
        );
        assert_eq!(
            parse(&mrw_file(&[(b"PRD", Vec::new())], &[])),
            Err(DecodeError::Format(FormatError::Corrupt("found MRW block of zero length")))
        );
        assert_eq!(
            parse(&mrw_file(&[(b"PRD", prd(4, 2, 16, STORAGE_PACKED))], &[])),
            Err(DecodeError::Format(FormatError::Corrupt(
                "MRW packing does not match the sample size"
            )))
        );
        assert_eq!(
            parse(&mrw_file(&[(b"PRD", prd(4000, 2, 12, STORAGE_PACKED))], &[])),
            Err(DecodeError::Decoding(DecodingError::InvalidDimensions {
                width: 4000,
                height: 2,
            }))
        );
        assert_eq!(
            parse(&mrw_file(&[(b"PRD", prd(4, 2, 10, STORAGE_PACKED))], &[])),
            Err(DecodeError::Unsupported(UnsupportedError::BitsPerSample(10)))
        );
    }
}
