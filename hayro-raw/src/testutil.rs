//! Builders for synthetic container files used by the unit tests.

use crate::bits::writer::BitWriter;
use crate::decompress::ljpeg::{DHT, EOI, SOF3, SOI, SOS, predict};
use crate::huffman::PrefixCode;
use crate::tiff::TiffDataType;

/// An IFD entry to be written by [`TiffWriter`].
pub(crate) struct TestEntry {
    pub(crate) tag: u16,
    pub(crate) ty: TiffDataType,
    pub(crate) count: u32,
    pub(crate) data: Vec<u8>,
    /// Use this offset instead of appending the data.
    pub(crate) offset: Option<u32>,
}

impl TestEntry {
    pub(crate) fn raw(tag: u16, ty: TiffDataType, count: u32, data: Vec<u8>) -> Self {
        Self {
            tag,
            ty,
            count,
            data,
            offset: None,
        }
    }

    pub(crate) fn at_offset(tag: u16, ty: TiffDataType, count: u32, offset: u32) -> Self {
        Self {
            tag,
            ty,
            count,
            data: Vec::new(),
            offset: Some(offset),
        }
    }
}

/// Writes TIFF files piece by piece.
pub(crate) struct TiffWriter {
    pub(crate) data: Vec<u8>,
    big_endian: bool,
}

impl TiffWriter {
    pub(crate) fn new(big_endian: bool) -> Self {
        let mut w = Self {
            data: Vec::new(),
            big_endian,
        };

        w.data.extend_from_slice(if big_endian { b"MM" } else { b"II" });
        let magic = w.u16_bytes(42);
        w.data.extend_from_slice(&magic);
        w.data.extend_from_slice(&[0; 4]);

        w
    }

    pub(crate) fn u16_bytes(&self, v: u16) -> [u8; 2] {
        if self.big_endian {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        }
    }

    pub(crate) fn u32_bytes(&self, v: u32) -> [u8; 4] {
        if self.big_endian {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        }
    }

    pub(crate) fn shorts(&self, tag: u16, values: &[u16]) -> TestEntry {
        let data = values.iter().flat_map(|v| self.u16_bytes(*v)).collect();

        TestEntry::raw(tag, TiffDataType::Short, values.len() as u32, data)
    }

    pub(crate) fn longs(&self, tag: u16, values: &[u32]) -> TestEntry {
        let data = values.iter().flat_map(|v| self.u32_bytes(*v)).collect();

        TestEntry::raw(tag, TiffDataType::Long, values.len() as u32, data)
    }

    pub(crate) fn ascii(&self, tag: u16, value: &str) -> TestEntry {
        let mut data = value.as_bytes().to_vec();
        data.push(0);

        TestEntry::raw(tag, TiffDataType::Ascii, data.len() as u32, data)
    }

    pub(crate) fn pos(&self) -> u32 {
        self.data.len() as u32
    }

    /// Append raw bytes at an even offset and return that offset.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> u32 {
        if self.data.len() % 2 == 1 {
            self.data.push(0);
        }

        let offset = self.pos();
        self.data.extend_from_slice(bytes);

        offset
    }

    /// Pad the file with zeros up to `len` bytes.
    pub(crate) fn pad_to(&mut self, len: usize) {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
    }

    pub(crate) fn patch_u32(&mut self, at: u32, value: u32) {
        let bytes = self.u32_bytes(value);
        self.data[at as usize..at as usize + 4].copy_from_slice(&bytes);
    }

    pub(crate) fn set_first_ifd(&mut self, offset: u32) {
        self.patch_u32(4, offset);
    }

    /// Write an IFD and return its offset. The next-IFD pointer is `next`.
    pub(crate) fn write_ifd(&mut self, entries: &[TestEntry], next: u32) -> u32 {
        let mut records = Vec::new();

        for e in entries {
            let value = match e.offset {
                Some(offset) => self.u32_bytes(offset),
                None if e.data.len() <= 4 => {
                    let mut inline = [0; 4];
                    inline[..e.data.len()].copy_from_slice(&e.data);
                    inline
                }
                None => {
                    let offset = self.append(&e.data);
                    self.u32_bytes(offset)
                }
            };

            records.push((e.tag, e.ty as u16, e.count, value));
        }

        if self.data.len() % 2 == 1 {
            self.data.push(0);
        }

        let offset = self.pos();
        let count = self.u16_bytes(records.len() as u16);
        self.data.extend_from_slice(&count);

        for (tag, ty, count, value) in records {
            let tag = self.u16_bytes(tag);
            let ty = self.u16_bytes(ty);
            let count = self.u32_bytes(count);
            self.data.extend_from_slice(&tag);
            self.data.extend_from_slice(&ty);
            self.data.extend_from_slice(&count);
            self.data.extend_from_slice(&value);
        }

        let next = self.u32_bytes(next);
        self.data.extend_from_slice(&next);

        offset
    }

    /// The position of the next-IFD pointer of the IFD at `offset` with `entries` entries.
    pub(crate) fn next_pointer_pos(offset: u32, entries: u32) -> u32 {
        offset + 2 + entries * 12
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// A CIFF heap record to be written by [`ciff_heap`].
pub(crate) enum HeapEntry {
    /// Data appended to the value area.
    Value(u16, Vec<u8>),
    /// Eight bytes stored in the record itself.
    Inline(u16, [u8; 8]),
    /// An explicit size and offset into the value area.
    At(u16, u32, u32),
}

/// Build a CIFF heap: the value area, the record count, the records and the value area size.
pub(crate) fn ciff_heap(entries: &[HeapEntry]) -> Vec<u8> {
    let mut values = Vec::new();
    let mut records = Vec::new();

    for e in entries {
        match e {
            HeapEntry::Value(tag, data) => {
                let offset = values.len() as u32;
                values.extend_from_slice(data);
                records.extend_from_slice(&tag.to_le_bytes());
                records.extend_from_slice(&(data.len() as u32).to_le_bytes());
                records.extend_from_slice(&offset.to_le_bytes());
            }
            HeapEntry::Inline(tag, data) => {
                records.extend_from_slice(&(tag | 0x4000).to_le_bytes());
                records.extend_from_slice(data);
            }
            HeapEntry::At(tag, size, offset) => {
                records.extend_from_slice(&tag.to_le_bytes());
                records.extend_from_slice(&size.to_le_bytes());
                records.extend_from_slice(&offset.to_le_bytes());
            }
        }
    }

    let value_size = values.len() as u32;
    let mut out = values;
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&records);
    out.extend_from_slice(&value_size.to_le_bytes());

    out
}

/// The length of the header written by [`ciff_file`].
pub(crate) const CIFF_HEADER_LEN: usize = 26;

/// Wrap a root heap into a CRW file.
pub(crate) fn ciff_file(root: &[u8]) -> Vec<u8> {
    let mut out = b"II".to_vec();
    out.extend_from_slice(&(CIFF_HEADER_LEN as u32).to_le_bytes());
    out.extend_from_slice(b"HEAPCCDR");
    out.extend_from_slice(&[0, 0, 1, 0]);
    out.resize(CIFF_HEADER_LEN, 0);
    out.extend_from_slice(root);

    out
}

/// A box with a 32-bit size.
pub(crate) fn bmff_box(ty: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(ty);
    out.extend_from_slice(payload);

    out
}

/// A version 0 full box.
pub(crate) fn full_box(ty: &[u8; 4], flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut inner = (flags & 0x00ff_ffff).to_be_bytes().to_vec();
    inner.extend_from_slice(payload);

    bmff_box(ty, &inner)
}

/// A sample entry box with data reference index 1, followed by `extra`.
pub(crate) fn bmff_sample_entry(ty: &[u8; 4], extra: &[u8]) -> Vec<u8> {
    let mut payload = vec![0; 6];
    payload.extend_from_slice(&1_u16.to_be_bytes());
    payload.extend_from_slice(extra);

    bmff_box(ty, &payload)
}

fn bmff_track(sample_entry: &[u8], chunk_offset: u64, chunk_size: u32) -> Vec<u8> {
    let one = 1_u32.to_be_bytes();

    let url = full_box(b"url ", 1, &[]);
    let dref = full_box(b"dref", 0, &[&one[..], &url[..]].concat());
    let dinf = bmff_box(b"dinf", &dref);

    let stsd = full_box(b"stsd", 0, &[&one[..], sample_entry].concat());
    let stsc = full_box(b"stsc", 0, &[one, one, one, one].concat());
    let stsz = full_box(b"stsz", 0, &[chunk_size.to_be_bytes(), one].concat());
    let co64 = full_box(b"co64", 0, &[&one[..], &chunk_offset.to_be_bytes()[..]].concat());
    let stbl = bmff_box(b"stbl", &[stsd, stsc, stsz, co64].concat());

    let minf = bmff_box(b"minf", &[dinf, stbl].concat());
    let mdia = bmff_box(b"mdia", &minf);

    bmff_box(b"trak", &mdia)
}

/// A complete `crx ` file. Each track has one sample entry and one chunk; all chunks are
/// stored back to back in the `mdat` box.
pub(crate) fn bmff_file(extra_moov: &[Vec<u8>], tracks: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let ftyp = bmff_box(b"ftyp", b"crx \0\0\0\x01crx isom");

    let moov = |offsets: &[u64]| {
        let mut payload = extra_moov.concat();

        for ((entry, chunk), offset) in tracks.iter().zip(offsets) {
            payload.extend_from_slice(&bmff_track(entry, *offset, chunk.len() as u32));
        }

        bmff_box(b"moov", &payload)
    };

    // Offsets do not change the size of the movie box.
    let mdat_start = (ftyp.len() + moov(&vec![0; tracks.len()]).len() + 8) as u64;
    let offsets: Vec<u64> = tracks
        .iter()
        .scan(mdat_start, |pos, (_, chunk)| {
            let offset = *pos;
            *pos += chunk.len() as u64;

            Some(offset)
        })
        .collect();

    let chunks: Vec<u8> = tracks.iter().flat_map(|(_, c)| c.clone()).collect();

    [ftyp, moov(&offsets), bmff_box(b"mdat", &chunks)].concat()
}

/// The payload of a `CMP1` box with full-frame tiles and no tile flags.
pub(crate) fn cmp1_payload(planes: u8, encoding: u8, n_bits: u8, width: i32, height: i32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0_u16.to_be_bytes());
    out.extend_from_slice(&0x30_u16.to_be_bytes());
    out.extend_from_slice(&0x100_i16.to_be_bytes());
    out.extend_from_slice(&0_i16.to_be_bytes());

    for v in [width, height, width, height] {
        out.extend_from_slice(&v.to_be_bytes());
    }

    out.extend_from_slice(&[n_bits, planes, encoding, 0]);
    // The mdat header size.
    out.extend_from_slice(&8_i32.to_be_bytes());
    out.extend_from_slice(&[0; 20]);

    out
}

/// An `IAD1` box for a sensor of the given size. All rectangles equal `crop`.
pub(crate) fn iad1_box(ind: u16, sensor: [u16; 2], crop: [u16; 4]) -> Vec<u8> {
    let mut payload = Vec::new();

    for v in [sensor[0], sensor[1], 0, ind, 0, 0] {
        payload.extend_from_slice(&v.to_be_bytes());
    }

    for _ in 0..4 {
        for v in crop {
            payload.extend_from_slice(&v.to_be_bytes());
        }
    }

    full_box(b"IAD1", 0, &payload)
}

/// A `CRAW` sample entry with the given `CMP1` payload and `IAD1` box.
pub(crate) fn craw_entry(cmp1: &[u8], iad1: &[u8]) -> Vec<u8> {
    let cmp1_width = i32::from_be_bytes([cmp1[8], cmp1[9], cmp1[10], cmp1[11]]) as u16;
    let cmp1_height = i32::from_be_bytes([cmp1[12], cmp1[13], cmp1[14], cmp1[15]]) as u16;

    let mut extra = vec![0; 16];
    extra.extend_from_slice(&cmp1_width.to_be_bytes());
    extra.extend_from_slice(&cmp1_height.to_be_bytes());
    // Resolution, 72 dpi.
    extra.extend_from_slice(&[0, 72, 0, 0, 0, 72, 0, 0]);
    extra.extend_from_slice(&[0; 6]);
    extra.extend_from_slice(&[0; 32]);
    // Bit depth, reserved, flags and format.
    extra.extend_from_slice(&[0, 24, 0, 0, 0, 0, 0, 3]);

    extra.extend_from_slice(&bmff_box(b"CMP1", cmp1));
    extra.extend_from_slice(&full_box(b"CDI1", 0, iad1));
    extra.extend_from_slice(&bmff_box(b"free", &[0; 4]));

    bmff_sample_entry(b"CRAW", &extra)
}

/// A Canon `uuid` box with the compressor version and the TIFF payloads of `CMT1` to `CMT4`.
pub(crate) fn canon_uuid_box(version: &str, cmt: [&[u8]; 4]) -> Vec<u8> {
    let mut payload = crate::bmff::CANON_UUID.to_vec();
    payload.extend_from_slice(&bmff_box(b"CNCV", version.as_bytes()));
    payload.extend_from_slice(&bmff_box(b"CCTP", &[0; 12]));
    payload.extend_from_slice(&bmff_box(b"CTBO", &[0; 4]));

    for (name, data) in [b"CMT1", b"CMT2", b"CMT3", b"CMT4"].into_iter().zip(cmt) {
        payload.extend_from_slice(&bmff_box(name, data));
    }

    bmff_box(b"uuid", &payload)
}

/// The JPEG-style magnitude category and raw bits of a difference.
pub(crate) fn difference_bits(diff: i32) -> (u32, u32) {
    if diff == 0 {
        return (0, 0);
    }

    let len = 32 - diff.unsigned_abs().leading_zeros();
    let bits = if diff < 0 {
        (diff + (1 << len) - 1) as u32
    } else {
        diff as u32
    };

    (bits, len)
}

// Seventeen 5-bit codes for the difference lengths 0 to 16.
fn counts() -> [u8; 16] {
    let mut counts = [0; 16];
    counts[4] = 17;
    counts
}

/// A lossless JPEG encoder using one prefix table for all components.
pub(crate) struct LJpegStream {
    pub(crate) precision: u8,
    pub(crate) width: u16,
    pub(crate) height: u16,
    pub(crate) components: u8,
    pub(crate) predictor: u8,
    pub(crate) point_transform: u8,
    pub(crate) pad_16_bit_differences: bool,
}

impl LJpegStream {
    pub(crate) fn new(width: u16, height: u16, components: u8, predictor: u8) -> Self {
        Self {
            precision: 12,
            width,
            height,
            components,
            predictor,
            point_transform: 0,
            pad_16_bit_differences: false,
        }
    }

    pub(crate) fn dht(&self) -> Vec<u8> {
        let mut out = vec![0xff, DHT, 0, 2 + 1 + 16 + 17, 0x00];
        out.extend_from_slice(&counts());
        out.extend(0..17_u8);
        out
    }

    pub(crate) fn sof(&self) -> Vec<u8> {
        let len = 8 + 3 * self.components as u16;
        let mut out = vec![0xff, SOF3];
        out.extend_from_slice(&len.to_be_bytes());
        out.push(self.precision);
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.width.to_be_bytes());
        out.push(self.components);

        for i in 0..self.components {
            out.extend_from_slice(&[i + 1, 0x11, 0]);
        }

        out
    }

    pub(crate) fn sos(&self) -> Vec<u8> {
        let len = 6 + 2 * self.components as u16;
        let mut out = vec![0xff, SOS];
        out.extend_from_slice(&len.to_be_bytes());
        out.push(self.components);

        for i in 0..self.components {
            out.extend_from_slice(&[i + 1, 0x00]);
        }

        out.extend_from_slice(&[self.predictor, 0, self.point_transform]);
        out
    }

    pub(crate) fn entropy(&self, samples: &[u16]) -> Vec<u8> {
        let code = PrefixCode::from_counts(&counts(), &(0..17).collect::<Vec<_>>()).unwrap();
        let cps = self.components as usize;
        let row_len = self.width as usize * cps;
        let initial = 1_i32 << (self.precision - self.point_transform - 1);
        let mut writer = BitWriter::new();

        for i in 0..samples.len() {
            let (row, col) = (i / row_len, i % row_len);
            let at = |j: usize| samples[j] as i32;

            let pred = if row == 0 && col < cps {
                initial
            } else if row == 0 {
                at(i - cps)
            } else if col < cps {
                at(i - row_len)
            } else {
                predict(self.predictor, at(i - cps), at(i - row_len), at(i - row_len - cps))
            };

            // Differences are taken modulo 2^16.
            let diff = (at(i) - pred) as i16 as i32;

            if diff == -32768 {
                let symbol = code.symbols()[16];
                writer.write(symbol.code, symbol.len as u32);

                if self.pad_16_bit_differences {
                    writer.write(0, 16);
                }

                continue;
            }

            let (bits, len) = difference_bits(diff);
            let symbol = code.symbols()[len as usize];
            writer.write(symbol.code, symbol.len as u32);
            writer.write(bits, len);
        }

        // Pad the last byte with ones, as JPEG encoders do.
        let pad = (8 - writer.bit_len() % 8) % 8;
        writer.write((1 << pad) - 1, pad as u32);

        writer.finish_stuffed()
    }

    pub(crate) fn encode(&self, samples: &[u16]) -> Vec<u8> {
        let mut out = vec![0xff, SOI];
        out.extend(self.dht());
        out.extend(self.sof());
        out.extend(self.sos());
        out.extend(self.entropy(samples));
        out.extend_from_slice(&[0xff, EOI]);
        out
    }
}
