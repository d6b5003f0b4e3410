//! Lossless JPEG (process 14, `SOF3`).
//!
//! A stream holds up to four prefix-code tables, a frame header and a single scan. Every
//! sample is predicted from its already decoded neighbours in the same component, and the
//! scan stores the prefix-coded differences.
//!
//! The frame does not need to have the shape of the tile it covers. DNG writers commonly
//! store a tile of `w` pixels as a frame of `w / 2` columns with two components, or stack the
//! components vertically. The decoder maps the components of one frame column (an MCU) onto
//! a small rectangle of the tile.

use crate::bits::BitPumpJpeg;
use crate::buffer::Endianness;
use crate::cursor::ByteStream;
use crate::error::{DecodingError, Result, UnsupportedError, bail};
use crate::huffman::{HuffmanTable, PrefixCode};
use crate::log::{ldebug, ltrace};
use crate::scheduler::DecodedTile;

pub(crate) const SOF3: u8 = 0xc3;
pub(crate) const DHT: u8 = 0xc4;
pub(crate) const SOI: u8 = 0xd8;
pub(crate) const EOI: u8 = 0xd9;
pub(crate) const SOS: u8 = 0xda;
const DQT: u8 = 0xdb;
const DRI: u8 = 0xdd;

const MAX_TABLES: usize = 4;
const MAX_COMPONENTS: usize = 4;
// 16 codes is the JPEG limit, but some writers emit 17.
const MAX_TABLE_VALUES: usize = 17;

/// The frame header of a lossless JPEG stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// The sample precision in bits.
    pub precision: u8,
    /// The number of columns.
    pub width: u16,
    /// The number of rows.
    pub height: u16,
    /// The number of interleaved components.
    pub components: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct Component {
    id: u8,
    table: usize,
}

#[derive(Debug, Clone)]
struct Frame {
    header: FrameHeader,
    components: [Component; MAX_COMPONENTS],
}

#[derive(Debug, Clone, Copy)]
struct Scan {
    predictor: u8,
    point_transform: u8,
}

/// A lossless JPEG decompressor.
#[derive(Debug, Clone)]
pub struct LJpegDecompressor<'a> {
    input: ByteStream<'a>,
    fix_dng_16_bug: bool,
}

impl<'a> LJpegDecompressor<'a> {
    /// Create a new decompressor for the stream in `input`. JPEG data is always big-endian.
    pub fn new(mut input: ByteStream<'a>) -> Self {
        input.set_endianness(Endianness::Big);

        Self {
            input,
            fix_dng_16_bug: false,
        }
    }

    /// Whether 16-bit differences are followed by 16 bits that must be skipped.
    ///
    /// Old DNG writers emitted these bits, which violates the JPEG standard.
    pub fn fix_dng_16_bug(mut self, fix: bool) -> Self {
        self.fix_dng_16_bug = fix;
        self
    }

    /// Read the frame header without decoding the scan.
    pub fn frame_header(&self) -> Result<FrameHeader> {
        let mut bs = self.input;
        expect_soi(&mut bs)?;

        loop {
            match next_marker(&mut bs, true)? {
                SOF3 => return Ok(parse_sof(&mut bs)?.header),
                EOI => bail!(DecodingError::Marker("no start of frame")),
                _ => {}
            }
        }
    }

    /// Decode the stream as a tile placed at `(x, y)` of the target.
    ///
    /// `slot` is the full size of the tile in samples and rows. The frame must cover exactly
    /// that many samples, or exactly `size` for writers that store edge tiles at their clipped
    /// size. Only the top-left `size` of the slot is decoded and returned.
    pub fn decode_tile(
        &self,
        x: usize,
        y: usize,
        slot: (usize, usize),
        size: (usize, usize),
    ) -> Result<DecodedTile<u16>> {
        if size.0 == 0 || size.1 == 0 || size.0 > slot.0 || size.1 > slot.1 {
            bail!(DecodingError::InvalidDimensions {
                width: size.0 as u32,
                height: size.1 as u32,
            });
        }

        let mut sink = TileSink {
            slot,
            width: size.0,
            height: size.1,
            mcu: McuLayout::default(),
            shift: 0,
            data: Vec::new(),
        };
        self.decode_frame(&mut sink)?;

        Ok(DecodedTile {
            x,
            y,
            width: sink.width,
            data: sink.data,
        })
    }

    /// Decode the first `count` samples of the scan in frame order, `width * components`
    /// samples per row.
    ///
    /// `rows` returns how many rows the frame holds, which some writers store differently from
    /// the header. The frame must hold at least `count` samples.
    pub fn decode_sequential(
        &self,
        count: usize,
        rows: impl FnOnce(&FrameHeader) -> usize,
    ) -> Result<(FrameHeader, Vec<u16>)> {
        let mut sink = SequentialSink {
            count,
            rows: Some(rows),
            shift: 0,
            data: Vec::new(),
        };
        let header = self.decode_frame(&mut sink)?;

        Ok((header, sink.data))
    }

    fn decode_frame(&self, sink: &mut impl RowSink) -> Result<FrameHeader> {
        let mut bs = self.input;
        let mut tables: [Option<HuffmanTable>; MAX_TABLES] = Default::default();
        let mut frame = None;
        let mut scanned = false;

        expect_soi(&mut bs)?;

        loop {
            let marker = match next_marker(&mut bs, true) {
                Ok(marker) => marker,
                // Some writers end the file right after the scan.
                Err(_) if scanned => break,
                Err(e) => return Err(e),
            };

            ltrace!("ljpeg marker {:#x} at {}", marker, bs.position());

            match marker {
                DHT => parse_dht(&mut bs, &mut tables, self.fix_dng_16_bug)?,
                SOF3 => {
                    if frame.is_some() {
                        bail!(DecodingError::Marker("duplicate start of frame"));
                    }

                    frame = Some(parse_sof(&mut bs)?);
                }
                SOS => {
                    let Some(frame) = frame.as_mut() else {
                        bail!(DecodingError::Marker("scan before start of frame"));
                    };

                    if scanned {
                        bail!(UnsupportedError::Feature("multiple lossless jpeg scans"));
                    }

                    let scan = parse_sos(&mut bs, frame, &tables)?;
                    let rows = sink.begin(&frame.header, scan.point_transform)?;
                    let data = bs.peek_remaining();
                    decode_scan(data, frame, &tables, scan, rows, sink)?;

                    scanned = true;

                    // Continue at the marker that ends the entropy-coded data.
                    match find_marker(data) {
                        Some(len) => bs.skip_bytes(len as u32)?,
                        None => break,
                    }
                }
                DQT => bail!(DecodingError::Marker("quantization tables in lossless jpeg")),
                DRI => {
                    let _len = bs.get_u16()?;

                    if bs.get_u16()? != 0 {
                        bail!(UnsupportedError::Feature("lossless jpeg restart intervals"));
                    }
                }
                EOI => break,
                // Everything else is skipped by the marker search.
                _ => {}
            }
        }

        match frame {
            Some(frame) if scanned => Ok(frame.header),
            _ => bail!(DecodingError::Marker("no scan")),
        }
    }
}

/// Receives the rows of a scan as they are decoded.
trait RowSink {
    /// Check the frame before anything is decoded and return the number of rows to decode.
    fn begin(&mut self, header: &FrameHeader, point_transform: u8) -> Result<usize>;

    /// Store a decoded row, `width * components` samples before the point transform.
    fn row(&mut self, index: usize, samples: &[u16]);
}

/// The rectangle of tile samples covered by one frame column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct McuLayout {
    width: usize,
    height: usize,
}

impl McuLayout {
    /// Find the layout under which the frame covers `slot` or, failing that, `size`.
    fn find(header: &FrameHeader, slot: (usize, usize), size: (usize, usize)) -> Result<Self> {
        let cps = header.components as usize;
        let (frame_w, frame_h) = (header.width as usize, header.height as usize);

        for (width, height) in [slot, size] {
            if width % frame_w != 0 || height % frame_h != 0 {
                continue;
            }

            let layout = Self {
                width: width / frame_w,
                height: height / frame_h,
            };

            if layout.width * layout.height == cps {
                return Ok(layout);
            }
        }

        bail!(DecodingError::Corrupt("lossless jpeg frame does not match tile"))
    }
}

struct TileSink {
    slot: (usize, usize),
    width: usize,
    height: usize,
    mcu: McuLayout,
    shift: u32,
    data: Vec<u16>,
}

impl RowSink for TileSink {
    fn begin(&mut self, header: &FrameHeader, point_transform: u8) -> Result<usize> {
        self.mcu = McuLayout::find(header, self.slot, (self.width, self.height))?;
        self.shift = point_transform as u32;
        self.data = vec![0; self.width * self.height];

        Ok(self.height.div_ceil(self.mcu.height))
    }

    fn row(&mut self, index: usize, samples: &[u16]) {
        let cps = self.mcu.width * self.mcu.height;

        for (i, sample) in samples.iter().enumerate() {
            let c = i % cps;
            let x = (i / cps) * self.mcu.width + c % self.mcu.width;
            let y = index * self.mcu.height + c / self.mcu.width;

            if x < self.width && y < self.height {
                self.data[y * self.width + x] = sample << self.shift;
            }
        }
    }
}

struct SequentialSink<F> {
    count: usize,
    rows: Option<F>,
    shift: u32,
    data: Vec<u16>,
}

impl<F: FnOnce(&FrameHeader) -> usize> RowSink for SequentialSink<F> {
    fn begin(&mut self, header: &FrameHeader, point_transform: u8) -> Result<usize> {
        let rows = self.rows.take().map_or(header.height as usize, |f| f(header));
        let row_len = header.width as usize * header.components as usize;

        if row_len.checked_mul(rows).is_none_or(|total| total < self.count) {
            bail!(DecodingError::Corrupt("lossless jpeg frame is smaller than the image"));
        }

        self.shift = point_transform as u32;
        self.data = Vec::with_capacity(self.count);

        Ok(self.count.div_ceil(row_len))
    }

    fn row(&mut self, _: usize, samples: &[u16]) {
        let take = (self.count - self.data.len()).min(samples.len());
        self.data.extend(samples[..take].iter().map(|s| s << self.shift));
    }
}

fn expect_soi(bs: &mut ByteStream<'_>) -> Result<()> {
    if next_marker(bs, false)? != SOI {
        bail!(DecodingError::Marker("stream does not start with SOI"));
    }

    Ok(())
}

/// Read the next marker. Without `allow_skip`, the marker must be at the cursor.
fn next_marker(bs: &mut ByteStream<'_>, allow_skip: bool) -> Result<u8> {
    let mut c1 = bs.get_u8()?;

    loop {
        let c0 = c1;
        c1 = bs.get_u8()?;

        if c0 == 0xff && c1 != 0x00 && c1 != 0xff {
            return Ok(c1);
        }

        if !allow_skip {
            bail!(DecodingError::Marker("expected a marker"));
        }
    }
}

/// The offset of the first marker in entropy-coded data.
fn find_marker(data: &[u8]) -> Option<usize> {
    data.windows(2)
        .position(|w| w[0] == 0xff && w[1] != 0x00 && w[1] != 0xff)
}

fn parse_dht(
    bs: &mut ByteStream<'_>,
    tables: &mut [Option<HuffmanTable>; MAX_TABLES],
    fix_dng_16_bug: bool,
) -> Result<()> {
    let mut remaining = (bs.get_u16()? as usize)
        .checked_sub(2)
        .ok_or(DecodingError::Marker("invalid DHT length"))?;

    while remaining > 0 {
        let b = bs.get_u8()?;

        if b >> 4 != 0 {
            bail!(UnsupportedError::Feature("AC prefix-code tables"));
        }

        let index = (b & 0xf) as usize;

        if index >= MAX_TABLES {
            bail!(DecodingError::InvalidHuffmanTable("invalid table destination"));
        }

        if tables[index].is_some() {
            bail!(DecodingError::InvalidHuffmanTable("duplicate table definition"));
        }

        let mut counts = [0_u8; 16];
        counts.copy_from_slice(bs.get_bytes(16)?);
        let total: usize = counts.iter().map(|c| *c as usize).sum();

        if total > MAX_TABLE_VALUES || remaining < 1 + 16 + total {
            bail!(DecodingError::InvalidHuffmanTable("invalid DHT table"));
        }

        let values: Vec<u16> = bs.get_bytes(total as u32)?.iter().map(|v| *v as u16).collect();
        let code = PrefixCode::from_counts(&counts, &values)?;

        tables[index] = Some(HuffmanTable::new(&code, true, fix_dng_16_bug)?);
        remaining -= 1 + 16 + total;
    }

    Ok(())
}

fn parse_sof(bs: &mut ByteStream<'_>) -> Result<Frame> {
    let len = bs.get_u16()? as u32;
    let header = FrameHeader {
        precision: bs.get_u8()?,
        height: bs.get_u16()?,
        width: bs.get_u16()?,
        components: bs.get_u8()?,
    };

    ldebug!(
        "ljpeg frame: {}x{}, {} components, {} bits",
        header.width,
        header.height,
        header.components,
        header.precision
    );

    if header.precision < 2 || header.precision > 16 {
        bail!(UnsupportedError::BitsPerSample(header.precision as u32));
    }

    let count = header.components as usize;

    if !(1..=MAX_COMPONENTS).contains(&count) {
        bail!(DecodingError::ComponentMismatch {
            expected: MAX_COMPONENTS as u32,
            found: count as u32,
        });
    }

    if len != 8 + 3 * count as u32 {
        bail!(DecodingError::Marker("SOF3 length mismatch"));
    }

    if header.width == 0 || header.height == 0 {
        bail!(DecodingError::InvalidDimensions {
            width: header.width as u32,
            height: header.height as u32,
        });
    }

    let mut components = [Component::default(); MAX_COMPONENTS];

    for component in &mut components[..count] {
        component.id = bs.get_u8()?;
        let sampling = bs.get_u8()?;

        if sampling != 0x11 {
            bail!(UnsupportedError::Feature("subsampled lossless jpeg"));
        }

        if bs.get_u8()? != 0 {
            bail!(UnsupportedError::Feature("quantized lossless jpeg"));
        }
    }

    Ok(Frame { header, components })
}

fn parse_sos(
    bs: &mut ByteStream<'_>,
    frame: &mut Frame,
    tables: &[Option<HuffmanTable>; MAX_TABLES],
) -> Result<Scan> {
    let count = frame.header.components as usize;

    if bs.get_u16()? as usize != 6 + 2 * count {
        bail!(DecodingError::Marker("SOS length mismatch"));
    }

    let found = bs.get_u8()?;

    if found as usize != count {
        bail!(DecodingError::ComponentMismatch {
            expected: count as u32,
            found: found as u32,
        });
    }

    for _ in 0..count {
        let id = bs.get_u8()?;
        let table = (bs.get_u8()? >> 4) as usize;

        if table >= MAX_TABLES || tables[table].is_none() {
            bail!(DecodingError::InvalidHuffmanTable("invalid table selection"));
        }

        let Some(component) = frame.components[..count].iter_mut().find(|c| c.id == id) else {
            bail!(DecodingError::Marker("invalid component selector"));
        };

        component.table = table;
    }

    let predictor = bs.get_u8()?;

    if !(1..=7).contains(&predictor) {
        bail!(UnsupportedError::Predictor(predictor as u32));
    }

    // Se and Ah are unused.
    bs.skip_bytes(1)?;
    let point_transform = bs.get_u8()? & 0xf;

    if point_transform >= frame.header.precision {
        bail!(DecodingError::Corrupt("point transform exceeds precision"));
    }

    Ok(Scan {
        predictor,
        point_transform,
    })
}

/// Decode the first `rows` rows of the scan into `sink`.
fn decode_scan(
    data: &[u8],
    frame: &Frame,
    tables: &[Option<HuffmanTable>; MAX_TABLES],
    scan: Scan,
    rows: usize,
    sink: &mut impl RowSink,
) -> Result<()> {
    let header = &frame.header;
    let cps = header.components as usize;
    let row_len = header.width as usize * cps;

    let mut component_tables = Vec::with_capacity(cps);

    for component in &frame.components[..cps] {
        let Some(table) = tables[component.table].as_ref() else {
            bail!(DecodingError::InvalidHuffmanTable("invalid table selection"));
        };

        component_tables.push(table);
    }

    let initial = 1_i32 << (header.precision - scan.point_transform - 1);
    let mut bits = BitPumpJpeg::new(data);
    let mut prev = vec![0_u16; row_len];
    let mut cur = vec![0_u16; row_len];

    for row in 0..rows {
        for col in 0..row_len {
            let pred = match (row, col < cps) {
                (0, true) => initial,
                (_, true) => prev[col] as i32,
                (0, false) => cur[col - cps] as i32,
                _ => predict(
                    scan.predictor,
                    cur[col - cps] as i32,
                    prev[col] as i32,
                    prev[col - cps] as i32,
                ),
            };

            let diff = component_tables[col % cps].decode_difference(&mut bits)?;
            cur[col] = (pred + diff) as u16;
        }

        sink.row(row, &cur);
        core::mem::swap(&mut prev, &mut cur);
    }

    Ok(())
}

#[inline]
pub(crate) fn predict(predictor: u8, ra: i32, rb: i32, rc: i32) -> i32 {
    match predictor {
        1 => ra,
        2 => rb,
        3 => rc,
        4 => ra + rb - rc,
        5 => ra + ((rb - rc) >> 1),
        6 => rb + ((ra - rc) >> 1),
        _ => (ra + rb) >> 1,
    }
}
