//! ISO base media file format boxes, as used by Canon CR3 files.
//!
//! Only the boxes needed to locate the raw data are understood: the file type, the movie
//! box with its tracks and sample tables, the Canon `uuid` box with the maker metadata and
//! the media data box. Everything else is skipped.

mod canon;

pub use canon::{CanonBox, CanonTimedMetadata, Cmp1Box, CrawBox, CtmdBox, Iad1Box};

use crate::buffer::{Buffer, Endianness};
use crate::cursor::ByteStream;
use crate::error::{FormatError, Result, bail};
use crate::log::ltrace;
use crate::ranges::NORangesSet;
use crate::util::fourcc;

/// The user type of the Canon metadata box.
pub const CANON_UUID: [u8; 16] = [
    0x85, 0xc0, 0xb6, 0x87, 0x82, 0x0f, 0x11, 0xe0, 0x81, 0x11, 0xf4, 0xce, 0x46, 0x2b, 0x6a,
    0x48,
];

/// The only supported major brand.
pub const CRX_BRAND: u32 = fourcc(b"crx ");

/// The type of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs, reason = "box names are self-describing")]
pub enum BoxType {
    Ftyp,
    Moov,
    Mdat,
    Uuid,
    Trak,
    Mdia,
    Minf,
    Dinf,
    Dref,
    Url,
    Stbl,
    Stsd,
    Stsc,
    Stsz,
    Co64,
    Cncv,
    Cctp,
    Ctbo,
    Cmt1,
    Cmt2,
    Cmt3,
    Cmt4,
    Thmb,
    Craw,
    Cmp1,
    Cdi1,
    Iad1,
    Ctmd,
    /// Any other box.
    Other(u32),
}

const KNOWN_BOXES: [(BoxType, &[u8; 4]); 28] = [
    (BoxType::Ftyp, b"ftyp"),
    (BoxType::Moov, b"moov"),
    (BoxType::Mdat, b"mdat"),
    (BoxType::Uuid, b"uuid"),
    (BoxType::Trak, b"trak"),
    (BoxType::Mdia, b"mdia"),
    (BoxType::Minf, b"minf"),
    (BoxType::Dinf, b"dinf"),
    (BoxType::Dref, b"dref"),
    (BoxType::Url, b"url "),
    (BoxType::Stbl, b"stbl"),
    (BoxType::Stsd, b"stsd"),
    (BoxType::Stsc, b"stsc"),
    (BoxType::Stsz, b"stsz"),
    (BoxType::Co64, b"co64"),
    (BoxType::Cncv, b"CNCV"),
    (BoxType::Cctp, b"CCTP"),
    (BoxType::Ctbo, b"CTBO"),
    (BoxType::Cmt1, b"CMT1"),
    (BoxType::Cmt2, b"CMT2"),
    (BoxType::Cmt3, b"CMT3"),
    (BoxType::Cmt4, b"CMT4"),
    (BoxType::Thmb, b"THMB"),
    (BoxType::Craw, b"CRAW"),
    (BoxType::Cmp1, b"CMP1"),
    (BoxType::Cdi1, b"CDI1"),
    (BoxType::Iad1, b"IAD1"),
    (BoxType::Ctmd, b"CTMD"),
];

impl BoxType {
    /// Classify a four-character code.
    pub fn from_fourcc(value: u32) -> Self {
        KNOWN_BOXES
            .iter()
            .find(|(_, name)| fourcc(name) == value)
            .map(|(ty, _)| *ty)
            .unwrap_or(Self::Other(value))
    }

    /// The four-character code of the box type.
    pub fn fourcc(self) -> u32 {
        match self {
            Self::Other(value) => value,
            ty => KNOWN_BOXES
                .iter()
                .find(|(known, _)| *known == ty)
                .map(|(_, name)| fourcc(name))
                .unwrap_or_default(),
        }
    }
}

/// A box whose payload has not been interpreted yet.
#[derive(Debug, Clone, Copy)]
pub struct RawBox<'a> {
    /// The box type.
    pub ty: BoxType,
    /// The extended type of `uuid` boxes.
    pub user_type: Option<[u8; 16]>,
    /// The whole box, positioned after the header.
    pub data: ByteStream<'a>,
}

impl<'a> RawBox<'a> {
    /// Read the box at the cursor and advance past it.
    pub fn read(bs: &mut ByteStream<'a>) -> Result<Self> {
        let start = bs.position();
        let size = bs.get_u32()?;
        let ty = bs.get_u32()?;

        let (size, header_len) = match size {
            // The box extends to the end of its container.
            0 => (bs.remain_size() + 8, 8),
            1 => {
                let large = u32::try_from(bs.get_u64()?)
                    .map_err(|_| FormatError::InvalidBoxSize)?;

                (large, 16)
            }
            size => (size, 8),
        };

        if size < header_len {
            bail!(FormatError::InvalidBoxSize);
        }

        bs.set_position(start)?;
        let mut data = bs.get_stream(size)?;
        data.skip_bytes(header_len)?;

        let user_type = if ty == fourcc(b"uuid") {
            let mut user_type = [0; 16];
            user_type.copy_from_slice(data.get_bytes(16)?);

            Some(user_type)
        } else {
            None
        };

        Ok(Self {
            ty: BoxType::from_fourcc(ty),
            user_type,
            data,
        })
    }

    /// Read the version and flags of a full box. Only version `0` is known.
    pub(crate) fn full_box_flags(&mut self) -> Result<u32> {
        let word = self.data.get_u32()?;

        if word >> 24 != 0 {
            bail!(FormatError::Corrupt("unexpected full box version"));
        }

        Ok(word & 0x00ff_ffff)
    }

    /// Read all boxes in the remaining payload.
    pub(crate) fn children(&self) -> Result<Vec<RawBox<'a>>> {
        read_boxes(self.data)
    }
}

/// Read boxes until the end of `bs`.
pub(crate) fn read_boxes(mut bs: ByteStream<'_>) -> Result<Vec<RawBox<'_>>> {
    let mut boxes = Vec::new();

    while !bs.at_end() {
        boxes.push(RawBox::read(&mut bs)?);
    }

    Ok(boxes)
}

/// Find the only box of type `ty`.
pub(crate) fn single<'a, 'b>(boxes: &'b [RawBox<'a>], ty: BoxType) -> Result<&'b RawBox<'a>> {
    optional_single(boxes, ty)?.ok_or_else(|| FormatError::MissingBox(ty.fourcc()).into())
}

/// Find the box of type `ty`, which may appear at most once.
pub(crate) fn optional_single<'a, 'b>(
    boxes: &'b [RawBox<'a>],
    ty: BoxType,
) -> Result<Option<&'b RawBox<'a>>> {
    let mut found = boxes.iter().filter(|b| b.ty == ty);
    let first = found.next();

    if found.next().is_some() {
        bail!(FormatError::DuplicateBox(ty.fourcc()));
    }

    Ok(first)
}

/// The `ftyp` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTypeBox {
    /// The major brand.
    pub major_brand: u32,
    /// The minor version.
    pub minor_version: u32,
    /// All compatible brands.
    pub compatible_brands: Vec<u32>,
}

impl FileTypeBox {
    fn parse(b: &RawBox<'_>) -> Result<Self> {
        let mut data = b.data;
        let major_brand = data.get_u32()?;
        let minor_version = data.get_u32()?;
        let mut compatible_brands = Vec::new();

        while data.remain_size() >= 4 {
            compatible_brands.push(data.get_u32()?);
        }

        if major_brand != CRX_BRAND {
            bail!(FormatError::InvalidSignature("ISO-BMFF major brand"));
        }

        Ok(Self {
            major_brand,
            minor_version,
            compatible_brands,
        })
    }
}

/// A sample description of a track.
#[derive(Debug, Clone, Copy)]
pub struct SampleEntry<'a> {
    /// The sample format, for example `CRAW` or `CTMD`.
    pub ty: BoxType,
    /// The index into the data reference table.
    pub data_reference_index: u16,
    /// The whole entry box.
    pub data: ByteStream<'a>,
}

/// A track, flattened from `trak` → `mdia` → `minf` → `stbl`.
#[derive(Debug, Clone)]
pub struct TrackBox<'a> {
    /// The sample descriptions.
    pub sample_entries: Vec<SampleEntry<'a>>,
    /// The size of each chunk.
    pub chunk_sizes: Vec<u32>,
    /// The file offset of each chunk.
    pub chunk_offsets: Vec<u32>,
    /// The chunks, resolved inside the `mdat` box.
    pub chunks: Vec<ByteStream<'a>>,
}

impl<'a> TrackBox<'a> {
    fn parse(trak: &RawBox<'a>) -> Result<Self> {
        let mdia = *single(&trak.children()?, BoxType::Mdia)?;
        let minf = *single(&mdia.children()?, BoxType::Minf)?;
        let minf_children = minf.children()?;
        let dinf = *single(&minf_children, BoxType::Dinf)?;
        let stbl = *single(&minf_children, BoxType::Stbl)?;

        let dref_entries = parse_dref(*single(&dinf.children()?, BoxType::Dref)?)?;

        let stbl_children = stbl.children()?;
        let sample_entries = parse_stsd(*single(&stbl_children, BoxType::Stsd)?)?;
        let stsc_entries = parse_stsc(*single(&stbl_children, BoxType::Stsc)?)?;
        let chunk_sizes = parse_stsz(*single(&stbl_children, BoxType::Stsz)?)?;
        let chunk_offsets = parse_co64(*single(&stbl_children, BoxType::Co64)?)?;

        if chunk_sizes.len() != chunk_offsets.len() {
            bail!(FormatError::Corrupt("mismatch in chunk offset and size count"));
        }

        if stsc_entries != chunk_offsets.len() {
            bail!(FormatError::Corrupt("mismatch in stsc entry count and chunk offset count"));
        }

        if stsc_entries != sample_entries.len() {
            bail!(FormatError::Corrupt("mismatch in stsc entry count and stsd entry count"));
        }

        if dref_entries != sample_entries.len() {
            bail!(FormatError::Corrupt("mismatch in dref entry count and stsd entry count"));
        }

        Ok(Self {
            sample_entries,
            chunk_sizes,
            chunk_offsets,
            chunks: Vec::new(),
        })
    }
}

fn parse_dref(mut b: RawBox<'_>) -> Result<usize> {
    b.full_box_flags()?;
    let count = b.data.get_u32()?;
    let mut entries = 0;

    for _ in 0..count {
        let mut entry = RawBox::read(&mut b.data)?;

        if entry.ty == BoxType::Url {
            // Flag bit 0 marks data in the same file.
            if entry.full_box_flags()? != 1 {
                bail!(FormatError::Corrupt("data reference is not self-contained"));
            }

            entries += 1;
        }
    }

    if entries != 1 {
        bail!(FormatError::Corrupt("unexpected data reference count"));
    }

    Ok(entries)
}

fn parse_stsd(mut b: RawBox<'_>) -> Result<Vec<SampleEntry<'_>>> {
    b.full_box_flags()?;
    let count = b.data.get_u32()?;
    let mut entries = Vec::new();

    for _ in 0..count {
        let entry = RawBox::read(&mut b.data)?;
        let mut data = entry.data;
        data.skip_bytes(6)?;

        entries.push(SampleEntry {
            ty: entry.ty,
            data_reference_index: data.get_u16()?,
            data: entry.data,
        });
    }

    if entries.len() != 1 {
        bail!(FormatError::Corrupt("unexpected sample description count"));
    }

    if entries.iter().any(|e| e.data_reference_index != 1) {
        bail!(FormatError::Corrupt("unexpected data reference index"));
    }

    Ok(entries)
}

fn parse_stsc(mut b: RawBox<'_>) -> Result<usize> {
    b.full_box_flags()?;
    let count = b.data.get_u32()?;
    b.data.check_elements(count, 12)?;

    for _ in 0..count {
        let first_chunk = b.data.get_u32()?;
        let samples_per_chunk = b.data.get_u32()?;
        let description_index = b.data.get_u32()?;

        if (first_chunk, samples_per_chunk, description_index) != (1, 1, 1) {
            bail!(FormatError::Corrupt("unexpected sample-to-chunk entry"));
        }
    }

    if count != 1 {
        bail!(FormatError::Corrupt("unexpected sample-to-chunk entry count"));
    }

    Ok(count as usize)
}

fn parse_stsz(mut b: RawBox<'_>) -> Result<Vec<u32>> {
    b.full_box_flags()?;
    let sample_size = b.data.get_u32()?;
    let count = b.data.get_u32()?;

    let sizes = if sample_size == 0 {
        b.data.check_elements(count, 4)?;

        (0..count)
            .map(|_| b.data.get_u32())
            .collect::<Result<Vec<_>>>()?
    } else {
        // All samples share one size.
        vec![sample_size]
    };

    if sizes.is_empty() {
        bail!(FormatError::Corrupt("no chunk sizes found"));
    }

    Ok(sizes)
}

fn parse_co64(mut b: RawBox<'_>) -> Result<Vec<u32>> {
    b.full_box_flags()?;
    let count = b.data.get_u32()?;
    b.data.check_elements(count, 8)?;

    if count != 1 {
        bail!(FormatError::Corrupt("unexpected chunk offset count"));
    }

    let offset = u32::try_from(b.data.get_u64()?)
        .map_err(|_| FormatError::Corrupt("chunk offset does not fit into 32 bits"))?;

    Ok(vec![offset])
}

/// The `moov` box.
#[derive(Debug, Clone)]
pub struct MovieBox<'a> {
    /// The tracks, in file order.
    pub tracks: Vec<TrackBox<'a>>,
    /// The Canon metadata box, if present.
    pub canon: Option<CanonBox<'a>>,
}

impl<'a> MovieBox<'a> {
    fn parse(moov: &RawBox<'a>) -> Result<Self> {
        let mut tracks = Vec::new();
        let mut canon = None;

        for child in moov.children()? {
            match child.ty {
                BoxType::Trak => tracks.push(TrackBox::parse(&child)?),
                BoxType::Uuid if child.user_type == Some(CANON_UUID) => {
                    if canon.is_some() {
                        bail!(FormatError::DuplicateBox(BoxType::Uuid.fourcc()));
                    }

                    canon = Some(CanonBox::parse(&child)?);
                }
                ty => ltrace!("ignoring box '{:?}' in moov", ty),
            }
        }

        if tracks.is_empty() {
            bail!(FormatError::MissingBox(BoxType::Trak.fourcc()));
        }

        Ok(Self { tracks, canon })
    }
}

/// A parsed ISO-BMFF file.
#[derive(Debug, Clone)]
pub struct IsoMFile<'a> {
    /// The file type.
    pub ftyp: FileTypeBox,
    /// The movie box.
    pub moov: MovieBox<'a>,
    /// The payload of the media data box.
    pub mdat: ByteStream<'a>,
}

impl<'a> IsoMFile<'a> {
    /// Parse a file and resolve the chunks of all tracks.
    pub fn parse(buffer: Buffer<'a>) -> Result<Self> {
        let root = ByteStream::new(buffer, Endianness::Big);

        let mut ftyp = None;
        let mut moov = None;
        let mut mdat = None;

        for b in read_boxes(root)? {
            match b.ty {
                BoxType::Ftyp => {
                    if ftyp.is_some() {
                        bail!(FormatError::DuplicateBox(b.ty.fourcc()));
                    }

                    ftyp = Some(FileTypeBox::parse(&b)?);
                }
                BoxType::Moov => {
                    if ftyp.is_none() {
                        bail!(FormatError::MissingBox(BoxType::Ftyp.fourcc()));
                    }

                    if moov.is_some() {
                        bail!(FormatError::DuplicateBox(b.ty.fourcc()));
                    }

                    moov = Some(MovieBox::parse(&b)?);
                }
                BoxType::Mdat => {
                    if moov.is_none() {
                        bail!(FormatError::MissingBox(BoxType::Moov.fourcc()));
                    }

                    if mdat.is_some() {
                        bail!(FormatError::DuplicateBox(b.ty.fourcc()));
                    }

                    mdat = Some(b.data);
                }
                ty => ltrace!("ignoring top-level box '{:?}'", ty),
            }
        }

        let mut file = Self {
            ftyp: ftyp.ok_or(FormatError::MissingBox(BoxType::Ftyp.fourcc()))?,
            moov: moov.ok_or(FormatError::MissingBox(BoxType::Moov.fourcc()))?,
            mdat: mdat.ok_or(FormatError::MissingBox(BoxType::Mdat.fourcc()))?,
        };
        file.resolve_chunks(root)?;

        Ok(file)
    }

    /// Check whether the data looks like an ISO-BMFF file.
    pub fn is_isom(data: &[u8]) -> bool {
        data.get(4..8) == Some(b"ftyp")
    }

    fn resolve_chunks(&mut self, root: ByteStream<'a>) -> Result<()> {
        let mdat = self.mdat.peek_stream(self.mdat.remain_size())?.buffer().range();
        let mut chunk_ranges = NORangesSet::new();

        for track in &mut self.moov.tracks {
            for (offset, size) in track.chunk_offsets.iter().zip(&track.chunk_sizes) {
                // Chunk offsets are relative to the start of the file.
                let chunk = root.get_sub_stream(*offset, *size)?;
                let range = chunk.buffer().range();

                if range.begin() < mdat.begin() || range.end() > mdat.end() {
                    bail!(FormatError::Corrupt("chunk is not inside the mdat box"));
                }

                if !chunk_ranges.insert(range) {
                    bail!(FormatError::Overlap("mdat chunks"));
                }

                track.chunks.push(chunk);
            }
        }

        Ok(())
    }
}
