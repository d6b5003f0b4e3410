//! TIFF directory trees.
//!
//! A parsed file is a [`TiffTree`]: an arena of IFDs whose node `0` is a virtual root that
//! holds the chain of top-level IFDs as its children. Sub-IFDs, EXIF directories and maker
//! notes become children of the IFD that points to them.

mod entry;
mod makernote;
pub mod tags;

use std::collections::BTreeMap;

pub use entry::{TiffDataType, TiffEntry};

use crate::buffer::{Buffer, Endianness};
use crate::cursor::ByteStream;
use crate::error::{FormatError, Result, bail};
use crate::log::ldebug;
use crate::ranges::NORangesSet;
use crate::tree::{self, Links, Node};

/// A handle to an IFD in a [`TiffTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfdId(usize);

/// The make and model of a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiffId {
    /// The camera make.
    pub make: String,
    /// The camera model.
    pub model: String,
}

/// A single image file directory.
#[derive(Debug, Clone)]
pub struct TiffIfd<'a> {
    links: Links,
    entries: BTreeMap<u16, TiffEntry<'a>>,
    next_ifd: u32,
    endianness: Endianness,
}

impl Node for TiffIfd<'_> {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

impl<'a> TiffIfd<'a> {
    fn new(links: Links, endianness: Endianness) -> Self {
        Self {
            links,
            entries: BTreeMap::new(),
            next_ifd: 0,
            endianness,
        }
    }

    /// Get the entry with the given tag.
    pub fn get_entry(&self, tag: u16) -> Result<&TiffEntry<'a>> {
        self.entries
            .get(&tag)
            .ok_or_else(|| FormatError::MissingEntry { tag }.into())
    }

    /// Get the entry with the given tag, if present.
    pub fn find_entry(&self, tag: u16) -> Option<&TiffEntry<'a>> {
        self.entries.get(&tag)
    }

    /// Whether the IFD has an entry with the given tag.
    pub fn has_entry(&self, tag: u16) -> bool {
        self.entries.contains_key(&tag)
    }

    /// All entries, ordered by tag.
    pub fn entries(&self) -> impl Iterator<Item = &TiffEntry<'a>> {
        self.entries.values()
    }

    /// The offset of the next IFD in the chain, or `0`.
    pub fn next_ifd(&self) -> u32 {
        self.next_ifd
    }

    /// The depth below the virtual root.
    pub fn depth(&self) -> u32 {
        self.links.depth
    }

    /// The byte order of the IFD.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// The parent IFD.
    pub fn parent(&self) -> Option<IfdId> {
        self.links.parent.map(IfdId)
    }

    /// The direct sub-IFDs, in parse order.
    pub fn sub_ifds(&self) -> impl Iterator<Item = IfdId> + '_ {
        self.links.children.iter().copied().map(IfdId)
    }
}

/// A parsed TIFF file.
#[derive(Debug, Clone)]
pub struct TiffTree<'a> {
    ifds: Vec<TiffIfd<'a>>,
    ifd_ranges: NORangesSet,
}

impl<'a> TiffTree<'a> {
    /// Parse a TIFF file, including its IFD chain and all nested directories.
    pub fn parse(buffer: Buffer<'a>) -> Result<Self> {
        let mut bs = ByteStream::new(buffer, Endianness::Unknown);
        let endianness = bs.get_byte_order_marker()?;
        bs.set_endianness(endianness);

        let magic = bs.get_u16()?;

        // Some vendors use their own magic numbers.
        if !matches!(magic, 42 | 0x4f52 | 0x5352 | 0x55) {
            bail!(FormatError::InvalidSignature("TIFF"));
        }

        let mut tree = Self {
            ifds: vec![TiffIfd::new(Links::default(), endianness)],
            ifd_ranges: NORangesSet::new(),
        };

        let mut next = bs.get_u32()?;

        while next != 0 {
            let id = tree.parse_ifd(bs, next, tree.root())?;
            next = tree.ifd(id).next_ifd;
        }

        Ok(tree)
    }

    /// Parse only the IFD at `offset`, ignoring its next-IFD pointer.
    ///
    /// Used for embedded TIFF data whose header or IFD chain is known to be broken.
    pub fn parse_single_ifd(buffer: Buffer<'a>, endianness: Endianness, offset: u32) -> Result<Self> {
        let bs = ByteStream::new(buffer, endianness);
        let mut tree = Self {
            ifds: vec![TiffIfd::new(Links::default(), endianness)],
            ifd_ranges: NORangesSet::new(),
        };
        tree.parse_ifd(bs, offset, tree.root())?;

        Ok(tree)
    }

    /// Check whether the data looks like a TIFF file.
    pub fn is_tiff(data: &[u8]) -> bool {
        matches!(data.get(..4), Some(b"II*\0" | b"MM\0*" | b"IIRO" | b"IIRS" | b"IIU\0"))
    }

    /// The virtual root.
    pub fn root(&self) -> IfdId {
        IfdId(0)
    }

    /// Get an IFD by its handle.
    pub fn ifd(&self, id: IfdId) -> &TiffIfd<'a> {
        &self.ifds[id.0]
    }

    /// The number of IFDs, including the virtual root.
    pub fn len(&self) -> usize {
        self.ifds.len()
    }

    /// Whether the tree contains no IFDs besides the virtual root.
    pub fn is_empty(&self) -> bool {
        self.ifds.len() == 1
    }

    /// Find an entry in the IFD or, depth-first, in its sub-IFDs.
    pub fn get_entry_recursive(&self, id: IfdId, tag: u16) -> Option<&TiffEntry<'a>> {
        let ifd = self.ifd(id);

        ifd.find_entry(tag)
            .or_else(|| ifd.sub_ifds().find_map(|c| self.get_entry_recursive(c, tag)))
    }

    /// Whether any IFD contains the tag.
    pub fn has_entry_recursive(&self, tag: u16) -> bool {
        self.get_entry_recursive(self.root(), tag).is_some()
    }

    /// All IFDs that directly contain the tag, in depth-first order.
    pub fn get_ifds_with_tag(&self, tag: u16) -> Vec<IfdId> {
        let mut found = Vec::new();
        self.collect_with_tag(self.root(), tag, &mut found);

        found
    }

    fn collect_with_tag(&self, id: IfdId, tag: u16, found: &mut Vec<IfdId>) {
        let ifd = self.ifd(id);

        if ifd.has_entry(tag) {
            found.push(id);
        }

        for child in ifd.sub_ifds() {
            self.collect_with_tag(child, tag, found);
        }
    }

    /// The `index`-th IFD that contains the tag.
    pub fn get_ifd_with_tag(&self, tag: u16, index: usize) -> Result<IfdId> {
        self.get_ifds_with_tag(tag)
            .get(index)
            .copied()
            .ok_or_else(|| FormatError::MissingEntry { tag }.into())
    }

    /// The make and model of the camera, with surrounding whitespace removed.
    pub fn get_id(&self) -> Result<TiffId> {
        let find = |tag| -> Result<String> {
            let entry = self
                .get_entry_recursive(self.root(), tag)
                .ok_or(FormatError::MissingEntry { tag })?;

            Ok(entry.get_string()?.trim().to_string())
        };

        Ok(TiffId {
            make: find(tags::MAKE)?,
            model: find(tags::MODEL)?,
        })
    }

    /// Add an entry to an IFD, replacing an existing entry with the same tag.
    pub fn add_entry(&mut self, id: IfdId, entry: TiffEntry<'a>) {
        self.ifds[id.0].entries.insert(entry.tag(), entry);
    }

    /// Parse the IFD at `offset` of `bs` and attach it to `parent`.
    ///
    /// On failure, everything attached while parsing it is removed again.
    fn parse_ifd(&mut self, bs: ByteStream<'a>, offset: u32, parent: IfdId) -> Result<IfdId> {
        let links = tree::new_child_links(&self.ifds, parent.0)?;
        let mark = self.ifds.len();
        let saved_ranges = self.ifd_ranges.clone();
        let id = IfdId(tree::attach(
            &mut self.ifds,
            TiffIfd::new(links, bs.endianness()),
        ));

        match self.parse_ifd_entries(id, bs, offset) {
            Ok(()) => Ok(id),
            Err(e) => {
                tree::truncate(&mut self.ifds, mark);
                self.ifd_ranges = saved_ranges;

                Err(e)
            }
        }
    }

    fn parse_ifd_entries(&mut self, id: IfdId, mut bs: ByteStream<'a>, offset: u32) -> Result<()> {
        bs.set_position(offset)?;

        let num_entries = bs.get_u16()? as u32;
        let ifd_size = 2 + num_entries * 12 + 4;
        bs.check(ifd_size - 2)?;

        if !self.ifd_ranges.insert(bs.range_at(offset, ifd_size)) {
            bail!(FormatError::Overlap("IFDs"));
        }

        let mut entry_ranges = NORangesSet::new();

        for i in 0..num_entries {
            let entry = match TiffEntry::parse(&mut bs) {
                Ok(entry) => entry,
                Err(e) => {
                    ldebug!("skipping unparsable entry {} of IFD at {}: {}", i, offset, e);
                    bs.set_position(offset + 2 + (i + 1) * 12)?;

                    continue;
                }
            };

            if let Some(range) = entry.out_of_line_range()
                && !entry_ranges.insert(range)
            {
                bail!(FormatError::Overlap("entries"));
            }

            self.add_parsed_entry(id, bs, entry)?;
        }

        self.ifds[id.0].next_ifd = bs.get_u32()?;

        Ok(())
    }

    fn add_parsed_entry(&mut self, id: IfdId, bs: ByteStream<'a>, entry: TiffEntry<'a>) -> Result<()> {
        let result = match entry.tag() {
            tags::DNGPRIVATEDATA => self.parse_dng_private_data(id, &entry),
            tags::MAKERNOTE | tags::MAKERNOTE_ALT => self.parse_maker_note(id, &entry),
            tag if tags::SUB_IFD_TAGS.contains(&tag) => self.parse_sub_ifds(id, bs, &entry),
            _ => Ok(()),
        };

        if let Err(e) = result {
            if e.is_structural() {
                return Err(e);
            }

            // Unparsable private data is kept as a plain entry.
            ldebug!("failed to parse sub-IFD of tag 0x{:x}: {}", entry.tag(), e);
        }

        self.add_entry(id, entry);

        Ok(())
    }

    fn parse_sub_ifds(&mut self, id: IfdId, bs: ByteStream<'a>, entry: &TiffEntry<'a>) -> Result<()> {
        for i in 0..entry.count() {
            let offset = entry.get_u32(i)?;
            self.parse_ifd(bs, offset, id)?;
        }

        Ok(())
    }
}
