//! CIFF heaps, the container of Canon CRW files.
//!
//! A CIFF file is a small header followed by a root heap. Each heap stores its value data
//! first, followed by a directory of 10-byte records and, in its last four bytes, the size of
//! the value data. Records of the two heap types contain nested heaps.

mod entry;
pub mod tags;

use std::collections::BTreeMap;

pub use entry::{CiffDataType, CiffEntry};

use crate::buffer::{Buffer, Endianness};
use crate::cursor::ByteStream;
use crate::error::{FormatError, Result, bail};
use crate::log::ldebug;
use crate::ranges::NORangesSet;
use crate::tree::{self, Links, Node};

const RECORD_SIZE: u32 = 10;

/// A handle to a heap in a [`CiffTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CiffId(usize);

/// A single heap.
#[derive(Debug, Clone)]
pub struct CiffIfd<'a> {
    links: Links,
    entries: BTreeMap<u16, CiffEntry<'a>>,
}

impl Node for CiffIfd<'_> {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

impl<'a> CiffIfd<'a> {
    fn new(links: Links) -> Self {
        Self {
            links,
            entries: BTreeMap::new(),
        }
    }

    /// Get the entry with the given tag.
    pub fn get_entry(&self, tag: u16) -> Result<&CiffEntry<'a>> {
        self.entries
            .get(&tag)
            .ok_or_else(|| FormatError::MissingEntry { tag }.into())
    }

    /// Get the entry with the given tag, if present.
    pub fn find_entry(&self, tag: u16) -> Option<&CiffEntry<'a>> {
        self.entries.get(&tag)
    }

    /// Whether the heap has an entry with the given tag.
    pub fn has_entry(&self, tag: u16) -> bool {
        self.entries.contains_key(&tag)
    }

    /// All entries, ordered by tag.
    pub fn entries(&self) -> impl Iterator<Item = &CiffEntry<'a>> {
        self.entries.values()
    }

    /// The depth below the root heap.
    pub fn depth(&self) -> u32 {
        self.links.depth
    }

    /// The parent heap.
    pub fn parent(&self) -> Option<CiffId> {
        self.links.parent.map(CiffId)
    }

    /// The nested heaps, in parse order.
    pub fn sub_ifds(&self) -> impl Iterator<Item = CiffId> + '_ {
        self.links.children.iter().copied().map(CiffId)
    }
}

/// A parsed CIFF file.
#[derive(Debug, Clone)]
pub struct CiffTree<'a> {
    ifds: Vec<CiffIfd<'a>>,
}

impl<'a> CiffTree<'a> {
    /// Parse a CIFF file.
    pub fn parse(buffer: Buffer<'a>) -> Result<Self> {
        if !Self::is_ciff(buffer.data()) {
            bail!(FormatError::InvalidSignature("CIFF"));
        }

        let mut bs = ByteStream::new(buffer, Endianness::Little);
        bs.skip_bytes(2)?;
        let header_len = bs.get_u32()?;
        let root = bs.get_sub_stream_from(header_len)?;

        let mut tree = Self {
            ifds: vec![CiffIfd::new(Links::default())],
        };
        tree.parse_heap(tree.root(), root)?;

        Ok(tree)
    }

    /// Check whether the data looks like a CIFF file.
    pub fn is_ciff(data: &[u8]) -> bool {
        data.starts_with(b"II") && data.get(6..14) == Some(b"HEAPCCDR")
    }

    /// The root heap.
    pub fn root(&self) -> CiffId {
        CiffId(0)
    }

    /// Get a heap by its handle.
    pub fn ifd(&self, id: CiffId) -> &CiffIfd<'a> {
        &self.ifds[id.0]
    }

    /// The number of heaps, including the root.
    pub fn len(&self) -> usize {
        self.ifds.len()
    }

    /// Whether the root heap has no nested heaps and no entries.
    pub fn is_empty(&self) -> bool {
        self.ifds.len() == 1 && self.ifds[0].entries.is_empty()
    }

    /// Find an entry in the heap or, depth-first, in its nested heaps.
    pub fn get_entry_recursive(&self, id: CiffId, tag: u16) -> Option<&CiffEntry<'a>> {
        self.get_entry_recursive_where(id, tag, |_| true)
    }

    /// Find the first entry with the tag that satisfies `pred`.
    pub fn get_entry_recursive_where(
        &self,
        id: CiffId,
        tag: u16,
        pred: impl Fn(&CiffEntry<'a>) -> bool + Copy,
    ) -> Option<&CiffEntry<'a>> {
        let ifd = self.ifd(id);

        ifd.find_entry(tag).filter(|e| pred(*e)).or_else(|| {
            ifd.sub_ifds()
                .find_map(|c| self.get_entry_recursive_where(c, tag, pred))
        })
    }

    /// Whether any heap contains the tag.
    pub fn has_entry_recursive(&self, tag: u16) -> bool {
        self.get_entry_recursive(self.root(), tag).is_some()
    }

    /// All heaps that directly contain the tag, in depth-first order.
    pub fn get_ifds_with_tag(&self, tag: u16) -> Vec<CiffId> {
        self.get_ifds_with_tag_where(tag, |_| true)
    }

    /// All heaps whose entry with the tag satisfies `pred`, in depth-first order.
    pub fn get_ifds_with_tag_where(
        &self,
        tag: u16,
        pred: impl Fn(&CiffEntry<'a>) -> bool + Copy,
    ) -> Vec<CiffId> {
        let mut found = Vec::new();
        self.collect_with_tag(self.root(), tag, pred, &mut found);

        found
    }

    fn collect_with_tag(
        &self,
        id: CiffId,
        tag: u16,
        pred: impl Fn(&CiffEntry<'a>) -> bool + Copy,
        found: &mut Vec<CiffId>,
    ) {
        let ifd = self.ifd(id);

        if ifd.find_entry(tag).is_some_and(pred) {
            found.push(id);
        }

        for child in ifd.sub_ifds() {
            self.collect_with_tag(child, tag, pred, found);
        }
    }

    fn parse_heap(&mut self, id: CiffId, heap: ByteStream<'a>) -> Result<()> {
        let size_pos = heap
            .size()
            .checked_sub(4)
            .ok_or(FormatError::Corrupt("CIFF heap is too small"))?;
        let value_size = heap.buffer().read_u32(size_pos, Endianness::Little)?;
        let value_data = heap.get_sub_stream(0, value_size)?;

        let mut dir = heap;
        dir.set_position(value_size)?;
        let count = dir.get_u16()? as u32;

        let mut value_ranges = NORangesSet::new();

        for i in 0..count {
            if dir.remain_size() < RECORD_SIZE {
                ldebug!("CIFF heap directory is truncated after {} entries", i);
                break;
            }

            let entry = match CiffEntry::parse(&mut dir, value_data) {
                Ok(entry) => entry,
                Err(e) => {
                    ldebug!("skipping unparsable CIFF entry {}: {}", i, e);
                    dir.set_position(value_size + 2 + (i + 1) * RECORD_SIZE)?;

                    continue;
                }
            };

            if let Some(range) = entry.value_range()
                && !value_ranges.insert(range)
            {
                bail!(FormatError::Overlap("CIFF value data ranges"));
            }

            if entry.ty().is_heap() {
                match self.parse_sub_heap(id, entry.get_data()) {
                    Ok(()) => continue,
                    Err(e) if e.is_structural() => return Err(e),
                    Err(e) => {
                        // Unparsable heaps are kept as plain entries.
                        ldebug!("failed to parse nested heap 0x{:x}: {}", entry.tag(), e);
                    }
                }
            }

            self.ifds[id.0].entries.insert(entry.tag(), entry);
        }

        Ok(())
    }

    fn parse_sub_heap(&mut self, parent: CiffId, heap: ByteStream<'a>) -> Result<()> {
        let links = tree::new_child_links(&self.ifds, parent.0)?;
        let mark = self.ifds.len();
        let id = CiffId(tree::attach(&mut self.ifds, CiffIfd::new(links)));

        self.parse_heap(id, heap).inspect_err(|_| {
            tree::truncate(&mut self.ifds, mark);
        })
    }
}
