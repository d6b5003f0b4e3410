//! Maker notes and DNG private data.
//!
//! Maker notes are vendor IFDs hidden in the `MAKERNOTE` entry. Most vendors prefix them
//! with a magic string that determines where the IFD starts, which byte order it uses and
//! whether its offsets are relative to the note or to the file.

use crate::buffer::Endianness;
use crate::cursor::ByteStream;
use crate::error::{FormatError, Result, bail};
use crate::log::ltrace;
use crate::tiff::{IfdId, TiffEntry, TiffTree, tags};

/// How to find the IFD inside a maker note.
struct Recipe {
    /// Make offsets relative to the start of the note.
    rebase: bool,
    /// Where the IFD starts, relative to the start of the note.
    ifd_start: u32,
    /// Where an `II`/`MM` marker is found, relative to the start of the note.
    byte_order_at: Option<u32>,
}

impl Recipe {
    const fn new(rebase: bool, ifd_start: u32, byte_order_at: Option<u32>) -> Self {
        Self {
            rebase,
            ifd_start,
            byte_order_at,
        }
    }

    fn apply<'a>(&self, mut bs: ByteStream<'a>) -> Result<ByteStream<'a>> {
        if self.rebase {
            bs = bs.get_sub_stream_from(bs.position())?;
        }

        if let Some(at) = self.byte_order_at {
            let marker = bs.buffer().get(bs.position() + at, 2)?;
            let endianness = Endianness::from_marker([marker[0], marker[1]])
                .ok_or(FormatError::InvalidSignature("maker note byte order"))?;
            bs.set_endianness(endianness);
        }

        bs.skip_bytes(self.ifd_start)?;

        Ok(bs)
    }
}

impl<'a> TiffTree<'a> {
    /// Parse DNG private data that wraps the original maker note.
    ///
    /// The layout is `Adobe\0`, `MakN`, a big-endian size, the original byte order marker,
    /// the original file offset of the note and finally the note itself.
    pub(super) fn parse_dng_private_data(
        &mut self,
        parent: IfdId,
        entry: &TiffEntry<'a>,
    ) -> Result<()> {
        let origin = entry
            .origin()
            .ok_or(FormatError::Corrupt("entry is not backed by file data"))?;
        let mut bs = origin.get_sub_stream(origin.position(), entry.data().len() as u32)?;

        if !bs.skip_prefix(b"Adobe\0") {
            bail!(FormatError::InvalidSignature("DNG private data"));
        }

        if !bs.skip_prefix(b"MakN") {
            bail!(FormatError::InvalidSignature("DNG maker note"));
        }

        bs.set_endianness(Endianness::Big);
        let size = bs.get_u32()?;

        if size > bs.remain_size() {
            bail!(FormatError::Corrupt("invalid DNG maker note size"));
        }

        let endianness = bs.get_byte_order_marker()?;
        bs.set_endianness(endianness);
        let original_offset = bs.get_u32()?;

        // The size includes the byte order marker and the offset.
        let size = size
            .checked_sub(6)
            .ok_or(FormatError::Corrupt("invalid DNG maker note size"))?;

        let note = bs.rebase(original_offset, size)?;

        self.parse_maker_note_stream(parent, note)
    }

    pub(super) fn parse_maker_note(&mut self, parent: IfdId, entry: &TiffEntry<'a>) -> Result<()> {
        let origin = entry
            .origin()
            .ok_or(FormatError::Corrupt("entry is not backed by file data"))?;

        self.parse_maker_note_stream(parent, origin)
    }

    fn parse_maker_note_stream(&mut self, parent: IfdId, mut bs: ByteStream<'a>) -> Result<()> {
        let make = self.find_make(parent);

        let recipe = if bs.has_prefix(b"AOC\0") {
            Some(Recipe::new(false, 6, Some(4)))
        } else if bs.has_prefix(b"PENTAX") {
            Some(Recipe::new(true, 10, Some(8)))
        } else if bs.has_prefix(b"FUJIFILM\x0c\0\0\0") {
            bs.set_endianness(Endianness::Little);
            Some(Recipe::new(true, 12, None))
        } else if bs.has_prefix(b"Nikon\0\x02") {
            bs.skip_bytes(10)?;
            Some(Recipe::new(true, 8, Some(0)))
        } else if bs.has_prefix(b"OLYMPUS") {
            Some(Recipe::new(true, 12, None))
        } else if bs.has_prefix(b"OLYMP") {
            Some(Recipe::new(true, 8, None))
        } else if bs.has_prefix(b"EPSON") {
            Some(Recipe::new(false, 8, None))
        } else if bs.has_pattern_at(b"Exif", 6) {
            // A complete TIFF header follows at offset 12, but offsets are file-relative.
            Some(Recipe::new(false, 20, Some(12)))
        } else if make == "SAMSUNG" {
            // No identification at all, the IFD starts right away.
            Some(Recipe::new(true, 0, None))
        } else {
            None
        };

        let bs = match recipe {
            Some(recipe) => recipe.apply(bs)?,
            None => {
                ltrace!("no maker note prefix found for make '{}'", make);

                if bs.skip_prefix(b"II") {
                    bs.set_endianness(Endianness::Little);
                } else if bs.skip_prefix(b"MM") {
                    bs.set_endianness(Endianness::Big);
                }

                bs
            }
        };

        self.parse_ifd(bs, bs.position(), parent)?;

        Ok(())
    }

    /// Look for the `MAKE` entry in `id` and its subtree, then in each ancestor.
    fn find_make(&self, id: IfdId) -> String {
        let mut cur = Some(id);

        while let Some(ifd) = cur {
            if let Some(entry) = self.get_entry_recursive(ifd, tags::MAKE) {
                return entry
                    .get_string()
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
            }

            cur = self.ifd(ifd).parent();
        }

        String::new()
    }
}
