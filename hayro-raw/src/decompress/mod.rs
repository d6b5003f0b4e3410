//! The pixel codecs.
//!
//! Each decompressor reads from a [`ByteStream`](crate::cursor::ByteStream) and writes into
//! a [`RawImage`](crate::image::RawImage), either directly or by returning
//! [`DecodedTile`](crate::scheduler::DecodedTile)s that the caller places into the image.

pub mod cr2;
pub mod crw;
pub mod crx;
pub mod deflate;
pub mod jpeg;
pub mod ljpeg;
pub mod sigma;
pub mod uncompressed;

pub use cr2::{Cr2Decompressor, Cr2Slices};
pub use crw::CrwDecompressor;
pub use crx::CrxDecompressor;
pub use deflate::DeflateDecompressor;
pub use jpeg::JpegDecompressor;
pub use ljpeg::{FrameHeader, LJpegDecompressor};
pub use sigma::SigmaDecompressor;
pub use uncompressed::{BitPacking, Packed12, TRUNCATED, UncompressedDecompressor};
