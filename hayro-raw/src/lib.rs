/*!
A memory-safe, pure-Rust decoder for camera raw images.

`hayro-raw` reads the sensor data of raw files written by digital cameras: TIFF-based
formats including DNG, Canon CRW and CR3, Minolta MRW and Sigma X3F. The result is the
undemosaiced sensor image together with the metadata needed to develop it, such as the
color filter pattern, black and white levels, the crop and the white balance.

Camera-specific knowledge is not built in. It is supplied by the caller through the
[`CameraMetadata`] trait, usually backed by a camera database.

# Example
```rust,no_run
use hayro_raw::{Camera, DecodeSettings, decode};

let data = std::fs::read("image.dng").unwrap();
let cameras: Vec<Camera> = Vec::new();
let decoded = decode(&data, &cameras, &DecodeSettings::default()).unwrap();

println!("{:?} image with {} warnings", decoded.image.dim(), decoded.warnings.len());
```

# Safety
This crate forbids unsafe code via a crate-level attribute. All reads from the input are
bounds-checked, and container parsers limit nesting so that hostile files are rejected
instead of exhausting memory or the stack.

# Cargo features
- `image` (default): conversion of decoded images into `image` crate buffers.
- `logging`: emit debug and trace messages via the `log` crate.
*/

#![forbid(unsafe_code)]

pub mod bits;
pub mod bmff;
pub mod buffer;
pub mod camera;
pub mod ciff;
pub mod cursor;
pub mod decoder;
pub mod decompress;
pub mod error;
pub mod huffman;
pub mod image;
pub mod mrw;
pub mod ranges;
pub mod scheduler;
pub mod tiff;
pub mod x3f;

mod log;
mod tree;
mod util;

#[cfg(test)]
mod testutil;

pub use buffer::{Buffer, Endianness, OwnedBuffer};
pub use camera::{Camera, CameraMetadata, Hints, SensorInfo, SupportStatus};
pub use decoder::{DecodeSettings, DecodedRaw, FileError, FileLoader, RawDecoder, decode};
pub use error::{DecodeError, DecodingError, FormatError, IoError, Result, UnsupportedError};
pub use image::{ImageMetadata, RawImage, RawImageType};
