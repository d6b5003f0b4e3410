//! CIFF tag numbers.
//!
//! The upper bits of a CIFF tag encode the data type, so every tag below implies its type.

#![allow(missing_docs, reason = "tag names are self-describing")]

pub const COLORINFO1: u16 = 0x0032;
pub const MAKEMODEL: u16 = 0x080a;
pub const SHOTINFO: u16 = 0x102a;
pub const COLORINFO2: u16 = 0x102c;
pub const SENSORINFO: u16 = 0x1031;
pub const WHITEBALANCE: u16 = 0x10a9;
pub const IMAGEINFO: u16 = 0x1810;
pub const DECODERTABLE: u16 = 0x1835;
pub const RAWDATA: u16 = 0x2005;
pub const SUBIFD: u16 = 0x300a;
pub const EXIF: u16 = 0x300b;
