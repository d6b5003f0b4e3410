//! TIFF tag numbers.

#![allow(missing_docs, reason = "tag names are self-describing")]

pub const MAKERNOTE_ALT: u16 = 0x002e;
pub const CANON_SENSOR_INFO: u16 = 0x00e0;
pub const NEWSUBFILETYPE: u16 = 0x00fe;
pub const IMAGEWIDTH: u16 = 0x0100;
pub const IMAGELENGTH: u16 = 0x0101;
pub const BITSPERSAMPLE: u16 = 0x0102;
pub const COMPRESSION: u16 = 0x0103;
pub const PHOTOMETRICINTERPRETATION: u16 = 0x0106;
pub const FILLORDER: u16 = 0x010a;
pub const MAKE: u16 = 0x010f;
pub const MODEL: u16 = 0x0110;
pub const STRIPOFFSETS: u16 = 0x0111;
pub const ORIENTATION: u16 = 0x0112;
pub const SAMPLESPERPIXEL: u16 = 0x0115;
pub const ROWSPERSTRIP: u16 = 0x0116;
pub const STRIPBYTECOUNTS: u16 = 0x0117;
pub const PLANARCONFIGURATION: u16 = 0x011c;
pub const SOFTWARE: u16 = 0x0131;
pub const PREDICTOR: u16 = 0x013d;
pub const TILEWIDTH: u16 = 0x0142;
pub const TILELENGTH: u16 = 0x0143;
pub const TILEOFFSETS: u16 = 0x0144;
pub const TILEBYTECOUNTS: u16 = 0x0145;
pub const SUBIFDS: u16 = 0x014a;
pub const SAMPLEFORMAT: u16 = 0x0153;
pub const CANONCOLORDATA: u16 = 0x4001;
pub const CFAREPEATPATTERNDIM: u16 = 0x828d;
pub const CFAPATTERN: u16 = 0x828e;
pub const KODAK_IFD: u16 = 0x8290;
pub const EXIFIFDPOINTER: u16 = 0x8769;
pub const ISOSPEEDRATINGS: u16 = 0x8827;
pub const RECOMMENDEDEXPOSUREINDEX: u16 = 0x8832;
pub const MAKERNOTE: u16 = 0x927c;
pub const DNGVERSION: u16 = 0xc612;
pub const CFAPLANECOLOR: u16 = 0xc616;
pub const CFALAYOUT: u16 = 0xc617;
pub const LINEARIZATIONTABLE: u16 = 0xc618;
pub const BLACKLEVELREPEATDIM: u16 = 0xc619;
pub const BLACKLEVEL: u16 = 0xc61a;
pub const WHITELEVEL: u16 = 0xc61d;
pub const DEFAULTCROPORIGIN: u16 = 0xc61f;
pub const DEFAULTCROPSIZE: u16 = 0xc620;
pub const ASSHOTNEUTRAL: u16 = 0xc628;
pub const DNGPRIVATEDATA: u16 = 0xc634;
pub const CANONCR2SLICE: u16 = 0xc640;
pub const ACTIVEAREA: u16 = 0xc68d;
pub const MASKEDAREAS: u16 = 0xc68e;
pub const CANON_SRAWTYPE: u16 = 0xc6c5;
pub const FUJI_RAW_IFD: u16 = 0xf000;
pub const KODAK_IFD2: u16 = 0xfe00;

/// Tags whose data is a list of offsets of sub-IFDs.
pub(crate) const SUB_IFD_TAGS: [u16; 5] = [SUBIFDS, EXIFIFDPOINTER, FUJI_RAW_IFD, KODAK_IFD, KODAK_IFD2];

/// Tags whose data stays addressable relative to the whole enclosing stream.
pub(crate) const OFFSET_TAGS: [u16; 8] = [
    DNGPRIVATEDATA,
    MAKERNOTE,
    MAKERNOTE_ALT,
    SUBIFDS,
    EXIFIFDPOINTER,
    FUJI_RAW_IFD,
    KODAK_IFD,
    KODAK_IFD2,
];
