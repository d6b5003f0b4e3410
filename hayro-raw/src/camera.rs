//! Camera descriptions provided by an external camera database.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::image::{BlackArea, ColorFilterArray, Point};

/// How well a camera is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupportStatus {
    /// The camera is known to work.
    #[default]
    Supported,
    /// The camera should work, but no sample files were tested.
    NoSamples,
    /// The camera is known not to work.
    Unsupported,
    /// Nothing is known about the camera.
    Unknown,
}

/// Black and white levels of the sensor, valid for a range of ISO speeds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SensorInfo {
    /// The black level.
    pub black_level: i32,
    /// The white level.
    pub white_level: i32,
    /// The lowest ISO speed, or 0 for no lower bound.
    pub min_iso: u32,
    /// The highest ISO speed, or 0 for no upper bound.
    pub max_iso: u32,
    /// Separate black levels for the cells of the CFA, if known.
    pub black_level_separate: Vec<i32>,
}

impl SensorInfo {
    /// Whether these levels are valid for `iso`.
    pub fn is_iso_within(&self, iso: u32) -> bool {
        let above = self.min_iso == 0 || iso >= self.min_iso;
        let below = self.max_iso == 0 || iso <= self.max_iso;

        above && below
    }

    /// Whether these levels apply to all ISO speeds.
    pub fn is_default(&self) -> bool {
        self.min_iso == 0 && self.max_iso == 0
    }
}

/// Free-form key/value overrides for a camera.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hints(BTreeMap<String, String>);

impl Hints {
    /// Create an empty set of hints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a hint.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Whether a hint is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The value of a hint.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The value of a hint parsed as `T`, or `default` if it is missing or malformed.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Hints {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Everything the camera database knows about one camera mode.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Camera {
    /// The make, as written by the camera.
    pub make: String,
    /// The model, as written by the camera.
    pub model: String,
    /// The mode, empty for the default mode.
    pub mode: String,
    /// How well the camera is supported.
    pub support: SupportStatus,
    /// The oldest decoder version that handles this camera correctly.
    pub decoder_version: u32,
    /// The top-left corner of the crop.
    pub crop_pos: Point,
    /// The size of the crop. Zero or negative values are relative to the right or bottom edge.
    pub crop_size: Point,
    /// Black and white levels by ISO speed.
    pub sensors: Vec<SensorInfo>,
    /// The color filter pattern.
    pub cfa: ColorFilterArray,
    /// Masked areas for black level measurement.
    pub black_areas: Vec<BlackArea>,
    /// Decoder hints.
    pub hints: Hints,
}

impl Camera {
    /// The sensor levels for `iso`.
    ///
    /// A single record is used for any ISO. Otherwise an ISO-specific record wins over a
    /// default one.
    pub fn sensor_info(&self, iso: u32) -> Option<&SensorInfo> {
        if let [only] = self.sensors.as_slice() {
            return Some(only);
        }

        let mut candidates = self.sensors.iter().filter(|s| s.is_iso_within(iso));
        let first = candidates.next()?;

        if !first.is_default() {
            return Some(first);
        }

        Some(candidates.find(|s| !s.is_default()).unwrap_or(first))
    }
}

/// A camera database.
pub trait CameraMetadata {
    /// Look up a camera by its make, model and mode.
    fn get_camera(&self, make: &str, model: &str, mode: &str) -> Option<&Camera>;
}

impl CameraMetadata for [Camera] {
    fn get_camera(&self, make: &str, model: &str, mode: &str) -> Option<&Camera> {
        self.iter()
            .find(|c| c.make == make && c.model == model && c.mode == mode)
    }
}

impl CameraMetadata for Vec<Camera> {
    fn get_camera(&self, make: &str, model: &str, mode: &str) -> Option<&Camera> {
        self.as_slice().get_camera(make, model, mode)
    }
}
