//! Raw pixel buffers and bounds-checked 2D views into them.

use core::ops::Range;
use std::sync::{Mutex, PoisonError};

use crate::error::{DecodingError, Result, bail};
use crate::log::{ldebug, lwarn};
use crate::util::round_up;

/// A point or a size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    /// The horizontal component.
    pub x: i32,
    /// The vertical component.
    pub y: i32,
}

impl Point {
    /// Create a new point.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The area of a size, or 0 if it is negative.
    pub fn area(&self) -> u64 {
        if self.x <= 0 || self.y <= 0 {
            return 0;
        }

        self.x as u64 * self.y as u64
    }
}

/// An axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// The top-left corner.
    pub pos: Point,
    /// The size.
    pub dim: Point,
}

impl Rect {
    /// Create a new rectangle.
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            pos: Point::new(x, y),
            dim: Point::new(width, height),
        }
    }

    /// One past the right-most column.
    pub fn right(&self) -> i64 {
        self.pos.x as i64 + self.dim.x as i64
    }

    /// One past the bottom row.
    pub fn bottom(&self) -> i64 {
        self.pos.y as i64 + self.dim.y as i64
    }

    /// Whether the rectangle covers at least one pixel.
    pub fn has_positive_area(&self) -> bool {
        self.dim.x > 0 && self.dim.y > 0
    }

    /// Whether the rectangle lies completely inside `outer`.
    pub fn is_inside(&self, outer: &Self) -> bool {
        self.pos.x >= outer.pos.x
            && self.pos.y >= outer.pos.y
            && self.right() <= outer.right()
            && self.bottom() <= outer.bottom()
    }
}

/// The color of a single cell of a color filter array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs, reason = "color names are self-describing")]
pub enum CfaColor {
    Red,
    Green,
    Blue,
    Cyan,
    Magenta,
    Yellow,
    White,
    FujiGreen,
    #[default]
    Unknown,
}

impl CfaColor {
    /// Map a DNG `CFAPATTERN` value.
    pub fn from_dng(value: u8) -> Self {
        match value {
            0 => Self::Red,
            1 => Self::Green,
            2 => Self::Blue,
            3 => Self::Cyan,
            4 => Self::Magenta,
            5 => Self::Yellow,
            6 => Self::White,
            _ => Self::Unknown,
        }
    }
}

/// A repeating color filter pattern.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColorFilterArray {
    width: u32,
    height: u32,
    colors: Vec<CfaColor>,
}

impl ColorFilterArray {
    /// Create a pattern of the given size with all cells unknown.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            colors: vec![CfaColor::Unknown; (width * height) as usize],
        }
    }

    /// Create a pattern from its cells in row-major order.
    pub fn from_colors(width: u32, height: u32, colors: &[CfaColor]) -> Result<Self> {
        if colors.len() != (width * height) as usize {
            bail!(DecodingError::Corrupt("CFA pattern does not match its size"));
        }

        Ok(Self {
            width,
            height,
            colors: colors.to_vec(),
        })
    }

    /// The most common 2x2 Bayer pattern.
    pub fn rggb() -> Self {
        Self {
            width: 2,
            height: 2,
            colors: vec![CfaColor::Red, CfaColor::Green, CfaColor::Green, CfaColor::Blue],
        }
    }

    /// The width and height of the pattern.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether the pattern has no cells.
    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// The color at a pixel position. The pattern repeats in both directions.
    pub fn color_at(&self, x: u32, y: u32) -> CfaColor {
        if self.is_empty() {
            return CfaColor::Unknown;
        }

        self.colors[((y % self.height) * self.width + x % self.width) as usize]
    }

    /// Set the color of a cell.
    pub fn set_color_at(&mut self, x: u32, y: u32, color: CfaColor) {
        if x < self.width && y < self.height {
            self.colors[(y * self.width + x) as usize] = color;
        }
    }

    /// The pattern as seen from a window starting at `(dx, dy)`.
    pub fn shifted(&self, dx: u32, dy: u32) -> Self {
        let mut out = Self::new(self.width, self.height);

        for y in 0..self.height {
            for x in 0..self.width {
                out.set_color_at(x, y, self.color_at(x + dx, y + dy));
            }
        }

        out
    }
}

/// A masked sensor area used to measure the black level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlackArea {
    /// The first column (vertical areas) or row.
    pub offset: u32,
    /// The number of columns or rows.
    pub size: u32,
    /// Whether the area spans the full image height.
    pub is_vertical: bool,
}

/// Camera and exposure metadata of a decoded image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    /// The camera make.
    pub make: String,
    /// The camera model.
    pub model: String,
    /// The camera mode, for cameras with several raw formats.
    pub mode: String,
    /// The ISO speed, `0` if unknown.
    pub iso_speed: u32,
    /// White balance multipliers for R, G, B and a fourth color.
    pub wb_coeffs: Option<[f32; 4]>,
    /// A single black level.
    pub black_level: Option<i32>,
    /// Black levels of the four cells of a 2x2 pattern.
    pub black_level_separate: Option<[i32; 4]>,
    /// The white level.
    pub white_point: Option<u32>,
    /// The color filter pattern, relative to the crop origin.
    pub cfa: ColorFilterArray,
    /// Masked areas for black level measurement.
    pub black_areas: Vec<BlackArea>,
    /// The width of a pixel relative to its height.
    pub pixel_aspect_ratio: f64,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        Self {
            make: String::new(),
            model: String::new(),
            mode: String::new(),
            iso_speed: 0,
            wb_coeffs: None,
            black_level: None,
            black_level_separate: None,
            white_point: None,
            cfa: ColorFilterArray::default(),
            black_areas: Vec::new(),
            pixel_aspect_ratio: 1.0,
        }
    }
}

/// The sample type of a raw image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawImageType {
    /// Unsigned 16-bit integers.
    U16,
    /// 32-bit floats.
    F32,
}

#[derive(Debug)]
enum PixelData {
    Unallocated,
    U16(Vec<u16>),
    F32(Vec<f32>),
}

/// A sample type that can be stored in a [`RawImage`].
pub trait Sample: Copy + Default + Send + Sync + 'static {
    /// The matching image type.
    const TYPE: RawImageType;

    /// The samples of the image, if it stores this type.
    fn pixels(image: &RawImage) -> Option<&[Self]>;

    /// The samples of the image, if it stores this type.
    fn pixels_mut(image: &mut RawImage) -> Option<&mut [Self]>;
}

impl Sample for u16 {
    const TYPE: RawImageType = RawImageType::U16;

    fn pixels(image: &RawImage) -> Option<&[Self]> {
        match &image.data {
            PixelData::U16(data) => Some(data),
            _ => None,
        }
    }

    fn pixels_mut(image: &mut RawImage) -> Option<&mut [Self]> {
        match &mut image.data {
            PixelData::U16(data) => Some(data),
            _ => None,
        }
    }
}

impl Sample for f32 {
    const TYPE: RawImageType = RawImageType::F32;

    fn pixels(image: &RawImage) -> Option<&[Self]> {
        match &image.data {
            PixelData::F32(data) => Some(data),
            _ => None,
        }
    }

    fn pixels_mut(image: &mut RawImage) -> Option<&mut [Self]> {
        match &mut image.data {
            PixelData::F32(data) => Some(data),
            _ => None,
        }
    }
}

/// A decoded raw image.
///
/// The pixel data is allocated once with [`RawImage::create_data`]. Rows are padded so that
/// each row starts at a multiple of 16 bytes. Cropping only moves a window over the data.
#[derive(Debug)]
pub struct RawImage {
    ty: RawImageType,
    dim: Point,
    cpp: u32,
    pitch: usize,
    crop: Rect,
    data: PixelData,
    errors: Mutex<Vec<String>>,
    /// Metadata collected while decoding.
    pub metadata: ImageMetadata,
}

impl RawImage {
    /// Create an unallocated image of the given sample type.
    pub fn new(ty: RawImageType) -> Self {
        Self {
            ty,
            dim: Point::default(),
            cpp: 1,
            pitch: 0,
            crop: Rect::default(),
            data: PixelData::Unallocated,
            errors: Mutex::new(Vec::new()),
            metadata: ImageMetadata::default(),
        }
    }

    /// Set the uncropped size. Only possible before allocation.
    pub fn set_dim(&mut self, dim: Point) -> Result<()> {
        if self.is_allocated() {
            bail!(DecodingError::AlreadyAllocated);
        }

        self.dim = dim;

        Ok(())
    }

    /// Set the number of components per pixel. Only possible before allocation.
    pub fn set_cpp(&mut self, cpp: u32) -> Result<()> {
        if self.is_allocated() {
            bail!(DecodingError::AlreadyAllocated);
        }

        self.cpp = cpp;

        Ok(())
    }

    /// Allocate the pixel data for the current size.
    pub fn create_data(&mut self, max_dimension: u32) -> Result<()> {
        if self.is_allocated() {
            bail!(DecodingError::AlreadyAllocated);
        }

        let invalid = DecodingError::InvalidDimensions {
            width: self.dim.x.max(0) as u32,
            height: self.dim.y.max(0) as u32,
        };

        if self.dim.x <= 0
            || self.dim.y <= 0
            || self.dim.x as u32 > max_dimension
            || self.dim.y as u32 > max_dimension
            || !(1..=4).contains(&self.cpp)
        {
            bail!(invalid);
        }

        let row = self.dim.x as usize * self.cpp as usize;
        let height = self.dim.y as usize;

        self.data = match self.ty {
            RawImageType::U16 => {
                self.pitch = round_up(row, 16 / size_of::<u16>());
                PixelData::U16(vec![0; self.pitch * height])
            }
            RawImageType::F32 => {
                self.pitch = round_up(row, 16 / size_of::<f32>());
                PixelData::F32(vec![0.0; self.pitch * height])
            }
        };
        self.crop = Rect::new(0, 0, self.dim.x, self.dim.y);

        Ok(())
    }

    /// Whether the pixel data has been allocated.
    pub fn is_allocated(&self) -> bool {
        !matches!(self.data, PixelData::Unallocated)
    }

    /// The sample type.
    pub fn data_type(&self) -> RawImageType {
        self.ty
    }

    /// The size of the crop window.
    pub fn dim(&self) -> Point {
        self.crop.dim
    }

    /// The size of the whole image.
    pub fn uncropped_dim(&self) -> Point {
        self.dim
    }

    /// The crop window, relative to the whole image.
    pub fn crop(&self) -> Rect {
        self.crop
    }

    /// The number of components per pixel.
    pub fn cpp(&self) -> u32 {
        self.cpp
    }

    /// The distance between rows, in samples.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// The whole image as a 2D view of samples.
    pub fn as_array2d<T: Sample>(&self) -> Result<Array2dRef<'_, T>> {
        let (width, height, pitch) = self.view_shape::<T>()?;
        let data = T::pixels(self).ok_or(DecodingError::NotAllocated)?;

        Array2dRef::new(data, width, height, pitch)
    }

    /// The whole image as a mutable 2D view of samples.
    pub fn as_array2d_mut<T: Sample>(&mut self) -> Result<Array2dMut<'_, T>> {
        let (width, height, pitch) = self.view_shape::<T>()?;
        let data = T::pixels_mut(self).ok_or(DecodingError::NotAllocated)?;

        Array2dMut::new(data, width, height, pitch)
    }

    /// The crop window as a 2D view of samples.
    pub fn cropped_array2d<T: Sample>(&self) -> Result<Array2dRef<'_, T>> {
        let cpp = self.cpp as usize;

        self.as_array2d::<T>()?.sub_view(
            self.crop.pos.x as usize * cpp,
            self.crop.pos.y as usize,
            self.crop.dim.x as usize * cpp,
            self.crop.dim.y as usize,
        )
    }

    fn view_shape<T: Sample>(&self) -> Result<(usize, usize, usize)> {
        if !self.is_allocated() {
            bail!(DecodingError::NotAllocated);
        }

        if T::TYPE != self.ty {
            bail!(DecodingError::Corrupt("wrong sample type"));
        }

        Ok((
            self.dim.x as usize * self.cpp as usize,
            self.dim.y as usize,
            self.pitch,
        ))
    }

    /// Narrow the crop window. `crop` is relative to the current window.
    ///
    /// Invalid windows are ignored with a warning. The CFA pattern is shifted so that it stays
    /// aligned with the new origin.
    pub fn sub_frame(&mut self, crop: Rect) {
        let current = Rect::new(0, 0, self.crop.dim.x, self.crop.dim.y);

        if !crop.has_positive_area() || !crop.is_inside(&current) {
            lwarn!("ignoring invalid crop {:?} of image with size {:?}", crop, self.crop.dim);

            return;
        }

        if !self.metadata.cfa.is_empty() {
            self.metadata.cfa = self
                .metadata
                .cfa
                .shifted(crop.pos.x as u32, crop.pos.y as u32);
        }

        self.crop = Rect::new(
            self.crop.pos.x + crop.pos.x,
            self.crop.pos.y + crop.pos.y,
            crop.dim.x,
            crop.dim.y,
        );
    }

    /// Fill an area of the whole image with `value`. The area is clipped to the image.
    pub fn clear_area<T: Sample>(&mut self, area: Rect, value: T) -> Result<()> {
        let cpp = self.cpp as usize;
        let whole = Rect::new(0, 0, self.dim.x, self.dim.y);
        let x0 = area.pos.x.max(0);
        let y0 = area.pos.y.max(0);
        let x1 = area.right().min(whole.right()) as i32;
        let y1 = area.bottom().min(whole.bottom()) as i32;

        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }

        let mut view = self.as_array2d_mut::<T>()?;

        for row in y0 as usize..y1 as usize {
            view.row_mut(row)[x0 as usize * cpp..x1 as usize * cpp].fill(value);
        }

        Ok(())
    }

    /// Measure the black level of each cell of a 2x2 pattern from the black areas.
    ///
    /// Horizontal areas span the columns of `active`, vertical areas its rows. Everything is
    /// clipped to the image. Returns `false` and changes nothing if some cell has no samples.
    pub fn measure_black_areas(&mut self, active: Rect) -> Result<bool> {
        if self.cpp != 1 || self.ty != RawImageType::U16 {
            return Ok(false);
        }

        let view = self.as_array2d::<u16>()?;
        let clip = |start: i64, len: i64, max: usize| -> Range<usize> {
            let end = (start + len).clamp(0, max as i64);

            start.clamp(0, end) as usize..end as usize
        };

        let mut sums = [0_u64; 4];
        let mut counts = [0_u64; 4];

        for area in &self.metadata.black_areas {
            let (offset, size) = (area.offset as i64, area.size as i64);
            let (rows, cols) = if area.is_vertical {
                (
                    clip(active.pos.y as i64, active.dim.y as i64, view.height()),
                    clip(offset, size, view.width()),
                )
            } else {
                (
                    clip(offset, size, view.height()),
                    clip(active.pos.x as i64, active.dim.x as i64, view.width()),
                )
            };

            for y in rows {
                let row = view.row(y);

                for x in cols.clone() {
                    let cell = (y & 1) * 2 + (x & 1);
                    sums[cell] += row[x] as u64;
                    counts[cell] += 1;
                }
            }
        }

        if counts.contains(&0) {
            return Ok(false);
        }

        let levels: [i32; 4] =
            core::array::from_fn(|i| (sums[i] as f64 / counts[i] as f64).round() as i32);
        ldebug!("measured black levels {:?}", levels);

        self.metadata.black_level = Some((levels.iter().sum::<i32>() as f64 / 4.0).round() as i32);
        self.metadata.black_level_separate = Some(levels);

        Ok(true)
    }

    /// Record a non-fatal error.
    pub fn set_error(&self, message: impl Into<String>) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.into());
    }

    /// All errors recorded so far.
    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The whole pixel buffer in native byte order, including row padding.
    ///
    /// Empty for unallocated images.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            PixelData::Unallocated => &[],
            PixelData::U16(data) => bytemuck::cast_slice(data),
            PixelData::F32(data) => bytemuck::cast_slice(data),
        }
    }

    /// Convert the crop window of a single-component 16-bit image.
    #[cfg(feature = "image")]
    pub fn to_luma16(&self) -> Option<::image::ImageBuffer<::image::Luma<u16>, Vec<u16>>> {
        if self.cpp != 1 {
            return None;
        }

        let view = self.cropped_array2d::<u16>().ok()?;
        let pixels: Vec<u16> = view.rows().flatten().copied().collect();

        ::image::ImageBuffer::from_raw(view.width() as u32, view.height() as u32, pixels)
    }

    /// Convert the crop window of a three-component 16-bit image, such as a Foveon image.
    #[cfg(feature = "image")]
    pub fn to_rgb16(&self) -> Option<::image::ImageBuffer<::image::Rgb<u16>, Vec<u16>>> {
        if self.cpp != 3 {
            return None;
        }

        let view = self.cropped_array2d::<u16>().ok()?;
        let pixels: Vec<u16> = view.rows().flatten().copied().collect();

        ::image::ImageBuffer::from_raw(view.width() as u32 / 3, view.height() as u32, pixels)
    }
}

fn required_len(width: usize, height: usize, pitch: usize) -> Option<usize> {
    if height == 0 {
        return Some(0);
    }

    (height - 1).checked_mul(pitch)?.checked_add(width)
}

fn check_shape(len: usize, width: usize, height: usize, pitch: usize) -> Result<()> {
    let fits = width <= pitch && required_len(width, height, pitch).is_some_and(|r| r <= len);

    if !fits {
        bail!(DecodingError::InvalidDimensions {
            width: width as u32,
            height: height as u32,
        });
    }

    Ok(())
}

/// A read-only 2D view with a row stride.
#[derive(Debug, Clone, Copy)]
pub struct Array2dRef<'a, T> {
    data: &'a [T],
    width: usize,
    height: usize,
    pitch: usize,
}

impl<'a, T> Array2dRef<'a, T> {
    /// Create a view of `height` rows of `width` samples, `pitch` samples apart.
    pub fn new(data: &'a [T], width: usize, height: usize, pitch: usize) -> Result<Self> {
        check_shape(data.len(), width, height, pitch)?;

        Ok(Self {
            data,
            width,
            height,
            pitch,
        })
    }

    /// The number of samples per row.
    pub fn width(&self) -> usize {
        self.width
    }

    /// The number of rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The distance between rows.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// A single row. Panics if `row` is out of bounds.
    pub fn row(&self, row: usize) -> &'a [T] {
        assert!(row < self.height, "row {row} out of bounds");

        &self.data[row * self.pitch..][..self.width]
    }

    /// A single sample.
    pub fn get(&self, row: usize, col: usize) -> Option<&'a T> {
        if row >= self.height || col >= self.width {
            return None;
        }

        self.data.get(row * self.pitch + col)
    }

    /// All rows, top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &'a [T]> + '_ {
        (0..self.height).map(|r| self.row(r))
    }

    /// A rectangular part of the view.
    pub fn sub_view(self, x: usize, y: usize, width: usize, height: usize) -> Result<Self> {
        if x + width > self.width || y + height > self.height {
            bail!(DecodingError::InvalidDimensions {
                width: width as u32,
                height: height as u32,
            });
        }

        let start = (y * self.pitch + x).min(self.data.len());

        Self::new(&self.data[start..], width, height, self.pitch)
    }
}

/// A mutable 2D view with a row stride.
#[derive(Debug)]
pub struct Array2dMut<'a, T> {
    data: &'a mut [T],
    width: usize,
    height: usize,
    pitch: usize,
}

impl<'a, T> Array2dMut<'a, T> {
    /// Create a view of `height` rows of `width` samples, `pitch` samples apart.
    pub fn new(data: &'a mut [T], width: usize, height: usize, pitch: usize) -> Result<Self> {
        check_shape(data.len(), width, height, pitch)?;

        Ok(Self {
            data,
            width,
            height,
            pitch,
        })
    }

    /// The number of samples per row.
    pub fn width(&self) -> usize {
        self.width
    }

    /// The number of rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The distance between rows.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// A read-only view of the same samples.
    pub fn as_ref(&self) -> Array2dRef<'_, T> {
        Array2dRef {
            data: &*self.data,
            width: self.width,
            height: self.height,
            pitch: self.pitch,
        }
    }

    /// Reborrow the view for a shorter lifetime.
    pub fn reborrow(&mut self) -> Array2dMut<'_, T> {
        Array2dMut {
            data: &mut *self.data,
            width: self.width,
            height: self.height,
            pitch: self.pitch,
        }
    }

    /// A single row. Panics if `row` is out of bounds.
    pub fn row(&self, row: usize) -> &[T] {
        assert!(row < self.height, "row {row} out of bounds");

        &self.data[row * self.pitch..][..self.width]
    }

    /// A single mutable row. Panics if `row` is out of bounds.
    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        assert!(row < self.height, "row {row} out of bounds");

        &mut self.data[row * self.pitch..][..self.width]
    }

    /// A single sample.
    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut T> {
        if row >= self.height || col >= self.width {
            return None;
        }

        self.data.get_mut(row * self.pitch + col)
    }

    /// A rectangular part of the view.
    pub fn sub_view(self, x: usize, y: usize, width: usize, height: usize) -> Result<Self> {
        if x + width > self.width || y + height > self.height {
            bail!(DecodingError::InvalidDimensions {
                width: width as u32,
                height: height as u32,
            });
        }

        let pitch = self.pitch;
        let data = self.data;
        let start = (y * pitch + x).min(data.len());
        let (_, tail) = data.split_at_mut(start);

        Self::new(tail, width, height, pitch)
    }

    /// Split the view into disjoint bands of rows.
    ///
    /// `bands` must be sorted and must not overlap. Rows outside of all bands are not
    /// reachable through the result.
    pub fn into_row_bands(self, bands: &[Range<usize>]) -> Vec<Self> {
        let (width, height, pitch) = (self.width, self.height, self.pitch);
        let mut rest = self.data;
        let mut next_row = 0;
        let mut out = Vec::with_capacity(bands.len());

        for band in bands {
            let start = band.start.max(next_row).min(height);
            let end = band.end.clamp(start, height);

            let skip = ((start - next_row) * pitch).min(rest.len());
            let (_, tail) = core::mem::take(&mut rest).split_at_mut(skip);

            let take = ((end - start) * pitch).min(tail.len());
            let (head, tail) = tail.split_at_mut(take);

            out.push(Self {
                data: head,
                width,
                height: end - start,
                pitch,
            });

            rest = tail;
            next_row = end;
        }

        out
    }
}

impl<T: Copy> Array2dMut<'_, T> {
    /// Set every sample of the view.
    pub fn fill(&mut self, value: T) {
        for row in 0..self.height {
            self.row_mut(row).fill(value);
        }
    }
}
