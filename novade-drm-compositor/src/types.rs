//! Plain data types shared by the compositor modules.
//!
//! Geometry arrives from the rendering engine in floating point logical pixels
//! and is rounded to whole pixels only where it is handed to the display
//! hardware or to platform view callbacks.

use crate::backing_store::Drawable;
use crate::error::CompositorError;

/// Identifier of a platform view, unique within a registry.
pub type ViewId = i64;

/// A point in floating point pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A size in floating point pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// A floating point rectangle, used by clip mutations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

/// A rectangle rounded to whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Rounds an engine-provided offset and size to the nearest pixel.
    pub fn from_offset_and_size(offset: Point, size: Size) -> Self {
        Self {
            x: offset.x.round() as i32,
            y: offset.y.round() as i32,
            width: size.width.round() as i32,
            height: size.height.round() as i32,
        }
    }
}

/// Corner radii of a rounded clip rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CornerRadii {
    pub upper_left: Size,
    pub upper_right: Size,
    pub lower_right: Size,
    pub lower_left: Size,
}

/// One entry of the transform/clip stack the engine applies to a platform view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mutation {
    Opacity(f64),
    ClipRect(Rect),
    ClipRoundedRect { rect: Rect, radii: CornerRadii },
    /// Row-major 3x3 affine/perspective matrix.
    Transformation([f64; 9]),
}

/// What a layer carries.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerContent {
    /// UI content the engine already rendered into a backing store.
    BackingStore(Drawable),
    /// Content owned by an external platform view.
    PlatformView { view_id: ViewId, mutations: Vec<Mutation> },
}

/// One entry of the ordered (back to front) layer list handed to `present_layers`.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub content: LayerContent,
    pub offset: Point,
    pub size: Size,
}

impl Layer {
    pub fn backing_store(drawable: Drawable, offset: Point, size: Size) -> Self {
        Self {
            content: LayerContent::BackingStore(drawable),
            offset,
            size,
        }
    }

    pub fn platform_view(view_id: ViewId, mutations: Vec<Mutation>, offset: Point, size: Size) -> Self {
        Self {
            content: LayerContent::PlatformView { view_id, mutations },
            offset,
            size,
        }
    }

    /// The platform view identifier, if this is a platform view layer.
    pub fn view_id(&self) -> Option<ViewId> {
        match &self.content {
            LayerContent::PlatformView { view_id, .. } => Some(*view_id),
            LayerContent::BackingStore(_) => None,
        }
    }

    pub fn pixel_rect(&self) -> PixelRect {
        PixelRect::from_offset_and_size(self.offset, self.size)
    }
}

/// Rotation of the output, in quarter turns clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl TryFrom<i32> for Rotation {
    type Error = CompositorError;

    fn try_from(degrees: i32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(CompositorError::InvalidArgument(format!(
                "rotation must be 0, 90, 180 or 270 degrees, got {}",
                other
            ))),
        }
    }
}
