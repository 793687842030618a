//! The kernel display device as seen by the compositor.
//!
//! [`DisplayDevice`] is the seam between the frame presentation pipeline and
//! the kernel mode-setting interface. The compositor never talks to the kernel
//! directly; it builds a [`CommitRequest`] and hands it to the device, or uses
//! the legacy per-plane calls when atomic modesetting is unavailable.
//!
//! The real implementation lives in [`drm`] behind the `drm-backend` feature.

pub mod commit;
#[cfg(feature = "drm-backend")]
pub mod drm;

use bitflags::bitflags;

use crate::error::Result;

pub use commit::{CommitRequest, DrmObject, PlaneOwner, PlaneReservation, PropertyWrite};

/// Kernel object id of a display plane.
pub type PlaneId = u32;
/// Kernel object id of a registered framebuffer. `0` means "no framebuffer".
pub type FramebufferId = u32;

/// Pixel format of every scanout and cursor buffer (ARGB8888 fourcc).
pub const FORMAT_ARGB8888: u32 = 0x3432_5241;

/// Hardware plane category reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    Overlay,
    Primary,
    Cursor,
}

/// Range and current value of a plane's `zpos` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZposInfo {
    pub current: i64,
    pub min: i64,
    pub max: i64,
}

impl ZposInfo {
    /// Whether the driver allows writing `zpos` at all (immutable planes report `min == max`).
    pub fn is_mutable(&self) -> bool {
        self.min < self.max
    }

    pub fn contains(&self, zpos: i64) -> bool {
        zpos >= self.min && zpos <= self.max
    }
}

/// Static description of one display plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: PlaneId,
    pub plane_type: PlaneType,
    /// Bitmask of CRTC indices this plane can be attached to.
    pub possible_crtcs: u32,
    /// `None` if the plane has no `zpos` property.
    pub zpos: Option<ZposInfo>,
}

impl PlaneInfo {
    pub fn can_attach_to(&self, crtc_index: u32) -> bool {
        crtc_index < 32 && self.possible_crtcs & (1 << crtc_index) != 0
    }
}

/// The display mode selected for the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    /// Vertical refresh rate in Hz.
    pub refresh: u32,
}

bitflags! {
    /// Flags for [`DisplayDevice::atomic_commit`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 0x01;
        const TEST_ONLY       = 0x100;
        const NONBLOCK        = 0x200;
        const ALLOW_MODESET   = 0x400;
    }
}

bitflags! {
    /// Values of the plane `rotation` property.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlaneRotation: u64 {
        const ROTATE_0   = 1 << 0;
        const ROTATE_90  = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X  = 1 << 4;
        const REFLECT_Y  = 1 << 5;
    }
}

/// Source and destination rectangles of a plane.
///
/// `src_*` are in 16.16 fixed point, `crtc_*` in whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    pub src_x: u32,
    pub src_y: u32,
    pub src_w: u32,
    pub src_h: u32,
    pub crtc_x: i32,
    pub crtc_y: i32,
    pub crtc_w: u32,
    pub crtc_h: u32,
}

impl PlaneGeometry {
    /// A plane scanning out a mode-sized buffer onto the whole screen.
    pub fn full_screen(mode: &DisplayMode) -> Self {
        Self {
            src_x: 0,
            src_y: 0,
            src_w: mode.width << 16,
            src_h: mode.height << 16,
            crtc_x: 0,
            crtc_y: 0,
            crtc_w: mode.width,
            crtc_h: mode.height,
        }
    }
}

/// A kernel dumb buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub pitch: u32,
    /// Total size in bytes.
    pub size: u64,
    pub bpp: u32,
}

/// Everything needed to register a buffer as a kernel framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferSpec {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc.
    pub format: u32,
    /// GEM handle of the buffer.
    pub handle: u32,
    pub pitch: u32,
}

/// Access to the display pipe (one CRTC and one connector) the compositor drives.
///
/// Implementations are used from the render thread only, but must be movable
/// into it.
pub trait DisplayDevice: Send {
    /// Whether the device accepted the atomic modesetting client capability.
    fn supports_atomic(&self) -> bool;
    fn crtc_id(&self) -> u32;
    /// Index of the selected CRTC, used to filter `possible_crtcs`.
    fn crtc_index(&self) -> u32;
    fn connector_id(&self) -> u32;
    fn mode(&self) -> DisplayMode;

    /// Enumerates all planes of the device.
    fn planes(&mut self) -> Result<Vec<PlaneInfo>>;

    /// Whether the plane accepts this `rotation` value.
    fn plane_supports_rotation(&mut self, plane: PlaneId, rotation: PlaneRotation) -> Result<bool>;

    /// Applies every property write of `request` in one atomic commit.
    ///
    /// If `request.needs_modeset()` the implementation adds the connector,
    /// mode and active properties for the selected pipe.
    fn atomic_commit(&mut self, request: &CommitRequest, flags: CommitFlags) -> Result<()>;

    /// Legacy modeset: program the CRTC with the mode and `fb`.
    fn set_crtc(&mut self, fb: FramebufferId) -> Result<()>;
    /// Legacy flip of the primary plane.
    fn page_flip(&mut self, fb: FramebufferId, request_event: bool) -> Result<()>;
    /// Legacy update of a non-primary plane.
    fn set_plane(&mut self, plane: PlaneId, fb: FramebufferId, geometry: &PlaneGeometry) -> Result<()>;
    /// Legacy single property write.
    fn set_property(&mut self, object: DrmObject, name: &str, value: u64) -> Result<()>;

    fn add_framebuffer(&mut self, spec: &FramebufferSpec) -> Result<FramebufferId>;
    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()>;

    /// The driver's preferred dumb buffer depth, `None` if dumb buffers are unsupported.
    fn dumb_buffer_preferred_depth(&self) -> Result<Option<u32>>;
    fn create_dumb_buffer(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer>;
    /// Copies `data` to the start of the mapped buffer.
    fn write_dumb_buffer(&mut self, buffer: &DumbBuffer, data: &[u8]) -> Result<()>;
    fn destroy_dumb_buffer(&mut self, buffer: DumbBuffer) -> Result<()>;

    /// Shows `buffer` as the hardware cursor, or hides the cursor for `None`.
    fn set_cursor(&mut self, buffer: Option<&DumbBuffer>, hotspot: (i32, i32)) -> Result<()>;
    fn move_cursor(&mut self, x: i32, y: i32) -> Result<()>;
}
