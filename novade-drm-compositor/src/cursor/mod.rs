//! Hardware cursor.
//!
//! The cursor is an ARGB8888 bitmap in a kernel dumb buffer, shown and moved
//! through the kernel's dedicated cursor calls. [`CursorPlaneManager`] picks
//! the bitmap matching the display density, rotates it with the output, and
//! only reallocates the buffer when the bitmap size changes.

pub mod icons;

use std::borrow::Cow;

use tracing::{debug, warn};

use crate::device::{DisplayDevice, DumbBuffer, FramebufferId, FramebufferSpec, FORMAT_ARGB8888};
use crate::error::{CompositorError, Result};
use crate::types::Rotation;

/// Icon width, in pixels, that counts as pixel ratio 1.0.
///
/// Derived from an assumed physical cursor size and not calibrated against
/// real displays; icon selection may need a different value per panel.
pub const CURSOR_PHYSICAL_DIAGONAL_FACTOR: f64 = 25.4 * 38.0 / 30.0;

const CURSOR_BPP: u32 = 32;

/// A square ARGB8888 cursor bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorIcon {
    pub width: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    /// Row-major pixels, `width * width` entries.
    pub data: Vec<u32>,
}

impl CursorIcon {
    /// The device pixel ratio this icon is drawn for.
    pub fn pixel_ratio(&self) -> f64 {
        f64::from(self.width) / CURSOR_PHYSICAL_DIAGONAL_FACTOR
    }

    /// Checks that the bitmap is non-empty, square and holds its hotspot.
    pub fn validate(&self) -> Result<()> {
        let pixels = (self.width as usize).checked_mul(self.width as usize);
        if self.width == 0 || pixels != Some(self.data.len()) {
            return Err(CompositorError::InvalidArgument(format!(
                "cursor icon of width {} has {} pixels",
                self.width,
                self.data.len()
            )));
        }
        if self.hot_x >= self.width || self.hot_y >= self.width {
            return Err(CompositorError::InvalidArgument(format!(
                "cursor hotspot ({}, {}) lies outside a {} pixel icon",
                self.hot_x, self.hot_y, self.width
            )));
        }
        Ok(())
    }
}

/// Picks the icon for `pixel_ratio`: the largest one whose pixel ratio does
/// not exceed it (the smaller on ties), or the smallest icon if none fits.
pub fn select_icon(icons: &[CursorIcon], pixel_ratio: f64) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, icon) in icons.iter().enumerate() {
        if icon.pixel_ratio() > pixel_ratio {
            continue;
        }
        best = match best {
            Some(current) => {
                let current_icon = &icons[current];
                let better = icon.pixel_ratio() > current_icon.pixel_ratio()
                    || (icon.pixel_ratio() == current_icon.pixel_ratio() && icon.width < current_icon.width);
                Some(if better { index } else { current })
            }
            None => Some(index),
        };
    }
    best.or_else(|| {
        icons
            .iter()
            .enumerate()
            .min_by_key(|(_, icon)| icon.width)
            .map(|(index, _)| index)
    })
}

/// Where the hotspot of a `width` wide bitmap ends up after rotating it clockwise.
pub fn rotate_hotspot(width: u32, hot_x: u32, hot_y: u32, rotation: Rotation) -> (u32, u32) {
    let last = width.saturating_sub(1);
    match rotation {
        Rotation::Deg0 => (hot_x, hot_y),
        Rotation::Deg90 => (last.saturating_sub(hot_y), hot_x),
        Rotation::Deg180 => (last.saturating_sub(hot_x), last.saturating_sub(hot_y)),
        Rotation::Deg270 => (hot_y, last.saturating_sub(hot_x)),
    }
}

/// Renders `icon` rotated clockwise into a buffer with `pitch` bytes per row.
pub fn rotate_into_buffer(icon: &CursorIcon, rotation: Rotation, pitch: u32) -> Result<Vec<u8>> {
    icon.validate()?;
    let width = icon.width as usize;
    let pitch = pitch as usize;
    if pitch < 4 * width {
        return Err(CompositorError::InvalidArgument(format!(
            "pitch {} is too small for a {} pixel cursor row",
            pitch, width
        )));
    }
    let mut bytes = vec![0u8; pitch * width];
    for y in 0..icon.width {
        for x in 0..icon.width {
            let (dst_x, dst_y) = rotate_hotspot(icon.width, x, y, rotation);
            let offset = pitch * dst_y as usize + 4 * dst_x as usize;
            let pixel = icon.data[y as usize * width + x as usize];
            bytes[offset..offset + 4].copy_from_slice(&pixel.to_le_bytes());
        }
    }
    Ok(bytes)
}

/// Observable state of the hardware cursor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CursorState {
    pub enabled: bool,
    /// Index of the shown icon in the manager's icon set.
    pub icon: Option<usize>,
    pub rotation: Rotation,
    /// Hotspot in the rotated bitmap.
    pub hot_x: i32,
    pub hot_y: i32,
    /// Last requested position of the hotspot on screen.
    pub x: i32,
    pub y: i32,
    pub buffer: Option<DumbBuffer>,
}

/// Owner of the cursor buffer and state.
#[derive(Debug)]
pub struct CursorPlaneManager {
    icons: Cow<'static, [CursorIcon]>,
    state: CursorState,
    framebuffer: Option<FramebufferId>,
}

impl Default for CursorPlaneManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorPlaneManager {
    /// A manager using the built-in arrow.
    pub fn new() -> Self {
        Self::with_icons(Cow::Borrowed(icons::default_icons()))
    }

    pub fn with_icons(icons: impl Into<Cow<'static, [CursorIcon]>>) -> Self {
        Self {
            icons: icons.into(),
            state: CursorState::default(),
            framebuffer: None,
        }
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    pub fn icons(&self) -> &[CursorIcon] {
        &self.icons
    }

    /// Shows, updates or hides the cursor.
    ///
    /// Rotations other than 0, 90, 180 and 270 degrees are rejected with
    /// `InvalidArgument` before anything changes.
    pub fn apply_state(
        &mut self,
        device: &mut dyn DisplayDevice,
        enabled: bool,
        rotation: i32,
        pixel_ratio: f64,
    ) -> Result<()> {
        if !enabled {
            self.destroy(device);
            return Ok(());
        }

        let rotation = Rotation::try_from(rotation)?;
        let icon_index = select_icon(&self.icons, pixel_ratio)
            .ok_or_else(|| CompositorError::InvalidState("no cursor icons available".to_string()))?;
        self.icons[icon_index].validate()?;
        let width = self.icons[icon_index].width;

        if let Some(buffer) = self.state.buffer {
            if buffer.width != width {
                debug!(old = buffer.width, new = width, "Cursor size changed, reallocating buffer");
                self.destroy_buffer(device);
            }
        }
        let buffer = match self.state.buffer {
            Some(buffer) => buffer,
            None => self.create_buffer(device, width)?,
        };

        let unchanged =
            self.state.enabled && self.state.rotation == rotation && self.state.icon == Some(icon_index);
        if unchanged {
            return Ok(());
        }

        let icon = &self.icons[icon_index];
        let pixels = rotate_into_buffer(icon, rotation, buffer.pitch)?;
        device.write_dumb_buffer(&buffer, &pixels)?;
        let (hot_x, hot_y) = rotate_hotspot(icon.width, icon.hot_x, icon.hot_y, rotation);

        self.state.enabled = true;
        self.state.icon = Some(icon_index);
        self.state.rotation = rotation;
        self.state.hot_x = hot_x as i32;
        self.state.hot_y = hot_y as i32;
        debug!(
            width,
            rotation = rotation.degrees(),
            hot_x,
            hot_y,
            "Uploaded cursor icon"
        );

        device.set_cursor(Some(&buffer), (self.state.hot_x, self.state.hot_y))?;
        device.move_cursor(
            self.state.x.saturating_sub(self.state.hot_x),
            self.state.y.saturating_sub(self.state.hot_y),
        )
    }

    /// Moves the cursor hotspot to `(x, y)`. Only valid while the cursor is enabled.
    pub fn set_position(&mut self, device: &mut dyn DisplayDevice, x: i32, y: i32) -> Result<()> {
        if !self.state.enabled {
            return Err(CompositorError::InvalidState("cursor is disabled".to_string()));
        }
        device.move_cursor(x.saturating_sub(self.state.hot_x), y.saturating_sub(self.state.hot_y))?;
        self.state.x = x;
        self.state.y = y;
        Ok(())
    }

    /// Hides the cursor and frees its buffer, including one left over from a failed upload.
    pub fn destroy(&mut self, device: &mut dyn DisplayDevice) {
        if self.state.enabled {
            self.disable(device);
        } else {
            self.destroy_buffer(device);
        }
    }

    fn disable(&mut self, device: &mut dyn DisplayDevice) {
        if let Err(e) = device.set_cursor(None, (0, 0)) {
            warn!("Could not hide cursor: {}", e);
        }
        self.destroy_buffer(device);
        self.state = CursorState::default();
        debug!("Cursor disabled");
    }

    fn create_buffer(&mut self, device: &mut dyn DisplayDevice, width: u32) -> Result<DumbBuffer> {
        match device.dumb_buffer_preferred_depth()? {
            None => {
                return Err(CompositorError::allocation(
                    "cursor buffer",
                    "the display driver does not support dumb buffers",
                ));
            }
            Some(depth) if depth != CURSOR_BPP => {
                warn!(depth, "Preferred dumb buffer depth differs from the cursor's 32 bpp");
            }
            Some(_) => {}
        }

        let buffer = device
            .create_dumb_buffer(width, width, CURSOR_BPP)
            .map_err(|e| CompositorError::allocation("cursor buffer", e))?;
        let spec = FramebufferSpec {
            width,
            height: width,
            format: FORMAT_ARGB8888,
            handle: buffer.handle,
            pitch: buffer.pitch,
        };
        let framebuffer = match device.add_framebuffer(&spec) {
            Ok(fb) => fb,
            Err(e) => {
                if let Err(destroy_err) = device.destroy_dumb_buffer(buffer) {
                    warn!("Could not destroy cursor buffer: {}", destroy_err);
                }
                return Err(CompositorError::allocation("cursor framebuffer", e));
            }
        };

        self.state.buffer = Some(buffer);
        self.framebuffer = Some(framebuffer);
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, device: &mut dyn DisplayDevice) {
        if let Some(fb) = self.framebuffer.take() {
            if let Err(e) = device.remove_framebuffer(fb) {
                warn!(fb, "Could not remove cursor framebuffer: {}", e);
            }
        }
        if let Some(buffer) = self.state.buffer.take() {
            if let Err(e) = device.destroy_dumb_buffer(buffer) {
                warn!(handle = buffer.handle, "Could not destroy cursor buffer: {}", e);
            }
        }
    }
}
