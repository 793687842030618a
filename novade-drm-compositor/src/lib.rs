//! # NovaDE DRM Compositor (`novade-drm-compositor`)
//!
//! Frame presentation straight to the kernel display subsystem, without a
//! windowing server. The rendering engine hands over an ordered list of
//! already rendered layers; this crate puts them on hardware display planes
//! and commits the result, atomically where the device allows it.
//!
//! ## Purpose
//!
//! - **Render targets**: the window surface for the primary plane and hand
//!   double-buffered offscreen targets for overlay planes, recycled through a
//!   stale pool (`render_target`).
//! - **Backing stores**: the engine's drawables, released by two notifications
//!   in any order (`backing_store`).
//! - **Platform views**: externally rendered content with mount, update,
//!   unmount and present callbacks (`platform_view`).
//! - **Frame presentation**: plane assignment, capability degradation and the
//!   atomic/legacy commit protocol (`presenter`).
//! - **Hardware cursor**: density-matched, rotated cursor bitmaps in a dumb
//!   buffer (`cursor`).
//!
//! The kernel device and the EGL/GL side are reached through the
//! [`DisplayDevice`] and [`GpuBackend`] traits. A real [`DisplayDevice`] on top
//! of the `drm` crate is available with the `drm-backend` feature.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use novade_drm_compositor::{init_logging, Compositor, ConfigLoader, Layer};
//!
//! let config = ConfigLoader::load_from_path("/etc/novade/drm-compositor.toml")?;
//! init_logging(&config.logging)?;
//!
//! let compositor = Compositor::new(device, gpu, Arc::new(engine_hooks), &config)?;
//! let drawable = compositor.create_backing_store(size)?;
//! // ... the engine renders into drawable.framebuffer ...
//! compositor.present_layers(&[Layer::backing_store(drawable, offset, size)])?;
//! ```

pub mod backing_store;
pub mod compositor;
pub mod config;
pub mod cursor;
pub mod device;
pub mod error;
pub mod gpu;
pub mod logging;
pub mod platform_view;
pub mod presenter;
pub mod render_target;
pub mod types;

#[cfg(test)]
mod test_support;

pub use backing_store::{BackingStoreId, Drawable, ReleaseOutcome};
pub use compositor::{Compositor, PoolStats};
pub use config::{CompositorConfig, ConfigLoader, CursorConfig, LoggingConfig, PresentationConfig};
pub use cursor::{CursorIcon, CursorPlaneManager, CursorState};
pub use device::{CommitRequest, DisplayDevice, DrmObject, PlaneInfo, PlaneType};
#[cfg(feature = "drm-backend")]
pub use device::drm::DrmDisplayDevice;
pub use error::{CompositorError, ConfigError, Result};
pub use gpu::GpuBackend;
pub use logging::{init_logging, init_minimal_logging};
pub use platform_view::{PlatformViewRegistry, ViewCallbacks, ViewPlacement, ViewUserData};
pub use presenter::{EngineHooks, FramePresenter, FrameReport};
pub use types::{Layer, LayerContent, Mutation, PixelRect, Point, Rect, Rotation, Size, ViewId};
