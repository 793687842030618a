//! The EGL/GL side of presentation.
//!
//! [`GpuBackend`] is implemented by the embedding application on top of its
//! EGL display, window surface and GL context. The compositor uses it to swap
//! and lock the window surface and to build offscreen scanout buffers for
//! overlay planes.

use crate::error::Result;

/// Name of a GL renderbuffer object.
pub type RenderbufferId = u32;
/// Name of a GL framebuffer object. `0` is the window surface.
pub type GlFramebufferId = u32;

/// A GPU-importable image exported as a kernel buffer (an EGL image over a GEM object).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuImage {
    /// Backend specific image identity.
    pub id: u64,
    pub gem_handle: u32,
    pub pitch: u32,
}

/// A buffer locked from the window surface for scanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceBuffer {
    /// Stable identity of the buffer within the surface's swap chain.
    pub id: u64,
    pub width: u32,
    pub height: u32,
    /// DRM fourcc.
    pub format: u32,
    pub handle: u32,
    pub pitch: u32,
}

/// GPU operations needed by the presentation pipeline.
pub trait GpuBackend: Send {
    /// Binds the window surface and the root context to the calling thread.
    fn make_current(&mut self) -> Result<()>;
    fn clear_current(&mut self) -> Result<()>;
    /// Finishes the frame rendered into the window surface.
    fn swap_buffers(&mut self) -> Result<()>;

    /// Locks the buffer that `swap_buffers` just made the front buffer.
    fn lock_front_buffer(&mut self) -> Result<SurfaceBuffer>;
    /// Gives a previously locked buffer back to the surface.
    fn release_front_buffer(&mut self, buffer: SurfaceBuffer) -> Result<()>;

    /// Allocates a scanout capable ARGB8888 image.
    fn create_scanout_image(&mut self, width: u32, height: u32) -> Result<GpuImage>;
    fn destroy_scanout_image(&mut self, image: GpuImage) -> Result<()>;
    fn create_renderbuffer(&mut self, image: &GpuImage) -> Result<RenderbufferId>;
    fn destroy_renderbuffer(&mut self, renderbuffer: RenderbufferId) -> Result<()>;
    fn create_framebuffer_object(&mut self) -> Result<GlFramebufferId>;
    fn destroy_framebuffer_object(&mut self, fbo: GlFramebufferId) -> Result<()>;
    /// Makes `renderbuffer` the color attachment of `fbo`.
    fn attach_renderbuffer(&mut self, fbo: GlFramebufferId, renderbuffer: RenderbufferId) -> Result<()>;
}
