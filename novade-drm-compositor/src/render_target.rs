//! Render targets and their pool.
//!
//! A [`RenderTarget`] is something the rendering engine draws into and the
//! display scans out from. There are exactly two kinds:
//!
//! * [`SurfaceTarget`]: the window surface. Drawing goes to GL framebuffer `0`,
//!   and the scanout buffer is obtained by locking the surface's front buffer
//!   after a swap. There is only one per device lifetime and it always goes to
//!   the primary plane.
//! * [`BufferTarget`]: two scanout images, each wrapped in a renderbuffer and
//!   registered as a kernel framebuffer, double-buffered by hand behind one
//!   GL framebuffer object. Used for overlay planes.
//!
//! Targets are never freed while the compositor runs. Released targets go to
//! the stale list of the [`RenderTargetPool`] and are handed out again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::{debug, info, warn};

use crate::device::{DisplayDevice, FramebufferId, FramebufferSpec, PlaneRotation, FORMAT_ARGB8888};
use crate::error::{CompositorError, Result};
use crate::gpu::{GlFramebufferId, GpuBackend, GpuImage, RenderbufferId, SurfaceBuffer};

/// Identity of a render target within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// The plane role a target is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneRole {
    Primary,
    Overlay,
}

/// The window surface target.
#[derive(Debug, Default)]
pub struct SurfaceTarget {
    /// The buffer currently locked for scanout.
    front: Option<SurfaceBuffer>,
    /// Kernel framebuffers registered for the surface's buffers, by buffer id.
    framebuffers: HashMap<u64, FramebufferId>,
}

impl SurfaceTarget {
    fn present(&mut self, device: &mut dyn DisplayDevice, gpu: &mut dyn GpuBackend) -> Result<FramebufferId> {
        gpu.swap_buffers()?;
        let next = gpu.lock_front_buffer()?;

        let fb = match self.framebuffers.get(&next.id) {
            Some(fb) => *fb,
            None => {
                let fb = device
                    .add_framebuffer(&FramebufferSpec {
                        width: next.width,
                        height: next.height,
                        format: next.format,
                        handle: next.handle,
                        pitch: next.pitch,
                    })
                    .map_err(|e| {
                        if let Err(release_err) = gpu.release_front_buffer(next) {
                            warn!("Could not release front buffer after failed framebuffer registration: {}", release_err);
                        }
                        e
                    })?;
                debug!(buffer_id = next.id, fb, "Registered framebuffer for surface buffer");
                self.framebuffers.insert(next.id, fb);
                fb
            }
        };

        // The previous front buffer may still be scanned out until the flip
        // lands; it is given back one frame later.
        if let Some(previous) = self.front.replace(next) {
            if let Err(e) = gpu.release_front_buffer(previous) {
                warn!("Could not release previous front buffer: {}", e);
            }
        }
        Ok(fb)
    }

    fn destroy(mut self, device: &mut dyn DisplayDevice, gpu: &mut dyn GpuBackend) {
        if let Some(front) = self.front.take() {
            if let Err(e) = gpu.release_front_buffer(front) {
                warn!("Could not release front buffer: {}", e);
            }
        }
        for (_, fb) in self.framebuffers.drain() {
            if let Err(e) = device.remove_framebuffer(fb) {
                warn!(fb, "Could not remove surface framebuffer: {}", e);
            }
        }
    }
}

/// One half of a [`BufferTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutBuffer {
    pub image: GpuImage,
    pub renderbuffer: RenderbufferId,
    pub framebuffer: FramebufferId,
}

impl ScanoutBuffer {
    /// Creates image, renderbuffer and kernel framebuffer, unwinding on failure.
    fn create(
        device: &mut dyn DisplayDevice,
        gpu: &mut dyn GpuBackend,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let image = gpu.create_scanout_image(width, height)?;

        let renderbuffer = match gpu.create_renderbuffer(&image) {
            Ok(renderbuffer) => renderbuffer,
            Err(e) => {
                log_rollback(gpu.destroy_scanout_image(image), "scanout image");
                return Err(e);
            }
        };

        let spec = FramebufferSpec {
            width,
            height,
            format: FORMAT_ARGB8888,
            handle: image.gem_handle,
            pitch: image.pitch,
        };
        let framebuffer = match device.add_framebuffer(&spec) {
            Ok(fb) => fb,
            Err(e) => {
                log_rollback(gpu.destroy_renderbuffer(renderbuffer), "renderbuffer");
                log_rollback(gpu.destroy_scanout_image(image), "scanout image");
                return Err(e);
            }
        };

        Ok(Self {
            image,
            renderbuffer,
            framebuffer,
        })
    }

    fn destroy(self, device: &mut dyn DisplayDevice, gpu: &mut dyn GpuBackend) {
        log_rollback(device.remove_framebuffer(self.framebuffer), "framebuffer");
        log_rollback(gpu.destroy_renderbuffer(self.renderbuffer), "renderbuffer");
        log_rollback(gpu.destroy_scanout_image(self.image), "scanout image");
    }
}

fn log_rollback(result: Result<()>, what: &str) {
    if let Err(e) = result {
        warn!("Could not destroy {}: {}", what, e);
    }
}

/// A hand double-buffered offscreen target for overlay planes.
#[derive(Debug)]
pub struct BufferTarget {
    fbo: GlFramebufferId,
    buffers: [ScanoutBuffer; 2],
    /// Index of the buffer attached to `fbo`, i.e. being rendered into.
    render_index: usize,
}

impl BufferTarget {
    /// Creates the FBO and both scanout buffers. Either everything is created
    /// or every step that already succeeded is undone.
    pub fn create(device: &mut dyn DisplayDevice, gpu: &mut dyn GpuBackend, width: u32, height: u32) -> Result<Self> {
        let fbo = gpu.create_framebuffer_object()?;

        let first = match ScanoutBuffer::create(device, gpu, width, height) {
            Ok(buffer) => buffer,
            Err(e) => {
                log_rollback(gpu.destroy_framebuffer_object(fbo), "framebuffer object");
                return Err(e);
            }
        };

        let second = match ScanoutBuffer::create(device, gpu, width, height) {
            Ok(buffer) => buffer,
            Err(e) => {
                first.destroy(device, gpu);
                log_rollback(gpu.destroy_framebuffer_object(fbo), "framebuffer object");
                return Err(e);
            }
        };

        if let Err(e) = gpu.attach_renderbuffer(fbo, first.renderbuffer) {
            second.destroy(device, gpu);
            first.destroy(device, gpu);
            log_rollback(gpu.destroy_framebuffer_object(fbo), "framebuffer object");
            return Err(e);
        }

        Ok(Self {
            fbo,
            buffers: [first, second],
            render_index: 0,
        })
    }

    pub fn buffers(&self) -> &[ScanoutBuffer; 2] {
        &self.buffers
    }

    /// Swaps the pair: the buffer just rendered becomes the scanout buffer and
    /// the other one is attached for the next frame.
    fn present(&mut self, gpu: &mut dyn GpuBackend) -> Result<FramebufferId> {
        let scanout = self.render_index;
        let next = scanout ^ 1;
        gpu.attach_renderbuffer(self.fbo, self.buffers[next].renderbuffer)?;
        self.render_index = next;
        Ok(self.buffers[scanout].framebuffer)
    }

    fn destroy(self, device: &mut dyn DisplayDevice, gpu: &mut dyn GpuBackend) {
        log_rollback(gpu.destroy_framebuffer_object(self.fbo), "framebuffer object");
        let [first, second] = self.buffers;
        second.destroy(device, gpu);
        first.destroy(device, gpu);
    }
}

/// A presentable drawable.
#[derive(Debug)]
pub enum RenderTarget {
    Surface(SurfaceTarget),
    Buffer(BufferTarget),
}

impl RenderTarget {
    /// The GL framebuffer the engine renders into.
    pub fn gl_framebuffer(&self) -> GlFramebufferId {
        match self {
            RenderTarget::Surface(_) => 0,
            RenderTarget::Buffer(target) => target.fbo,
        }
    }

    pub fn is_surface(&self) -> bool {
        matches!(self, RenderTarget::Surface(_))
    }

    /// Finishes the frame rendered into this target and returns the kernel
    /// framebuffer to scan out.
    pub fn prepare_scanout(
        &mut self,
        device: &mut dyn DisplayDevice,
        gpu: &mut dyn GpuBackend,
    ) -> Result<FramebufferId> {
        match self {
            RenderTarget::Surface(target) => target.present(device, gpu),
            RenderTarget::Buffer(target) => target.present(gpu),
        }
    }

    /// The plane rotation that shows this target upright.
    ///
    /// GL renders into renderbuffers bottom-up, so buffer targets need a Y reflection.
    pub fn scanout_rotation(&self) -> PlaneRotation {
        match self {
            RenderTarget::Surface(_) => PlaneRotation::ROTATE_0,
            RenderTarget::Buffer(_) => PlaneRotation::ROTATE_0 | PlaneRotation::REFLECT_Y,
        }
    }

    pub fn destroy(self, device: &mut dyn DisplayDevice, gpu: &mut dyn GpuBackend) {
        match self {
            RenderTarget::Surface(target) => target.destroy(device, gpu),
            RenderTarget::Buffer(target) => target.destroy(device, gpu),
        }
    }
}

/// Owner of every render target; recycles released targets.
#[derive(Debug, Default)]
pub struct RenderTargetPool {
    targets: BTreeMap<TargetId, RenderTarget>,
    stale: Vec<TargetId>,
    surface: Option<TargetId>,
    next_id: u64,
}

impl RenderTargetPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn stale_count(&self) -> usize {
        self.stale.len()
    }

    pub fn is_stale(&self, id: TargetId) -> bool {
        self.stale.contains(&id)
    }

    pub fn get(&self, id: TargetId) -> Option<&RenderTarget> {
        self.targets.get(&id)
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut RenderTarget> {
        self.targets.get_mut(&id)
    }

    /// Whether the window surface target exists and is handed out.
    pub fn is_surface_live(&self) -> bool {
        self.surface.map_or(false, |id| !self.is_stale(id))
    }

    /// Returns a target for `role`, reusing a stale one if possible.
    ///
    /// The first primary request creates the window surface target; once it
    /// exists, primary requests that cannot get it back degrade to buffer
    /// targets. Allocation failures are returned as is and not retried.
    pub fn acquire(
        &mut self,
        role: PlaneRole,
        device: &mut dyn DisplayDevice,
        gpu: &mut dyn GpuBackend,
    ) -> Result<TargetId> {
        if let Some(id) = self.take_stale(role) {
            debug!(%id, ?role, "Reusing stale render target");
            return Ok(id);
        }

        let mode = device.mode();
        let target = if role == PlaneRole::Primary && self.surface.is_none() {
            info!(width = mode.width, height = mode.height, "Using the window surface as primary render target");
            RenderTarget::Surface(SurfaceTarget::default())
        } else {
            let target = BufferTarget::create(device, gpu, mode.width, mode.height)
                .map_err(|e| CompositorError::allocation("buffer render target", e))?;
            RenderTarget::Buffer(target)
        };

        let id = TargetId(self.next_id);
        self.next_id += 1;
        if target.is_surface() {
            self.surface = Some(id);
        }
        debug!(%id, ?role, "Created render target");
        self.targets.insert(id, target);
        Ok(id)
    }

    fn take_stale(&mut self, role: PlaneRole) -> Option<TargetId> {
        let wanted_surface = role == PlaneRole::Primary && self.surface.map_or(true, |id| self.is_stale(id));
        let position = self.stale.iter().position(|id| {
            let is_surface = Some(*id) == self.surface;
            if wanted_surface {
                is_surface
            } else {
                !is_surface
            }
        })?;
        Some(self.stale.swap_remove(position))
    }

    /// Returns a target to the stale list.
    ///
    /// Returns `Ok(false)` without changing anything if it already was stale.
    pub fn release(&mut self, id: TargetId) -> Result<bool> {
        if !self.targets.contains_key(&id) {
            return Err(CompositorError::InvalidArgument(format!("unknown render target {}", id)));
        }
        if self.is_stale(id) {
            warn!(%id, "Render target released twice");
            return Ok(false);
        }
        self.stale.push(id);
        Ok(true)
    }

    /// Destroys every target, live or stale.
    pub fn destroy_all(&mut self, device: &mut dyn DisplayDevice, gpu: &mut dyn GpuBackend) {
        let count = self.targets.len();
        for (_, target) in std::mem::take(&mut self.targets) {
            target.destroy(device, gpu);
        }
        self.stale.clear();
        self.surface = None;
        debug!(count, "Destroyed all render targets");
    }
}
