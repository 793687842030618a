//! Backing stores: render targets as seen by the rendering engine.
//!
//! The engine asks for a backing store per layer, draws into its GL
//! framebuffer, and later releases it through two separate notifications,
//! "collect" and "destroy", in an order it chooses. Both notifications refer to
//! the same release. The first one only marks the store as pending; the
//! second one returns its render target to the pool.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::device::DisplayDevice;
use crate::error::{CompositorError, Result};
use crate::gpu::{GlFramebufferId, GpuBackend};
use crate::render_target::{PlaneRole, RenderTargetPool, TargetId};
use crate::types::Size;

/// Identity of a backing store handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackingStoreId(pub u64);

/// What the engine receives for a backing store: an identity to hand back in
/// layers and release notifications, and the GL framebuffer to render into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Drawable {
    pub id: BackingStoreId,
    /// `0` when rendering goes straight to the window surface.
    pub framebuffer: GlFramebufferId,
}

/// Result of a collect or destroy notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// First of the two notifications; nothing was recycled yet.
    Pending,
    /// Second notification; the render target went back to the pool.
    Recycled,
}

#[derive(Debug)]
struct BackingStore {
    target: TargetId,
    pending_free: bool,
}

/// Tracks live backing stores and their render targets.
#[derive(Debug, Default)]
pub struct BackingStoreManager {
    stores: HashMap<BackingStoreId, BackingStore>,
    next_id: u64,
}

impl BackingStoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backing stores not fully released yet.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// The render target behind a backing store.
    pub fn target_of(&self, id: BackingStoreId) -> Option<TargetId> {
        self.stores.get(&id).map(|store| store.target)
    }

    /// Creates a backing store on a stale or new render target.
    ///
    /// The window surface is requested whenever it is not in use; otherwise an
    /// overlay target. `requested_size` is only logged: every target covers
    /// the whole display mode.
    pub fn create(
        &mut self,
        requested_size: Size,
        pool: &mut RenderTargetPool,
        device: &mut dyn DisplayDevice,
        gpu: &mut dyn GpuBackend,
    ) -> Result<Drawable> {
        let role = if pool.is_surface_live() {
            PlaneRole::Overlay
        } else {
            PlaneRole::Primary
        };
        let target = pool.acquire(role, device, gpu)?;
        let framebuffer = pool
            .get(target)
            .map(|t| t.gl_framebuffer())
            .ok_or_else(|| CompositorError::InvalidState(format!("render target {} vanished", target)))?;

        let id = BackingStoreId(self.next_id);
        self.next_id += 1;
        self.stores.insert(
            id,
            BackingStore {
                target,
                pending_free: false,
            },
        );
        debug!(
            store = id.0,
            %target,
            framebuffer,
            width = requested_size.width,
            height = requested_size.height,
            "Created backing store"
        );
        Ok(Drawable { id, framebuffer })
    }

    /// The engine's "collect" notification.
    pub fn collect(&mut self, drawable: &Drawable, pool: &mut RenderTargetPool) -> Result<ReleaseOutcome> {
        self.release(drawable, pool, "collect")
    }

    /// The engine's "destroy" notification.
    pub fn destroy(&mut self, drawable: &Drawable, pool: &mut RenderTargetPool) -> Result<ReleaseOutcome> {
        self.release(drawable, pool, "destroy")
    }

    fn release(
        &mut self,
        drawable: &Drawable,
        pool: &mut RenderTargetPool,
        notification: &'static str,
    ) -> Result<ReleaseOutcome> {
        let store = self.stores.get_mut(&drawable.id).ok_or_else(|| {
            CompositorError::InvalidArgument(format!(
                "{} for unknown backing store {}",
                notification, drawable.id.0
            ))
        })?;

        if !store.pending_free {
            store.pending_free = true;
            trace!(store = drawable.id.0, notification, "Backing store release pending");
            return Ok(ReleaseOutcome::Pending);
        }

        let target = store.target;
        self.stores.remove(&drawable.id);
        pool.release(target)?;
        debug!(store = drawable.id.0, %target, notification, "Recycled backing store");
        Ok(ReleaseOutcome::Recycled)
    }
}
