//! The compositor context object.
//!
//! [`Compositor`] owns every piece of compositor state for one display: the
//! device and GPU backends, the render target pool, backing stores, the frame
//! presenter and the cursor. It is created when the display device is attached
//! and consumed by [`Compositor::shutdown`].
//!
//! Two locks guard the state. The platform view registry has its own lock so
//! views can be registered from any thread; everything else sits behind the
//! core lock. When both are needed the registry is locked first.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::backing_store::{BackingStoreManager, Drawable, ReleaseOutcome};
use crate::config::CompositorConfig;
use crate::cursor::{CursorPlaneManager, CursorState};
use crate::device::DisplayDevice;
use crate::error::{CompositorError, Result};
use crate::gpu::GpuBackend;
use crate::platform_view::{PlatformViewRegistry, ViewCallbacks, ViewUserData};
use crate::presenter::{EngineHooks, FramePresenter, FrameReport};
use crate::render_target::RenderTargetPool;
use crate::types::{Layer, Size, ViewId};

/// Resource counts, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub render_targets: usize,
    pub stale_render_targets: usize,
    pub backing_stores: usize,
}

struct CoreState<D, G> {
    device: D,
    gpu: G,
    targets: RenderTargetPool,
    stores: BackingStoreManager,
    presenter: FramePresenter,
    cursor: CursorPlaneManager,
}

/// One display's compositor.
pub struct Compositor<D: DisplayDevice, G: GpuBackend> {
    core: Mutex<CoreState<D, G>>,
    views: PlatformViewRegistry,
    hooks: Arc<dyn EngineHooks>,
}

impl<D: DisplayDevice, G: GpuBackend> fmt::Debug for Compositor<D, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compositor").field("views", &self.views).finish_non_exhaustive()
    }
}

impl<D: DisplayDevice, G: GpuBackend> Compositor<D, G> {
    /// Sets up a compositor for `device`.
    ///
    /// If the configuration enables the cursor it is shown right away; a
    /// cursor that cannot be shown is logged and left disabled.
    pub fn new(mut device: D, gpu: G, hooks: Arc<dyn EngineHooks>, config: &CompositorConfig) -> Result<Self> {
        let presenter = FramePresenter::new(&device, Arc::clone(&hooks), &config.presentation);
        let mut cursor = CursorPlaneManager::new();
        if config.cursor.enabled {
            if let Err(e) = cursor.apply_state(&mut device, true, config.cursor.rotation, config.cursor.pixel_ratio) {
                warn!("Could not enable the hardware cursor: {}", e);
            }
        }

        let mode = device.mode();
        info!(
            crtc_id = device.crtc_id(),
            connector_id = device.connector_id(),
            width = mode.width,
            height = mode.height,
            refresh = mode.refresh,
            atomic = presenter.uses_atomic(),
            "Compositor attached to display"
        );

        Ok(Self {
            core: Mutex::new(CoreState {
                device,
                gpu,
                targets: RenderTargetPool::new(),
                stores: BackingStoreManager::new(),
                presenter,
                cursor,
            }),
            views: PlatformViewRegistry::new(),
            hooks,
        })
    }

    fn core(&self) -> Result<MutexGuard<'_, CoreState<D, G>>> {
        self.core.lock().map_err(|_| CompositorError::poisoned("compositor core"))
    }

    /// The platform view registry. Clones of it may be handed to other threads.
    pub fn view_registry(&self) -> &PlatformViewRegistry {
        &self.views
    }

    /// Engine request for a new backing store.
    pub fn create_backing_store(&self, requested_size: Size) -> Result<Drawable> {
        let mut core = self.core()?;
        let core = &mut *core;
        core.stores
            .create(requested_size, &mut core.targets, &mut core.device, &mut core.gpu)
    }

    /// Engine "collect" notification for a backing store.
    pub fn collect_backing_store(&self, drawable: &Drawable) -> Result<ReleaseOutcome> {
        let mut core = self.core()?;
        let core = &mut *core;
        core.stores.collect(drawable, &mut core.targets)
    }

    /// Engine "destroy" notification for a backing store.
    pub fn destroy_backing_store(&self, drawable: &Drawable) -> Result<ReleaseOutcome> {
        let mut core = self.core()?;
        let core = &mut *core;
        core.stores.destroy(drawable, &mut core.targets)
    }

    /// Presents one frame made of `layers`, back to front.
    pub fn present_layers(&self, layers: &[Layer]) -> Result<FrameReport> {
        let mut views = self.views.lock()?;
        let mut core = self.core()?;
        let core = &mut *core;
        let report = core.presenter.present(
            layers,
            &mut views,
            &mut core.device,
            &mut core.gpu,
            &mut core.targets,
            &core.stores,
        )?;
        debug!(
            layers = layers.len(),
            planes = report.assignments.len(),
            skipped = report.skipped_layers.len(),
            views = report.presented_views.len(),
            "Presented frame"
        );
        Ok(report)
    }

    /// Registers (or replaces) the callbacks of a platform view.
    pub fn set_view_callbacks(
        &self,
        view_id: ViewId,
        callbacks: ViewCallbacks,
        userdata: Option<ViewUserData>,
    ) -> Result<()> {
        self.views.register(view_id, callbacks, userdata)
    }

    /// Removes the callbacks of a platform view. `NotFound` if none are registered.
    pub fn remove_view_callbacks(&self, view_id: ViewId) -> Result<()> {
        self.views.unregister(view_id)
    }

    /// Shows, updates or hides the hardware cursor.
    pub fn apply_cursor_state(&self, enabled: bool, rotation: i32, pixel_ratio: f64) -> Result<()> {
        let mut core = self.core()?;
        let core = &mut *core;
        core.cursor.apply_state(&mut core.device, enabled, rotation, pixel_ratio)
    }

    /// Moves the cursor hotspot. `InvalidState` while the cursor is disabled.
    pub fn set_cursor_position(&self, x: i32, y: i32) -> Result<()> {
        let mut core = self.core()?;
        let core = &mut *core;
        core.cursor.set_position(&mut core.device, x, y)
    }

    pub fn cursor_state(&self) -> Result<CursorState> {
        Ok(self.core()?.cursor.state().clone())
    }

    pub fn pool_stats(&self) -> Result<PoolStats> {
        let core = self.core()?;
        Ok(PoolStats {
            render_targets: core.targets.len(),
            stale_render_targets: core.targets.stale_count(),
            backing_stores: core.stores.len(),
        })
    }

    /// Whether atomic commits currently block (always true after an `EBUSY`).
    pub fn uses_blocking_commits(&self) -> Result<bool> {
        Ok(self.core()?.presenter.blocking_commits())
    }

    /// Forwards a kernel page-flip event to the engine.
    pub fn on_page_flip(&self, sec: u32, usec: u32) {
        self.hooks.page_flip_completed(sec, usec);
    }

    /// Runs `f` with exclusive access to the display device.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> Result<R> {
        Ok(f(&mut self.core()?.device))
    }

    /// Tears everything down and hands the backends back.
    ///
    /// Every render target, stale or live, and the cursor buffer are
    /// destroyed. Backing stores the engine still holds become invalid.
    pub fn shutdown(self) -> (D, G) {
        let core = match self.core.into_inner() {
            Ok(core) => core,
            Err(poisoned) => {
                warn!("Compositor state was poisoned, shutting down anyway");
                poisoned.into_inner()
            }
        };
        let CoreState {
            mut device,
            mut gpu,
            mut targets,
            stores,
            mut cursor,
            ..
        } = core;

        if !stores.is_empty() {
            debug!(count = stores.len(), "Dropping backing stores still held by the engine");
        }
        cursor.destroy(&mut device);
        targets.destroy_all(&mut device, &mut gpu);
        info!("Compositor shut down");
        (device, gpu)
    }
}
