//! Per-frame presentation.
//!
//! [`FramePresenter::present`] turns the engine's ordered layer list into one
//! display update:
//!
//! 1. probe the planes usable on the selected CRTC,
//! 2. classify platform views and run their unmount/update/mount callbacks,
//! 3. reserve a plane per backing-store layer and program it; run the present
//!    callback of every platform-view layer,
//! 4. commit, atomically if the device allows it.
//!
//! Hardware differences (missing `rotation` or `zpos` support, `EBUSY` on
//! non-blocking commits) are degraded around at runtime and logged once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::backing_store::BackingStoreManager;
use crate::config::PresentationConfig;
use crate::device::{
    CommitFlags, CommitRequest, DisplayDevice, DisplayMode, DrmObject, FramebufferId, PlaneGeometry, PlaneId,
    PlaneInfo, PlaneRotation, PlaneType,
};
use crate::error::{CompositorError, Result};
use crate::gpu::GpuBackend;
use crate::platform_view::{ViewPlacement, ViewRegistryGuard};
use crate::render_target::RenderTargetPool;
use crate::types::{Layer, LayerContent, ViewId};

/// Services of the rendering engine the presenter calls back into.
pub trait EngineHooks: Send + Sync {
    /// The engine's monotonic clock in nanoseconds.
    fn current_time_ns(&self) -> u64;
    /// Runs `task` on the engine's platform task queue.
    fn post_task(&self, task: Box<dyn FnOnce() + Send>);
    /// Reports a completed page flip (vsync) to the engine.
    fn page_flip_completed(&self, sec: u32, usec: u32);
}

/// Progress of the frame being presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    PlanesProbed,
    ViewsTransitioned,
    LayersAssigned,
    Committed,
}

/// A backing-store layer shown on a plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneAssignment {
    pub layer_index: usize,
    pub plane_id: PlaneId,
    pub plane_type: PlaneType,
    pub framebuffer: FramebufferId,
}

/// What happened during one [`FramePresenter::present`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub assignments: Vec<PlaneAssignment>,
    /// Backing-store layers that were not shown this frame.
    pub skipped_layers: Vec<usize>,
    /// Platform views presented through their present callback.
    pub presented_views: Vec<ViewId>,
    /// Whether this frame carried the initial modeset.
    pub modeset: bool,
    /// Whether the commit blocked until the flip happened.
    pub blocking: bool,
    /// Whether a synthetic page-flip event was posted to the engine.
    pub synthetic_page_flip: bool,
}

#[derive(Debug, Default)]
struct OneTimeWarnings {
    rotation: bool,
    zpos: bool,
    busy: bool,
    cursor_front: bool,
}

fn warn_once(flag: &mut bool, message: &str) {
    if !*flag {
        *flag = true;
        warn!("{}", message);
    }
}

/// Frame orchestrator. Lives as long as the compositor.
pub struct FramePresenter {
    use_atomic: bool,
    blocking_commits: bool,
    has_applied_modeset: bool,
    state: FrameState,
    warnings: OneTimeWarnings,
    rotation_support: HashMap<(PlaneId, u64), bool>,
    hooks: Arc<dyn EngineHooks>,
}

impl fmt::Debug for FramePresenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePresenter")
            .field("use_atomic", &self.use_atomic)
            .field("blocking_commits", &self.blocking_commits)
            .field("has_applied_modeset", &self.has_applied_modeset)
            .field("state", &self.state)
            .finish()
    }
}

impl FramePresenter {
    pub fn new(device: &dyn DisplayDevice, hooks: Arc<dyn EngineHooks>, config: &PresentationConfig) -> Self {
        let use_atomic = device.supports_atomic() && !config.force_legacy_modesetting;
        info!(
            use_atomic,
            blocking_commits = config.blocking_atomic_commits,
            "Frame presenter ready"
        );
        Self {
            use_atomic,
            blocking_commits: config.blocking_atomic_commits,
            has_applied_modeset: false,
            state: FrameState::Idle,
            warnings: OneTimeWarnings::default(),
            rotation_support: HashMap::new(),
            hooks,
        }
    }

    pub fn uses_atomic(&self) -> bool {
        self.use_atomic
    }

    /// Whether atomic commits block. Once set by an `EBUSY`, this never reverts.
    pub fn blocking_commits(&self) -> bool {
        self.blocking_commits
    }

    pub fn has_applied_modeset(&self) -> bool {
        self.has_applied_modeset
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    fn advance(&mut self, next: FrameState) {
        trace!(from = ?self.state, to = ?next, "Frame state");
        self.state = next;
    }

    /// Presents one frame.
    ///
    /// `views` must be locked by the caller for the whole call. Per-layer
    /// problems (no free plane, unknown backing store, failing view callback)
    /// skip that layer; errors probing the device or committing fail the frame.
    pub fn present(
        &mut self,
        layers: &[Layer],
        views: &mut ViewRegistryGuard<'_>,
        device: &mut dyn DisplayDevice,
        gpu: &mut dyn GpuBackend,
        targets: &mut RenderTargetPool,
        stores: &BackingStoreManager,
    ) -> Result<FrameReport> {
        self.advance(FrameState::Idle);
        gpu.make_current()?;

        let mut report = FrameReport::default();
        let assembled = self.assemble(layers, views, device, gpu, targets, stores, &mut report);

        if let Err(e) = gpu.clear_current() {
            warn!("Could not release the GPU context: {}", e);
        }
        let mut request = match assembled {
            Ok(request) => request,
            Err(e) => {
                self.advance(FrameState::Idle);
                return Err(e);
            }
        };

        let result = self.commit(&mut request, device, &mut report);
        self.advance(FrameState::Idle);
        result?;

        if report.synthetic_page_flip {
            self.schedule_synthetic_page_flip();
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &mut self,
        layers: &[Layer],
        views: &mut ViewRegistryGuard<'_>,
        device: &mut dyn DisplayDevice,
        gpu: &mut dyn GpuBackend,
        targets: &mut RenderTargetPool,
        stores: &BackingStoreManager,
        report: &mut FrameReport,
    ) -> Result<CommitRequest> {
        let mut request = self.probe_planes(device)?;
        self.advance(FrameState::PlanesProbed);

        let first_frame = !self.has_applied_modeset;
        if first_frame {
            report.modeset = true;
            if self.use_atomic {
                request.request_modeset();
            }
            self.move_cursor_planes_to_front(&mut request, device);
        }

        let min_zpos = request
            .planes()
            .iter()
            .find(|p| p.plane_type == PlaneType::Primary)
            .and_then(|p| p.zpos)
            .map_or(0, |zpos| zpos.min);

        let transitions = views.classify(layers, min_zpos);
        views.apply_transitions(&transitions, &mut request);
        self.advance(FrameState::ViewsTransitioned);

        let mode = device.mode();
        for (index, layer) in layers.iter().enumerate() {
            let zpos = index as i64 + min_zpos;
            match &layer.content {
                LayerContent::BackingStore(drawable) => {
                    let Some(target_id) = stores.target_of(drawable.id) else {
                        warn!(layer_index = index, store = drawable.id.0, "Layer refers to an unknown backing store");
                        report.skipped_layers.push(index);
                        continue;
                    };
                    let plane_type = if index == 0 { PlaneType::Primary } else { PlaneType::Overlay };
                    let Some(plane) = request.reserve_for_layer(index, plane_type) else {
                        warn!(
                            layer_index = index,
                            ?plane_type,
                            "{}",
                            CompositorError::PlaneExhausted { layer_index: index }
                        );
                        report.skipped_layers.push(index);
                        continue;
                    };
                    let Some(target) = targets.get_mut(target_id) else {
                        warn!(layer_index = index, %target_id, "Backing store lost its render target");
                        self.disable_plane(&mut request, plane.id);
                        report.skipped_layers.push(index);
                        continue;
                    };

                    let rotation = target.scanout_rotation();
                    let fb = match target.prepare_scanout(device, gpu) {
                        Ok(fb) => fb,
                        Err(e) => {
                            warn!(layer_index = index, plane_id = plane.id, "Could not present backing store: {}", e);
                            self.disable_plane(&mut request, plane.id);
                            report.skipped_layers.push(index);
                            continue;
                        }
                    };

                    let placed = if self.use_atomic {
                        self.program_plane_atomic(&mut request, device, &plane, fb, &mode, rotation, zpos);
                        true
                    } else {
                        self.program_plane_legacy(device, &plane, fb, &mode, rotation, zpos, first_frame)
                    };
                    if placed {
                        report.assignments.push(PlaneAssignment {
                            layer_index: index,
                            plane_id: plane.id,
                            plane_type: plane.plane_type,
                            framebuffer: fb,
                        });
                    } else {
                        report.skipped_layers.push(index);
                    }
                }
                LayerContent::PlatformView { view_id, mutations } => {
                    let placement = ViewPlacement {
                        mutations,
                        rect: layer.pixel_rect(),
                        zpos,
                    };
                    match views.present(*view_id, &mut request, &placement) {
                        Ok(true) => report.presented_views.push(*view_id),
                        Ok(false) => trace!(view_id, "Platform view has no present callback"),
                        Err(e) => warn!("{}", e),
                    }
                }
            }
        }

        if self.use_atomic {
            let unused: Vec<PlaneId> = request
                .unreserved_planes()
                .filter(|p| matches!(p.plane_type, PlaneType::Primary | PlaneType::Overlay))
                .map(|p| p.id)
                .collect();
            for plane_id in unused {
                self.disable_plane(&mut request, plane_id);
            }
        }
        self.advance(FrameState::LayersAssigned);
        Ok(request)
    }

    fn probe_planes(&mut self, device: &mut dyn DisplayDevice) -> Result<CommitRequest> {
        let crtc_index = device.crtc_index();
        let planes: Vec<PlaneInfo> = device
            .planes()?
            .into_iter()
            .filter(|p| p.can_attach_to(crtc_index))
            .collect();
        debug!(count = planes.len(), crtc_index, "Probed planes");

        let has_zpos = planes
            .iter()
            .filter(|p| p.plane_type != PlaneType::Cursor)
            .any(|p| p.zpos.map_or(false, |zpos| zpos.is_mutable()));
        if !has_zpos && planes.len() > 1 {
            warn_once(
                &mut self.warnings.zpos,
                "Display planes have no writable zpos property. Plane order follows the driver's intrinsic order.",
            );
        }

        Ok(CommitRequest::new(device.crtc_id(), device.connector_id(), planes))
    }

    /// Puts every cursor plane at its maximum zpos so the cursor draws above all UI.
    fn move_cursor_planes_to_front(&mut self, request: &mut CommitRequest, device: &mut dyn DisplayDevice) {
        let cursors: Vec<PlaneInfo> = request
            .unreserved_planes()
            .filter(|p| p.plane_type == PlaneType::Cursor)
            .cloned()
            .collect();
        for plane in cursors {
            let Some(zpos) = plane.zpos.filter(|zpos| zpos.is_mutable()) else {
                warn_once(
                    &mut self.warnings.cursor_front,
                    "Could not move cursor to front. Mouse cursor may be invisible.",
                );
                continue;
            };
            debug!(plane_id = plane.id, zpos = zpos.max, "Moving cursor plane to front");
            if self.use_atomic {
                request.put_plane_property(plane.id, "zpos", zpos.max as u64);
            } else if let Err(e) = device.set_property(DrmObject::Plane(plane.id), "zpos", zpos.max as u64) {
                warn!(plane_id = plane.id, "Could not move cursor to front: {}", e);
            }
        }
    }

    fn disable_plane(&self, request: &mut CommitRequest, plane_id: PlaneId) {
        if self.use_atomic {
            request.put_plane_property(plane_id, "FB_ID", 0);
            request.put_plane_property(plane_id, "CRTC_ID", 0);
        }
    }

    fn supports_rotation(&mut self, device: &mut dyn DisplayDevice, plane_id: PlaneId, rotation: PlaneRotation) -> bool {
        if let Some(supported) = self.rotation_support.get(&(plane_id, rotation.bits())) {
            return *supported;
        }
        let supported = match device.plane_supports_rotation(plane_id, rotation) {
            Ok(supported) => supported,
            Err(e) => {
                debug!(plane_id, "Rotation probe failed: {}", e);
                false
            }
        };
        self.rotation_support.insert((plane_id, rotation.bits()), supported);
        supported
    }

    /// Decides the rotation and zpos writes for a plane, warning once about
    /// missing support.
    fn plane_extras(
        &mut self,
        device: &mut dyn DisplayDevice,
        plane: &PlaneInfo,
        rotation: PlaneRotation,
        zpos: i64,
    ) -> (Option<u64>, Option<u64>) {
        let rotation = if self.supports_rotation(device, plane.id, rotation) {
            Some(rotation.bits())
        } else {
            if rotation.contains(PlaneRotation::REFLECT_Y) {
                warn_once(
                    &mut self.warnings.rotation,
                    "Display plane does not support reflecting in Y direction. UI drawn in overlay planes will look upside down.",
                );
            }
            None
        };

        let zpos = match plane.zpos {
            Some(range) if range.is_mutable() && range.contains(zpos) => Some(zpos as u64),
            Some(range) if !range.is_mutable() && range.current == zpos => None,
            _ => {
                warn_once(
                    &mut self.warnings.zpos,
                    "Display planes do not support the desired plane order. Some UI layers may be invisible.",
                );
                None
            }
        };
        (rotation, zpos)
    }

    #[allow(clippy::too_many_arguments)]
    fn program_plane_atomic(
        &mut self,
        request: &mut CommitRequest,
        device: &mut dyn DisplayDevice,
        plane: &PlaneInfo,
        fb: FramebufferId,
        mode: &DisplayMode,
        rotation: PlaneRotation,
        zpos: i64,
    ) {
        let geometry = PlaneGeometry::full_screen(mode);
        let crtc_id = request.crtc_id();
        let id = plane.id;
        request.put_plane_property(id, "FB_ID", u64::from(fb));
        request.put_plane_property(id, "CRTC_ID", u64::from(crtc_id));
        request.put_plane_property(id, "SRC_X", u64::from(geometry.src_x));
        request.put_plane_property(id, "SRC_Y", u64::from(geometry.src_y));
        request.put_plane_property(id, "SRC_W", u64::from(geometry.src_w));
        request.put_plane_property(id, "SRC_H", u64::from(geometry.src_h));
        request.put_plane_property(id, "CRTC_X", geometry.crtc_x as u64);
        request.put_plane_property(id, "CRTC_Y", geometry.crtc_y as u64);
        request.put_plane_property(id, "CRTC_W", u64::from(geometry.crtc_w));
        request.put_plane_property(id, "CRTC_H", u64::from(geometry.crtc_h));

        let (rotation, zpos) = self.plane_extras(device, plane, rotation, zpos);
        if let Some(rotation) = rotation {
            request.put_plane_property(id, "rotation", rotation);
        }
        if let Some(zpos) = zpos {
            request.put_plane_property(id, "zpos", zpos);
        }
    }

    /// Shows `fb` on `plane` right away. Returns `false` if the plane could not be updated.
    ///
    /// The mode counts as applied only once `set_crtc` succeeds on the primary plane.
    #[allow(clippy::too_many_arguments)]
    fn program_plane_legacy(
        &mut self,
        device: &mut dyn DisplayDevice,
        plane: &PlaneInfo,
        fb: FramebufferId,
        mode: &DisplayMode,
        rotation: PlaneRotation,
        zpos: i64,
        first_frame: bool,
    ) -> bool {
        let result = match plane.plane_type {
            PlaneType::Primary if first_frame => device.set_crtc(fb).map(|()| self.has_applied_modeset = true),
            PlaneType::Primary => device.page_flip(fb, false),
            _ => device.set_plane(plane.id, fb, &PlaneGeometry::full_screen(mode)),
        };
        if let Err(e) = result {
            warn!(plane_id = plane.id, fb, "Legacy plane update failed: {}", e);
            return false;
        }

        let (rotation, zpos) = self.plane_extras(device, plane, rotation, zpos);
        let object = DrmObject::Plane(plane.id);
        if let Some(rotation) = rotation {
            if let Err(e) = device.set_property(object, "rotation", rotation) {
                warn!(plane_id = plane.id, "Could not set plane rotation: {}", e);
            }
        }
        if let Some(zpos) = zpos {
            if let Err(e) = device.set_property(object, "zpos", zpos) {
                warn!(plane_id = plane.id, "Could not set plane zpos: {}", e);
            }
        }
        true
    }

    fn commit(
        &mut self,
        request: &mut CommitRequest,
        device: &mut dyn DisplayDevice,
        report: &mut FrameReport,
    ) -> Result<()> {
        if !self.use_atomic {
            // Property writes queued by platform views and cursor setup.
            for write in request.writes() {
                if let Err(e) = device.set_property(write.object, &write.name, write.value) {
                    warn!(object = ?write.object, name = %write.name, "Legacy property write failed: {}", e);
                }
            }
            report.blocking = true;
            report.synthetic_page_flip = true;
            self.advance(FrameState::Committed);
            return Ok(());
        }

        let mut base = CommitFlags::empty();
        if request.needs_modeset() {
            base |= CommitFlags::ALLOW_MODESET;
        }

        loop {
            let flags = if self.blocking_commits {
                base
            } else {
                base | CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT
            };
            match device.atomic_commit(request, flags) {
                Ok(()) => break,
                Err(e) if e.is_busy() && !self.blocking_commits => {
                    self.blocking_commits = true;
                    warn_once(
                        &mut self.warnings.busy,
                        "Non-blocking atomic commit failed with EBUSY. Future commits will block, which may affect performance.",
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.has_applied_modeset = true;
        report.blocking = self.blocking_commits;
        report.synthetic_page_flip = self.blocking_commits;
        self.advance(FrameState::Committed);
        Ok(())
    }

    /// Posts a page-flip completion for a commit that produces no kernel event.
    fn schedule_synthetic_page_flip(&self) {
        let now = self.hooks.current_time_ns();
        let sec = (now / 1_000_000_000) as u32;
        let usec = ((now % 1_000_000_000) / 1_000) as u32;
        let hooks = Arc::clone(&self.hooks);
        trace!(sec, usec, "Scheduling synthetic page flip");
        self.hooks
            .post_task(Box::new(move || hooks.page_flip_completed(sec, usec)));
    }
}
