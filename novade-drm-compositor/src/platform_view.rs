//! Platform views: externally rendered content in the layer list.
//!
//! A platform view owner registers a set of callbacks per view id. Every frame
//! the presenter classifies the registered views against the frame's layers
//! and applies the resulting lifecycle transitions:
//!
//! * **unmount**: the view was present last frame and is gone now,
//! * **update**: the view is still present but its z position, geometry or
//!   mutation stack changed,
//! * **mount**: the view appears for the first time (or again).
//!
//! Transitions are always applied in that order: unmounts first so that a
//! disappearing view never overlaps a newly mounted one, and updates before
//! mounts so that new views see the final placement of the others.
//!
//! All registry state sits behind one mutex. The presenter holds it from
//! classification until the commit is issued, so a registration made
//! concurrently is either fully part of a frame or deferred to the next one.
//! Callbacks run with the lock held and must not call back into the registry.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::device::CommitRequest;
use crate::error::{CompositorError, Result};
use crate::types::{Layer, LayerContent, Mutation, PixelRect, Point, Size, ViewId};

/// Opaque data handed back to every callback of a view.
pub type ViewUserData = Arc<dyn Any + Send + Sync>;

/// Where a view is shown this frame, as passed to the callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewPlacement<'a> {
    /// The view's transform/clip stack, outermost first.
    pub mutations: &'a [Mutation],
    /// Destination rectangle, rounded to whole pixels.
    pub rect: PixelRect,
    pub zpos: i64,
}

/// Mount, update and present callback.
pub type PlacementCallback =
    Box<dyn FnMut(ViewId, &mut CommitRequest, &ViewPlacement<'_>, Option<&ViewUserData>) -> Result<()> + Send>;
/// Unmount callback.
pub type UnmountCallback = Box<dyn FnMut(ViewId, &mut CommitRequest, Option<&ViewUserData>) -> Result<()> + Send>;

/// The callbacks of one platform view. Every callback is optional.
#[derive(Default)]
pub struct ViewCallbacks {
    mount: Option<PlacementCallback>,
    unmount: Option<UnmountCallback>,
    update: Option<PlacementCallback>,
    present: Option<PlacementCallback>,
}

impl ViewCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_mount<F>(mut self, callback: F) -> Self
    where
        F: FnMut(ViewId, &mut CommitRequest, &ViewPlacement<'_>, Option<&ViewUserData>) -> Result<()> + Send + 'static,
    {
        self.mount = Some(Box::new(callback));
        self
    }

    pub fn on_unmount<F>(mut self, callback: F) -> Self
    where
        F: FnMut(ViewId, &mut CommitRequest, Option<&ViewUserData>) -> Result<()> + Send + 'static,
    {
        self.unmount = Some(Box::new(callback));
        self
    }

    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: FnMut(ViewId, &mut CommitRequest, &ViewPlacement<'_>, Option<&ViewUserData>) -> Result<()> + Send + 'static,
    {
        self.update = Some(Box::new(callback));
        self
    }

    pub fn on_present<F>(mut self, callback: F) -> Self
    where
        F: FnMut(ViewId, &mut CommitRequest, &ViewPlacement<'_>, Option<&ViewUserData>) -> Result<()> + Send + 'static,
    {
        self.present = Some(Box::new(callback));
        self
    }

    pub fn has_update(&self) -> bool {
        self.update.is_some()
    }
}

impl fmt::Debug for ViewCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewCallbacks")
            .field("mount", &self.mount.is_some())
            .field("unmount", &self.unmount.is_some())
            .field("update", &self.update.is_some())
            .field("present", &self.present.is_some())
            .finish()
    }
}

/// A view's z position, geometry and mutations in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewFrame {
    pub zpos: i64,
    pub offset: Point,
    pub size: Size,
    pub mutations: Vec<Mutation>,
}

impl ViewFrame {
    fn placement(&self) -> ViewPlacement<'_> {
        ViewPlacement {
            mutations: &self.mutations,
            rect: PixelRect::from_offset_and_size(self.offset, self.size),
            zpos: self.zpos,
        }
    }
}

struct Registration {
    callbacks: ViewCallbacks,
    userdata: Option<ViewUserData>,
    was_present: bool,
    /// What the view looked like when it was last mounted or updated.
    snapshot: Option<ViewFrame>,
}

/// The lifecycle transitions of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transitions {
    pub unmounted: Vec<ViewId>,
    pub updated: Vec<ViewId>,
    pub mounted: Vec<ViewId>,
    frames: BTreeMap<ViewId, ViewFrame>,
}

impl Transitions {
    pub fn is_empty(&self) -> bool {
        self.unmounted.is_empty() && self.updated.is_empty() && self.mounted.is_empty()
    }

    /// This frame's placement of a mounted or updated view.
    pub fn frame(&self, view_id: ViewId) -> Option<&ViewFrame> {
        self.frames.get(&view_id)
    }
}

/// Thread-safe registry of platform view callbacks. Clones share the same registry.
#[derive(Clone, Default)]
pub struct PlatformViewRegistry {
    views: Arc<Mutex<BTreeMap<ViewId, Registration>>>,
}

impl fmt::Debug for PlatformViewRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformViewRegistry").field("len", &self.len()).finish()
    }
}

impl PlatformViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn views(&self) -> Result<MutexGuard<'_, BTreeMap<ViewId, Registration>>> {
        self.views
            .lock()
            .map_err(|_| CompositorError::poisoned("platform view registry"))
    }

    /// Registers or replaces the callbacks of `view_id`.
    ///
    /// Replacing keeps the view's presence and snapshot, so re-registering a
    /// mounted view does not mount it again.
    pub fn register(&self, view_id: ViewId, callbacks: ViewCallbacks, userdata: Option<ViewUserData>) -> Result<()> {
        let mut views = self.views()?;
        match views.get_mut(&view_id) {
            Some(registration) => {
                registration.callbacks = callbacks;
                registration.userdata = userdata;
                debug!(view_id, "Replaced platform view callbacks");
            }
            None => {
                views.insert(
                    view_id,
                    Registration {
                        callbacks,
                        userdata,
                        was_present: false,
                        snapshot: None,
                    },
                );
                debug!(view_id, "Registered platform view callbacks");
            }
        }
        Ok(())
    }

    /// Removes the callbacks of `view_id`.
    pub fn unregister(&self, view_id: ViewId) -> Result<()> {
        match self.views()?.remove(&view_id) {
            Some(_) => {
                debug!(view_id, "Removed platform view callbacks");
                Ok(())
            }
            None => Err(CompositorError::NotFound(view_id)),
        }
    }

    pub fn contains(&self, view_id: ViewId) -> bool {
        match self.views.lock() {
            Ok(views) => views.contains_key(&view_id),
            Err(poisoned) => poisoned.into_inner().contains_key(&view_id),
        }
    }

    pub fn len(&self) -> usize {
        match self.views.lock() {
            Ok(views) => views.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the registry for one frame.
    pub fn lock(&self) -> Result<ViewRegistryGuard<'_>> {
        Ok(ViewRegistryGuard { views: self.views()? })
    }
}

/// Exclusive access to the registry for the duration of one frame.
pub struct ViewRegistryGuard<'a> {
    views: MutexGuard<'a, BTreeMap<ViewId, Registration>>,
}

impl ViewRegistryGuard<'_> {
    /// Compares every registered view against `layers` and records the result.
    ///
    /// A view's z position is its layer index plus `zpos_base`. Presence and
    /// snapshots are updated immediately, so classifying the same layer list
    /// twice yields no transitions the second time. The snapshot of a view
    /// present in both frames is refreshed even without an update callback;
    /// only views with one are reported as updated.
    pub fn classify(&mut self, layers: &[Layer], zpos_base: i64) -> Transitions {
        let mut present: BTreeMap<ViewId, ViewFrame> = BTreeMap::new();
        for (index, layer) in layers.iter().enumerate() {
            if let LayerContent::PlatformView { view_id, mutations } = &layer.content {
                present.entry(*view_id).or_insert_with(|| ViewFrame {
                    zpos: index as i64 + zpos_base,
                    offset: layer.offset,
                    size: layer.size,
                    mutations: mutations.clone(),
                });
            }
        }

        let mut transitions = Transitions::default();
        for (view_id, registration) in self.views.iter_mut() {
            match (present.remove(view_id), registration.was_present) {
                (None, true) => {
                    transitions.unmounted.push(*view_id);
                    registration.was_present = false;
                    registration.snapshot = None;
                }
                (None, false) => {}
                (Some(frame), true) => {
                    let changed = registration.snapshot.as_ref() != Some(&frame);
                    if changed {
                        if registration.callbacks.has_update() {
                            transitions.updated.push(*view_id);
                            transitions.frames.insert(*view_id, frame.clone());
                        }
                        registration.snapshot = Some(frame);
                    }
                }
                (Some(frame), false) => {
                    transitions.mounted.push(*view_id);
                    transitions.frames.insert(*view_id, frame.clone());
                    registration.was_present = true;
                    registration.snapshot = Some(frame);
                }
            }
        }

        if !transitions.is_empty() {
            trace!(
                unmounted = ?transitions.unmounted,
                updated = ?transitions.updated,
                mounted = ?transitions.mounted,
                "Classified platform views"
            );
        }
        transitions
    }

    /// Runs the callbacks for `transitions`: every unmount, then every update,
    /// then every mount. A failing callback is logged and does not stop the others.
    ///
    /// Returns the number of failed callbacks.
    pub fn apply_transitions(&mut self, transitions: &Transitions, request: &mut CommitRequest) -> usize {
        let mut failures = 0;

        for view_id in &transitions.unmounted {
            let Some(registration) = self.views.get_mut(view_id) else { continue };
            if let Some(unmount) = registration.callbacks.unmount.as_mut() {
                if let Err(e) = unmount(*view_id, &mut *request, registration.userdata.as_ref()) {
                    failures += 1;
                    warn!("{}", callback_error(*view_id, "unmount", e));
                }
            }
        }

        for view_id in &transitions.updated {
            let (Some(registration), Some(frame)) = (self.views.get_mut(view_id), transitions.frame(*view_id)) else {
                continue;
            };
            if let Some(update) = registration.callbacks.update.as_mut() {
                if let Err(e) = update(*view_id, &mut *request, &frame.placement(), registration.userdata.as_ref()) {
                    failures += 1;
                    warn!("{}", callback_error(*view_id, "update", e));
                }
            }
        }

        for view_id in &transitions.mounted {
            let (Some(registration), Some(frame)) = (self.views.get_mut(view_id), transitions.frame(*view_id)) else {
                continue;
            };
            if let Some(mount) = registration.callbacks.mount.as_mut() {
                if let Err(e) = mount(*view_id, &mut *request, &frame.placement(), registration.userdata.as_ref()) {
                    failures += 1;
                    warn!("{}", callback_error(*view_id, "mount", e));
                }
            }
        }

        failures
    }

    /// Runs the present callback of `view_id`.
    ///
    /// Returns `Ok(false)` if the view is not registered or has no present callback.
    pub fn present(&mut self, view_id: ViewId, request: &mut CommitRequest, placement: &ViewPlacement<'_>) -> Result<bool> {
        let Some(registration) = self.views.get_mut(&view_id) else {
            return Ok(false);
        };
        let Some(present) = registration.callbacks.present.as_mut() else {
            return Ok(false);
        };
        present(view_id, &mut *request, placement, registration.userdata.as_ref())
            .map_err(|e| callback_error(view_id, "present", e))?;
        Ok(true)
    }
}

fn callback_error(view_id: ViewId, operation: &'static str, error: CompositorError) -> CompositorError {
    CompositorError::Callback {
        view_id,
        operation,
        reason: error.to_string(),
    }
}
