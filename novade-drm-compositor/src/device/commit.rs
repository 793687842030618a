//! Per-frame commit request.
//!
//! A [`CommitRequest`] collects the property writes of one frame together with
//! the planes reserved for it. It is rebuilt every frame; plane reservations
//! never carry over, since the driver's intrinsic plane order is not stable.

use tracing::trace;

use super::{PlaneId, PlaneInfo, PlaneType};
use crate::error::{CompositorError, Result};

/// A kernel mode-setting object that owns properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DrmObject {
    Plane(u32),
    Crtc(u32),
    Connector(u32),
}

/// One pending property write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyWrite {
    pub object: DrmObject,
    pub name: String,
    pub value: u64,
}

/// Who claimed a plane this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneOwner {
    /// The backing-store layer at this index of the frame's layer list.
    Layer(usize),
    /// A platform view callback.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneReservation {
    pub plane_id: PlaneId,
    pub owner: PlaneOwner,
}

/// Property writes and plane reservations for one frame on one display pipe.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    crtc_id: u32,
    connector_id: u32,
    planes: Vec<PlaneInfo>,
    reservations: Vec<PlaneReservation>,
    writes: Vec<PropertyWrite>,
    modeset: bool,
}

impl CommitRequest {
    /// Starts an empty request over the planes usable with `crtc_id`.
    pub fn new(crtc_id: u32, connector_id: u32, planes: Vec<PlaneInfo>) -> Self {
        Self {
            crtc_id,
            connector_id,
            planes,
            reservations: Vec::new(),
            writes: Vec::new(),
            modeset: false,
        }
    }

    pub fn crtc_id(&self) -> u32 {
        self.crtc_id
    }

    pub fn connector_id(&self) -> u32 {
        self.connector_id
    }

    /// All planes usable this frame, in driver enumeration order.
    pub fn planes(&self) -> &[PlaneInfo] {
        &self.planes
    }

    pub fn plane(&self, plane_id: PlaneId) -> Option<&PlaneInfo> {
        self.planes.iter().find(|p| p.id == plane_id)
    }

    pub fn is_reserved(&self, plane_id: PlaneId) -> bool {
        self.reservations.iter().any(|r| r.plane_id == plane_id)
    }

    pub fn unreserved_planes(&self) -> impl Iterator<Item = &PlaneInfo> + '_ {
        self.planes.iter().filter(move |p| !self.is_reserved(p.id))
    }

    pub fn reservations(&self) -> &[PlaneReservation] {
        &self.reservations
    }

    /// Claims `plane_id` for the rest of this frame.
    pub fn reserve_plane(&mut self, plane_id: PlaneId, owner: PlaneOwner) -> Result<()> {
        if self.plane(plane_id).is_none() {
            return Err(CompositorError::InvalidArgument(format!(
                "plane {} is not usable on crtc {}",
                plane_id, self.crtc_id
            )));
        }
        if self.is_reserved(plane_id) {
            return Err(CompositorError::InvalidState(format!(
                "plane {} is already reserved this frame",
                plane_id
            )));
        }
        self.reservations.push(PlaneReservation { plane_id, owner });
        Ok(())
    }

    /// The plane's stacking position as the driver sets it up: the current
    /// `zpos` value, or the enumeration index for planes without one.
    fn intrinsic_zpos(&self, plane: &PlaneInfo) -> i64 {
        match plane.zpos {
            Some(zpos) => zpos.current,
            None => self
                .planes
                .iter()
                .position(|p| p.id == plane.id)
                .map_or(0, |index| index as i64),
        }
    }

    /// Reserves a free plane of `plane_type` for the backing-store layer at `layer_index`.
    ///
    /// Layers arrive back to front, so the preferred plane is the lowest one
    /// that already stacks above every plane reserved for earlier layers.
    /// Writing `zpos` is not honoured by every driver; picking a plane whose
    /// intrinsic order already fits keeps the stacking right regardless.
    /// Without such a plane any free plane of the type is taken.
    pub fn reserve_for_layer(&mut self, layer_index: usize, plane_type: PlaneType) -> Option<PlaneInfo> {
        let floor = self
            .reservations
            .iter()
            .filter(|r| matches!(r.owner, PlaneOwner::Layer(_)))
            .filter_map(|r| self.plane(r.plane_id))
            .map(|p| self.intrinsic_zpos(p))
            .max();

        let mut candidates: Vec<(i64, PlaneInfo)> = self
            .unreserved_planes()
            .filter(|p| p.plane_type == plane_type)
            .map(|p| (self.intrinsic_zpos(p), p.clone()))
            .collect();
        candidates.sort_by_key(|(zpos, _)| *zpos);

        let chosen = candidates
            .iter()
            .find(|(zpos, _)| floor.map_or(true, |floor| *zpos > floor))
            .or_else(|| candidates.first())
            .map(|(_, plane)| plane.clone())?;

        trace!(layer_index, plane_id = chosen.id, ?plane_type, "Reserved plane for layer");
        self.reservations.push(PlaneReservation {
            plane_id: chosen.id,
            owner: PlaneOwner::Layer(layer_index),
        });
        Some(chosen)
    }

    /// Queues a property write. A later write of the same property replaces the earlier one.
    pub fn put_property(&mut self, object: DrmObject, name: &str, value: u64) {
        if let Some(existing) = self
            .writes
            .iter_mut()
            .find(|w| w.object == object && w.name == name)
        {
            existing.value = value;
            return;
        }
        self.writes.push(PropertyWrite {
            object,
            name: name.to_string(),
            value,
        });
    }

    pub fn put_plane_property(&mut self, plane_id: PlaneId, name: &str, value: u64) {
        self.put_property(DrmObject::Plane(plane_id), name, value);
    }

    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    /// The value queued for a property, if any.
    pub fn property(&self, object: DrmObject, name: &str) -> Option<u64> {
        self.writes
            .iter()
            .find(|w| w.object == object && w.name == name)
            .map(|w| w.value)
    }

    /// Asks the device to (re)program the mode together with this commit.
    pub fn request_modeset(&mut self) {
        self.modeset = true;
    }

    pub fn needs_modeset(&self) -> bool {
        self.modeset
    }
}
