//! [`DisplayDevice`] on top of the `drm` crate.
//!
//! Opens a DRM card node, enables universal planes and (if possible) atomic
//! modesetting, and drives the first connected connector with its preferred
//! mode.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::{
    atomic::AtomicModeReq, connector, crtc, dumbbuffer, framebuffer, plane, property, AtomicCommitFlags,
    Device as ControlDevice, Event, Mode, ModeTypeFlags, PageFlipFlags,
};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use tracing::{debug, info, warn};

use super::{
    CommitFlags, CommitRequest, DisplayDevice, DisplayMode, DrmObject, DumbBuffer, FramebufferId, FramebufferSpec,
    PlaneGeometry, PlaneId, PlaneInfo, PlaneRotation, PlaneType, ZposInfo,
};
use crate::error::{CompositorError, Result};

/// An open DRM card node.
#[derive(Debug)]
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

/// A buffer described only by its GEM handle, for `add_framebuffer`.
struct ImportedBuffer {
    spec: FramebufferSpec,
    handle: drm::buffer::Handle,
}

impl Buffer for ImportedBuffer {
    fn size(&self) -> (u32, u32) {
        (self.spec.width, self.spec.height)
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::try_from(self.spec.format).unwrap_or(DrmFourcc::Argb8888)
    }

    fn pitch(&self) -> u32 {
        self.spec.pitch
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handle
    }
}

fn handle_from<T: From<drm::control::RawResourceHandle>>(raw: u32, what: &'static str) -> Result<T> {
    drm::control::from_u32(raw).ok_or_else(|| CompositorError::from_errno(what, libc::EINVAL))
}

/// The kernel display device.
pub struct DrmDisplayDevice {
    card: Card,
    atomic: bool,
    crtc: crtc::Handle,
    crtc_index: u32,
    connector: connector::Handle,
    mode: Mode,
    property_handles: HashMap<(DrmObject, String), property::Handle>,
    dumb_buffers: HashMap<u32, dumbbuffer::DumbBuffer>,
}

impl std::fmt::Debug for DrmDisplayDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDisplayDevice")
            .field("atomic", &self.atomic)
            .field("crtc", &self.crtc)
            .field("connector", &self.connector)
            .field("mode", &self.mode.size())
            .finish()
    }
}

impl DrmDisplayDevice {
    /// Opens `path` (e.g. `/dev/dri/card0`) and selects the display pipe.
    ///
    /// With `force_legacy` the atomic capability is not requested.
    pub fn open(path: impl AsRef<Path>, force_legacy: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CompositorError::device("open card", e))?;
        let card = Card(file);

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|e| CompositorError::device("enable universal planes", e))?;
        let atomic = !force_legacy && card.set_client_capability(ClientCapability::Atomic, true).is_ok();
        if !atomic {
            info!(path = %path.display(), "Using legacy modesetting");
        }

        let resources = card
            .resource_handles()
            .map_err(|e| CompositorError::device("get resources", e))?;

        let mut selected = None;
        for handle in resources.connectors() {
            let info = card
                .get_connector(*handle, true)
                .map_err(|e| CompositorError::device("get connector", e))?;
            if info.state() != connector::State::Connected {
                continue;
            }
            let preferred = info
                .modes()
                .iter()
                .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
                .or_else(|| info.modes().first());
            if let Some(mode) = preferred {
                selected = Some((info.clone(), *mode));
                break;
            }
        }
        let (connector_info, mode) = selected.ok_or_else(|| CompositorError::from_errno("find connector", libc::ENODEV))?;

        let encoder_crtc = connector_info
            .current_encoder()
            .and_then(|encoder| card.get_encoder(encoder).ok())
            .and_then(|encoder| encoder.crtc());
        let crtc = encoder_crtc
            .or_else(|| resources.crtcs().first().copied())
            .ok_or_else(|| CompositorError::from_errno("find crtc", libc::ENODEV))?;
        let crtc_index = resources
            .crtcs()
            .iter()
            .position(|c| *c == crtc)
            .map_or(0, |index| index as u32);

        let (width, height) = mode.size();
        info!(
            connector = ?connector_info.handle(),
            ?crtc,
            width,
            height,
            refresh = mode.vrefresh(),
            atomic,
            "Selected display pipe"
        );

        Ok(Self {
            card,
            atomic,
            crtc,
            crtc_index,
            connector: connector_info.handle(),
            mode,
            property_handles: HashMap::new(),
            dumb_buffers: HashMap::new(),
        })
    }

    /// Reads pending kernel events and returns the `(sec, usec)` of each page flip.
    pub fn read_page_flip_events(&self) -> Result<Vec<(u32, u32)>> {
        let events = self
            .card
            .receive_events()
            .map_err(|e| CompositorError::device("receive events", e))?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(flip) => Some((flip.duration.as_secs() as u32, flip.duration.subsec_micros())),
                _ => None,
            })
            .collect())
    }

    fn raw_object(object: DrmObject) -> u32 {
        match object {
            DrmObject::Plane(id) | DrmObject::Crtc(id) | DrmObject::Connector(id) => id,
        }
    }

    fn properties_of(&self, object: DrmObject) -> Result<drm::control::PropertyValueSet> {
        let result = match object {
            DrmObject::Plane(id) => self.card.get_properties(handle_from::<plane::Handle>(id, "get properties")?),
            DrmObject::Crtc(id) => self.card.get_properties(handle_from::<crtc::Handle>(id, "get properties")?),
            DrmObject::Connector(id) => self
                .card
                .get_properties(handle_from::<connector::Handle>(id, "get properties")?),
        };
        result.map_err(|e| CompositorError::device("get properties", e))
    }

    /// Looks up a property by name, returning its handle, info and current value.
    fn find_property(&self, object: DrmObject, name: &str) -> Result<Option<(property::Handle, property::Info, u64)>> {
        let props = self.properties_of(object)?;
        let (handles, values) = props.as_props_and_values();
        for (handle, value) in handles.iter().zip(values.iter()) {
            let info = self
                .card
                .get_property(*handle)
                .map_err(|e| CompositorError::device("get property", e))?;
            if info.name().to_bytes() == name.as_bytes() {
                return Ok(Some((*handle, info, *value)));
            }
        }
        Ok(None)
    }

    fn property_handle(&mut self, object: DrmObject, name: &str) -> Result<property::Handle> {
        if let Some(handle) = self.property_handles.get(&(object, name.to_string())) {
            return Ok(*handle);
        }
        let (handle, _, _) = self.find_property(object, name)?.ok_or_else(|| {
            debug!(?object, name, "Property not found");
            CompositorError::from_errno("find property", libc::ENOENT)
        })?;
        self.property_handles.insert((object, name.to_string()), handle);
        Ok(handle)
    }

    fn add_to_request(
        &mut self,
        req: &mut AtomicModeReq,
        object: DrmObject,
        name: &str,
        value: property::Value<'static>,
    ) -> Result<()> {
        let prop = self.property_handle(object, name)?;
        match object {
            DrmObject::Plane(id) => req.add_property(handle_from::<plane::Handle>(id, "atomic commit")?, prop, value),
            DrmObject::Crtc(id) => req.add_property(handle_from::<crtc::Handle>(id, "atomic commit")?, prop, value),
            DrmObject::Connector(id) => {
                req.add_property(handle_from::<connector::Handle>(id, "atomic commit")?, prop, value)
            }
        }
        Ok(())
    }

    fn build_request(&mut self, request: &CommitRequest) -> Result<AtomicModeReq> {
        let mut req = AtomicModeReq::new();
        if request.needs_modeset() {
            let blob = self
                .card
                .create_property_blob(&self.mode)
                .map_err(|e| CompositorError::device("create mode blob", e))?;
            let connector = DrmObject::Connector(request.connector_id());
            let crtc = DrmObject::Crtc(request.crtc_id());
            self.add_to_request(
                &mut req,
                connector,
                "CRTC_ID",
                property::Value::UnsignedRange(u64::from(request.crtc_id())),
            )?;
            self.add_to_request(&mut req, crtc, "MODE_ID", blob)?;
            self.add_to_request(&mut req, crtc, "ACTIVE", property::Value::Boolean(true))?;
        }
        for write in request.writes() {
            self.add_to_request(&mut req, write.object, &write.name, property::Value::UnsignedRange(write.value))?;
        }
        Ok(req)
    }

    fn framebuffer(fb: FramebufferId) -> Option<framebuffer::Handle> {
        drm::control::from_u32(fb)
    }
}

fn commit_flags(flags: CommitFlags) -> AtomicCommitFlags {
    let mut out = AtomicCommitFlags::empty();
    if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
        out |= AtomicCommitFlags::PAGE_FLIP_EVENT;
    }
    if flags.contains(CommitFlags::TEST_ONLY) {
        out |= AtomicCommitFlags::TEST_ONLY;
    }
    if flags.contains(CommitFlags::NONBLOCK) {
        out |= AtomicCommitFlags::NONBLOCK;
    }
    if flags.contains(CommitFlags::ALLOW_MODESET) {
        out |= AtomicCommitFlags::ALLOW_MODESET;
    }
    out
}

impl DisplayDevice for DrmDisplayDevice {
    fn supports_atomic(&self) -> bool {
        self.atomic
    }

    fn crtc_id(&self) -> u32 {
        u32::from(self.crtc)
    }

    fn crtc_index(&self) -> u32 {
        self.crtc_index
    }

    fn connector_id(&self) -> u32 {
        u32::from(self.connector)
    }

    fn mode(&self) -> DisplayMode {
        let (width, height) = self.mode.size();
        DisplayMode {
            width: u32::from(width),
            height: u32::from(height),
            refresh: self.mode.vrefresh(),
        }
    }

    fn planes(&mut self) -> Result<Vec<PlaneInfo>> {
        let resources = self
            .card
            .resource_handles()
            .map_err(|e| CompositorError::device("get resources", e))?;
        let handles = self
            .card
            .plane_handles()
            .map_err(|e| CompositorError::device("get planes", e))?;

        let mut planes = Vec::with_capacity(handles.len());
        for handle in handles {
            let info = self
                .card
                .get_plane(handle)
                .map_err(|e| CompositorError::device("get plane", e))?;
            let id = u32::from(handle);
            let object = DrmObject::Plane(id);

            let plane_type = match self.find_property(object, "type")? {
                Some((_, _, value)) if value == drm::control::PlaneType::Primary as u64 => PlaneType::Primary,
                Some((_, _, value)) if value == drm::control::PlaneType::Cursor as u64 => PlaneType::Cursor,
                _ => PlaneType::Overlay,
            };

            let zpos = match self.find_property(object, "zpos")? {
                Some((_, info, current)) => match info.value_type() {
                    property::ValueType::UnsignedRange(min, max) => Some(ZposInfo {
                        current: current as i64,
                        min: min as i64,
                        max: max as i64,
                    }),
                    property::ValueType::SignedRange(min, max) => Some(ZposInfo {
                        current: current as i64,
                        min,
                        max,
                    }),
                    _ => None,
                },
                None => None,
            };

            let possible_crtcs = resources
                .filter_crtcs(info.possible_crtcs())
                .iter()
                .filter_map(|c| resources.crtcs().iter().position(|all| all == c))
                .fold(0u32, |mask, index| mask | (1 << index));

            planes.push(PlaneInfo {
                id,
                plane_type,
                possible_crtcs,
                zpos,
            });
        }
        Ok(planes)
    }

    fn plane_supports_rotation(&mut self, plane_id: PlaneId, rotation: PlaneRotation) -> Result<bool> {
        let object = DrmObject::Plane(plane_id);
        if self.find_property(object, "rotation")?.is_none() {
            return Ok(false);
        }
        if !self.atomic {
            return Ok(true);
        }
        let mut req = AtomicModeReq::new();
        self.add_to_request(&mut req, object, "rotation", property::Value::UnsignedRange(rotation.bits()))?;
        match self.card.atomic_commit(AtomicCommitFlags::TEST_ONLY, req) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(false),
            Err(e) => Err(CompositorError::device("probe rotation", e)),
        }
    }

    fn atomic_commit(&mut self, request: &CommitRequest, flags: CommitFlags) -> Result<()> {
        let req = self.build_request(request)?;
        self.card
            .atomic_commit(commit_flags(flags), req)
            .map_err(|e| CompositorError::device("atomic commit", e))
    }

    fn set_crtc(&mut self, fb: FramebufferId) -> Result<()> {
        self.card
            .set_crtc(self.crtc, Self::framebuffer(fb), (0, 0), &[self.connector], Some(self.mode))
            .map_err(|e| CompositorError::device("set crtc", e))
    }

    fn page_flip(&mut self, fb: FramebufferId, request_event: bool) -> Result<()> {
        let fb = Self::framebuffer(fb).ok_or_else(|| CompositorError::from_errno("page flip", libc::EINVAL))?;
        let flags = if request_event {
            PageFlipFlags::EVENT
        } else {
            PageFlipFlags::empty()
        };
        self.card
            .page_flip(self.crtc, fb, flags, None)
            .map_err(|e| CompositorError::device("page flip", e))
    }

    fn set_plane(&mut self, plane_id: PlaneId, fb: FramebufferId, geometry: &PlaneGeometry) -> Result<()> {
        let plane = handle_from::<plane::Handle>(plane_id, "set plane")?;
        self.card
            .set_plane(
                plane,
                self.crtc,
                Self::framebuffer(fb),
                0,
                (geometry.crtc_x, geometry.crtc_y, geometry.crtc_w, geometry.crtc_h),
                (geometry.src_x, geometry.src_y, geometry.src_w, geometry.src_h),
            )
            .map_err(|e| CompositorError::device("set plane", e))
    }

    fn set_property(&mut self, object: DrmObject, name: &str, value: u64) -> Result<()> {
        let prop = self.property_handle(object, name)?;
        let raw = property::RawValue::from(value);
        let result = match object {
            DrmObject::Plane(id) => self
                .card
                .set_property(handle_from::<plane::Handle>(id, "set property")?, prop, raw),
            DrmObject::Crtc(id) => self
                .card
                .set_property(handle_from::<crtc::Handle>(id, "set property")?, prop, raw),
            DrmObject::Connector(id) => {
                self.card
                    .set_property(handle_from::<connector::Handle>(id, "set property")?, prop, raw)
            }
        };
        result.map_err(|e| {
            debug!(object = Self::raw_object(object), name, value, "Legacy property write failed");
            CompositorError::device("set property", e)
        })
    }

    fn add_framebuffer(&mut self, spec: &FramebufferSpec) -> Result<FramebufferId> {
        let buffer = ImportedBuffer {
            spec: *spec,
            handle: handle_from(spec.handle, "add framebuffer")?,
        };
        let fb = self
            .card
            .add_framebuffer(&buffer, 32, 32)
            .map_err(|e| CompositorError::device("add framebuffer", e))?;
        Ok(u32::from(fb))
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()> {
        let handle = Self::framebuffer(fb).ok_or_else(|| CompositorError::from_errno("remove framebuffer", libc::EINVAL))?;
        self.card
            .destroy_framebuffer(handle)
            .map_err(|e| CompositorError::device("remove framebuffer", e))
    }

    fn dumb_buffer_preferred_depth(&self) -> Result<Option<u32>> {
        let supported = self
            .card
            .get_driver_capability(DriverCapability::DumbBuffer)
            .map_err(|e| CompositorError::device("query dumb buffer support", e))?;
        if supported == 0 {
            return Ok(None);
        }
        let depth = self
            .card
            .get_driver_capability(DriverCapability::DumbPreferredDepth)
            .map_err(|e| CompositorError::device("query preferred depth", e))?;
        Ok(Some(depth as u32))
    }

    fn create_dumb_buffer(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        let buffer = self
            .card
            .create_dumb_buffer((width, height), DrmFourcc::Argb8888, bpp)
            .map_err(|e| CompositorError::device("create dumb buffer", e))?;
        let handle = u32::from(buffer.handle());
        let pitch = buffer.pitch();
        let dumb = DumbBuffer {
            handle,
            width,
            height,
            pitch,
            size: u64::from(pitch) * u64::from(height),
            bpp,
        };
        self.dumb_buffers.insert(handle, buffer);
        Ok(dumb)
    }

    fn write_dumb_buffer(&mut self, buffer: &DumbBuffer, data: &[u8]) -> Result<()> {
        let dumb = self
            .dumb_buffers
            .get_mut(&buffer.handle)
            .ok_or_else(|| CompositorError::InvalidArgument(format!("unknown dumb buffer {}", buffer.handle)))?;
        let mut mapping = self
            .card
            .map_dumb_buffer(dumb)
            .map_err(|e| CompositorError::device("map dumb buffer", e))?;
        let target: &mut [u8] = &mut mapping[..];
        if data.len() > target.len() {
            return Err(CompositorError::InvalidArgument(format!(
                "{} bytes do not fit into a {} byte dumb buffer",
                data.len(),
                target.len()
            )));
        }
        target[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy_dumb_buffer(&mut self, buffer: DumbBuffer) -> Result<()> {
        match self.dumb_buffers.remove(&buffer.handle) {
            Some(dumb) => self
                .card
                .destroy_dumb_buffer(dumb)
                .map_err(|e| CompositorError::device("destroy dumb buffer", e)),
            None => {
                warn!(handle = buffer.handle, "Destroying unknown dumb buffer");
                Ok(())
            }
        }
    }

    #[allow(deprecated)]
    fn set_cursor(&mut self, buffer: Option<&DumbBuffer>, hotspot: (i32, i32)) -> Result<()> {
        let dumb = match buffer {
            Some(buffer) => Some(
                self.dumb_buffers
                    .get(&buffer.handle)
                    .ok_or_else(|| CompositorError::InvalidArgument(format!("unknown dumb buffer {}", buffer.handle)))?,
            ),
            None => None,
        };
        self.card
            .set_cursor2(self.crtc, dumb, hotspot)
            .map_err(|e| CompositorError::device("set cursor", e))
    }

    #[allow(deprecated)]
    fn move_cursor(&mut self, x: i32, y: i32) -> Result<()> {
        self.card
            .move_cursor(self.crtc, (x, y))
            .map_err(|e| CompositorError::device("move cursor", e))
    }
}
