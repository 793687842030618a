//! Recording mocks shared by the unit tests.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{
    CommitFlags, CommitRequest, DisplayDevice, DisplayMode, DrmObject, DumbBuffer, FramebufferId, FramebufferSpec,
    PlaneGeometry, PlaneId, PlaneInfo, PlaneRotation, PlaneType, PropertyWrite, ZposInfo, FORMAT_ARGB8888,
};
use crate::error::{CompositorError, Result};
use crate::gpu::{GlFramebufferId, GpuBackend, GpuImage, RenderbufferId, SurfaceBuffer};
use crate::presenter::EngineHooks;

const CRTC_ID: u32 = 40;
const CONNECTOR_ID: u32 = 50;
const CURSOR_PLANE: PlaneId = 34;
const FOREIGN_PLANE: PlaneId = 35;

/// A device call other than an atomic commit.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    SetCrtc(FramebufferId),
    PageFlip(FramebufferId),
    SetPlane { plane: PlaneId, fb: FramebufferId },
    SetProperty { object: DrmObject, name: String, value: u64 },
    AddFramebuffer(FramebufferId),
    RemoveFramebuffer(FramebufferId),
    CreateDumb { width: u32, height: u32, bpp: u32 },
    WriteDumb { handle: u32, len: usize },
    DestroyDumb(u32),
    SetCursor(Option<u32>, (i32, i32)),
    MoveCursor(i32, i32),
}

/// An atomic commit as the device received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommit {
    pub flags: CommitFlags,
    pub modeset: bool,
    pub writes: Vec<PropertyWrite>,
}

impl RecordedCommit {
    pub fn property(&self, object: DrmObject, name: &str) -> Option<u64> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.object == object && w.name == name)
            .map(|w| w.value)
    }
}

fn plane(id: PlaneId, plane_type: PlaneType, possible_crtcs: u32, current: i64) -> PlaneInfo {
    PlaneInfo {
        id,
        plane_type,
        possible_crtcs,
        zpos: Some(ZposInfo { current, min: 0, max: 7 }),
    }
}

/// An 800x480 display with one primary, three overlay and one cursor plane on
/// CRTC 0, plus an overlay plane that only fits CRTC 1.
#[derive(Debug)]
pub struct MockDevice {
    pub atomic: bool,
    pub planes: Vec<PlaneInfo>,
    pub calls: Vec<DeviceCall>,
    pub framebuffers: HashMap<FramebufferId, FramebufferSpec>,
    pub dumb_buffers: HashMap<u32, DumbBuffer>,
    pub dumb_contents: HashMap<u32, Vec<u8>>,
    /// The n-th (1-based) `add_framebuffer` call fails.
    pub fail_add_framebuffer_at: Option<usize>,
    pub rotation_supported: bool,
    /// The next n non-blocking commits fail with `EBUSY`.
    pub busy_commits: usize,
    /// Every atomic commit fails with this errno.
    pub commit_error: Option<i32>,
    pub preferred_depth: Option<u32>,
    /// `set_crtc` fails with `EINVAL` while set.
    pub fail_set_crtc: bool,
    /// `write_dumb_buffer` fails with `EIO` while set.
    pub fail_write_dumb: bool,
    commits: Vec<RecordedCommit>,
    add_framebuffer_calls: usize,
    next_fb: FramebufferId,
    next_handle: u32,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            atomic: true,
            planes: vec![
                plane(30, PlaneType::Primary, 0b01, 0),
                plane(31, PlaneType::Overlay, 0b01, 1),
                plane(32, PlaneType::Overlay, 0b01, 2),
                plane(33, PlaneType::Overlay, 0b01, 3),
                plane(CURSOR_PLANE, PlaneType::Cursor, 0b01, 4),
                plane(FOREIGN_PLANE, PlaneType::Overlay, 0b10, 5),
            ],
            calls: Vec::new(),
            framebuffers: HashMap::new(),
            dumb_buffers: HashMap::new(),
            dumb_contents: HashMap::new(),
            fail_add_framebuffer_at: None,
            rotation_supported: true,
            busy_commits: 0,
            commit_error: None,
            preferred_depth: Some(32),
            fail_set_crtc: false,
            fail_write_dumb: false,
            commits: Vec::new(),
            add_framebuffer_calls: 0,
            next_fb: 100,
            next_handle: 1,
        }
    }

    pub fn commits(&self) -> &[RecordedCommit] {
        &self.commits
    }

    pub fn last_commit(&self) -> Option<&RecordedCommit> {
        self.commits.last()
    }

    pub fn cursor_plane_id(&self) -> PlaneId {
        CURSOR_PLANE
    }

    pub fn foreign_plane_id(&self) -> PlaneId {
        FOREIGN_PLANE
    }
}

impl DisplayDevice for MockDevice {
    fn supports_atomic(&self) -> bool {
        self.atomic
    }

    fn crtc_id(&self) -> u32 {
        CRTC_ID
    }

    fn crtc_index(&self) -> u32 {
        0
    }

    fn connector_id(&self) -> u32 {
        CONNECTOR_ID
    }

    fn mode(&self) -> DisplayMode {
        DisplayMode {
            width: 800,
            height: 480,
            refresh: 60,
        }
    }

    fn planes(&mut self) -> Result<Vec<PlaneInfo>> {
        Ok(self.planes.clone())
    }

    fn plane_supports_rotation(&mut self, _plane: PlaneId, _rotation: PlaneRotation) -> Result<bool> {
        Ok(self.rotation_supported)
    }

    fn atomic_commit(&mut self, request: &CommitRequest, flags: CommitFlags) -> Result<()> {
        self.commits.push(RecordedCommit {
            flags,
            modeset: request.needs_modeset(),
            writes: request.writes().to_vec(),
        });
        if let Some(errno) = self.commit_error {
            return Err(CompositorError::from_errno("atomic commit", errno));
        }
        if self.busy_commits > 0 && flags.contains(CommitFlags::NONBLOCK) {
            self.busy_commits -= 1;
            return Err(CompositorError::from_errno("atomic commit", libc::EBUSY));
        }
        Ok(())
    }

    fn set_crtc(&mut self, fb: FramebufferId) -> Result<()> {
        self.calls.push(DeviceCall::SetCrtc(fb));
        if self.fail_set_crtc {
            return Err(CompositorError::from_errno("set crtc", libc::EINVAL));
        }
        Ok(())
    }

    fn page_flip(&mut self, fb: FramebufferId, _request_event: bool) -> Result<()> {
        self.calls.push(DeviceCall::PageFlip(fb));
        Ok(())
    }

    fn set_plane(&mut self, plane: PlaneId, fb: FramebufferId, _geometry: &PlaneGeometry) -> Result<()> {
        self.calls.push(DeviceCall::SetPlane { plane, fb });
        Ok(())
    }

    fn set_property(&mut self, object: DrmObject, name: &str, value: u64) -> Result<()> {
        self.calls.push(DeviceCall::SetProperty {
            object,
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    fn add_framebuffer(&mut self, spec: &FramebufferSpec) -> Result<FramebufferId> {
        self.add_framebuffer_calls += 1;
        if self.fail_add_framebuffer_at == Some(self.add_framebuffer_calls) {
            return Err(CompositorError::from_errno("add framebuffer", libc::ENOMEM));
        }
        let fb = self.next_fb;
        self.next_fb += 1;
        self.framebuffers.insert(fb, *spec);
        self.calls.push(DeviceCall::AddFramebuffer(fb));
        Ok(fb)
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()> {
        self.calls.push(DeviceCall::RemoveFramebuffer(fb));
        self.framebuffers
            .remove(&fb)
            .map(|_| ())
            .ok_or_else(|| CompositorError::from_errno("remove framebuffer", libc::ENOENT))
    }

    fn dumb_buffer_preferred_depth(&self) -> Result<Option<u32>> {
        Ok(self.preferred_depth)
    }

    fn create_dumb_buffer(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        self.calls.push(DeviceCall::CreateDumb { width, height, bpp });
        let pitch = width * bpp / 8;
        let buffer = DumbBuffer {
            handle: self.next_handle,
            width,
            height,
            pitch,
            size: u64::from(pitch) * u64::from(height),
            bpp,
        };
        self.next_handle += 1;
        self.dumb_buffers.insert(buffer.handle, buffer);
        Ok(buffer)
    }

    fn write_dumb_buffer(&mut self, buffer: &DumbBuffer, data: &[u8]) -> Result<()> {
        self.calls.push(DeviceCall::WriteDumb {
            handle: buffer.handle,
            len: data.len(),
        });
        if self.fail_write_dumb {
            return Err(CompositorError::from_errno("write dumb buffer", libc::EIO));
        }
        if data.len() as u64 > buffer.size {
            return Err(CompositorError::from_errno("write dumb buffer", libc::EINVAL));
        }
        self.dumb_contents.insert(buffer.handle, data.to_vec());
        Ok(())
    }

    fn destroy_dumb_buffer(&mut self, buffer: DumbBuffer) -> Result<()> {
        self.calls.push(DeviceCall::DestroyDumb(buffer.handle));
        self.dumb_contents.remove(&buffer.handle);
        self.dumb_buffers
            .remove(&buffer.handle)
            .map(|_| ())
            .ok_or_else(|| CompositorError::from_errno("destroy dumb buffer", libc::ENOENT))
    }

    fn set_cursor(&mut self, buffer: Option<&DumbBuffer>, hotspot: (i32, i32)) -> Result<()> {
        self.calls.push(DeviceCall::SetCursor(buffer.map(|b| b.handle), hotspot));
        Ok(())
    }

    fn move_cursor(&mut self, x: i32, y: i32) -> Result<()> {
        self.calls.push(DeviceCall::MoveCursor(x, y));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuCall {
    MakeCurrent,
    ClearCurrent,
    SwapBuffers,
    LockFrontBuffer(u64),
    ReleaseFrontBuffer(u64),
    CreateScanoutImage(u64),
    DestroyScanoutImage(u64),
    CreateRenderbuffer(RenderbufferId),
    DestroyRenderbuffer(RenderbufferId),
    CreateFramebufferObject,
    DestroyFramebufferObject(GlFramebufferId),
    AttachRenderbuffer(GlFramebufferId, RenderbufferId),
}

/// A GPU whose window surface cycles through three buffers (ids 0, 1, 2).
#[derive(Debug, Default)]
pub struct MockGpu {
    pub calls: Vec<GpuCall>,
    pub locked: BTreeSet<u64>,
    pub current: bool,
    pub fail_attach: bool,
    images: BTreeSet<u64>,
    renderbuffers: BTreeSet<RenderbufferId>,
    fbos: BTreeSet<GlFramebufferId>,
    swaps: u64,
    next_id: u32,
}

impl MockGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, predicate: impl Fn(&GpuCall) -> bool) -> usize {
        self.calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn live_renderbuffers(&self) -> usize {
        self.renderbuffers.len()
    }

    pub fn live_fbos(&self) -> usize {
        self.fbos.len()
    }

    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

fn gpu_error(operation: &'static str) -> CompositorError {
    CompositorError::gpu(operation, "mock failure")
}

impl GpuBackend for MockGpu {
    fn make_current(&mut self) -> Result<()> {
        self.calls.push(GpuCall::MakeCurrent);
        self.current = true;
        Ok(())
    }

    fn clear_current(&mut self) -> Result<()> {
        self.calls.push(GpuCall::ClearCurrent);
        self.current = false;
        Ok(())
    }

    fn swap_buffers(&mut self) -> Result<()> {
        self.calls.push(GpuCall::SwapBuffers);
        self.swaps += 1;
        Ok(())
    }

    fn lock_front_buffer(&mut self) -> Result<SurfaceBuffer> {
        let id = (self.swaps + 2) % 3;
        if !self.locked.insert(id) {
            return Err(gpu_error("lock front buffer"));
        }
        self.calls.push(GpuCall::LockFrontBuffer(id));
        Ok(SurfaceBuffer {
            id,
            width: 800,
            height: 480,
            format: FORMAT_ARGB8888,
            handle: 500 + id as u32,
            pitch: 800 * 4,
        })
    }

    fn release_front_buffer(&mut self, buffer: SurfaceBuffer) -> Result<()> {
        self.calls.push(GpuCall::ReleaseFrontBuffer(buffer.id));
        if self.locked.remove(&buffer.id) {
            Ok(())
        } else {
            Err(gpu_error("release front buffer"))
        }
    }

    fn create_scanout_image(&mut self, width: u32, _height: u32) -> Result<GpuImage> {
        let id = u64::from(self.next());
        self.images.insert(id);
        self.calls.push(GpuCall::CreateScanoutImage(id));
        Ok(GpuImage {
            id,
            gem_handle: 200 + id as u32,
            pitch: width * 4,
        })
    }

    fn destroy_scanout_image(&mut self, image: GpuImage) -> Result<()> {
        self.calls.push(GpuCall::DestroyScanoutImage(image.id));
        self.images.remove(&image.id);
        Ok(())
    }

    fn create_renderbuffer(&mut self, _image: &GpuImage) -> Result<RenderbufferId> {
        let id = self.next();
        self.renderbuffers.insert(id);
        self.calls.push(GpuCall::CreateRenderbuffer(id));
        Ok(id)
    }

    fn destroy_renderbuffer(&mut self, renderbuffer: RenderbufferId) -> Result<()> {
        self.calls.push(GpuCall::DestroyRenderbuffer(renderbuffer));
        self.renderbuffers.remove(&renderbuffer);
        Ok(())
    }

    fn create_framebuffer_object(&mut self) -> Result<GlFramebufferId> {
        let id = self.next();
        self.fbos.insert(id);
        self.calls.push(GpuCall::CreateFramebufferObject);
        Ok(id)
    }

    fn destroy_framebuffer_object(&mut self, fbo: GlFramebufferId) -> Result<()> {
        self.calls.push(GpuCall::DestroyFramebufferObject(fbo));
        self.fbos.remove(&fbo);
        Ok(())
    }

    fn attach_renderbuffer(&mut self, fbo: GlFramebufferId, renderbuffer: RenderbufferId) -> Result<()> {
        if self.fail_attach {
            return Err(gpu_error("attach renderbuffer"));
        }
        self.calls.push(GpuCall::AttachRenderbuffer(fbo, renderbuffer));
        Ok(())
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Engine hooks that queue posted tasks until `run_posted` and record page flips.
#[derive(Default)]
pub struct RecordingHooks {
    time_ns: AtomicU64,
    posted: AtomicUsize,
    queue: Mutex<Vec<Task>>,
    flips: Mutex<Vec<(u32, u32)>>,
}

impl RecordingHooks {
    pub fn set_time_ns(&self, ns: u64) {
        self.time_ns.store(ns, Ordering::SeqCst);
    }

    /// Number of tasks posted so far.
    pub fn posted(&self) -> usize {
        self.posted.load(Ordering::SeqCst)
    }

    pub fn run_posted(&self) {
        let tasks: Vec<Task> = std::mem::take(&mut *self.queue.lock().unwrap());
        for task in tasks {
            task();
        }
    }

    pub fn flips(&self) -> Vec<(u32, u32)> {
        self.flips.lock().unwrap().clone()
    }
}

impl EngineHooks for RecordingHooks {
    fn current_time_ns(&self) -> u64 {
        self.time_ns.load(Ordering::SeqCst)
    }

    fn post_task(&self, task: Box<dyn FnOnce() + Send>) {
        self.posted.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().unwrap().push(task);
    }

    fn page_flip_completed(&self, sec: u32, usec: u32) {
        self.flips.lock().unwrap().push((sec, usec));
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` with a thread-local subscriber and returns the warnings it logged.
pub fn capture_warnings<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = SharedBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (result, logs)
}
