//! Simulated display device, GPU and engine shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use novade_drm_compositor::device::{
    CommitFlags, DisplayMode, DumbBuffer, FramebufferId, FramebufferSpec, PlaneGeometry, PlaneId, PlaneRotation,
    PropertyWrite, ZposInfo,
};
use novade_drm_compositor::gpu::{GlFramebufferId, GpuImage, RenderbufferId, SurfaceBuffer};
use novade_drm_compositor::{
    CommitRequest, CompositorError, DisplayDevice, DrmObject, EngineHooks, GpuBackend, PlaneInfo, PlaneType, Result,
};

pub const CRTC: u32 = 7;

/// One committed frame.
#[derive(Debug, Clone)]
pub struct Commit {
    pub flags: CommitFlags,
    pub writes: Vec<PropertyWrite>,
}

impl Commit {
    pub fn plane_fb(&self, plane: PlaneId) -> Option<u64> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.object == DrmObject::Plane(plane) && w.name == "FB_ID")
            .map(|w| w.value)
    }
}

pub struct SimDevice {
    pub planes: Vec<PlaneInfo>,
    pub commits: Vec<Commit>,
    pub busy_budget: usize,
    pub framebuffers: HashSet<FramebufferId>,
    pub dumb: HashMap<u32, DumbBuffer>,
    pub cursor_moves: Vec<(i32, i32)>,
    next: u32,
}

impl SimDevice {
    /// A device with one primary plane, `overlays` overlay planes and a cursor plane.
    pub fn with_overlays(overlays: u32) -> Self {
        let zpos = |current| Some(ZposInfo { current, min: 0, max: 15 });
        let mut planes = vec![PlaneInfo {
            id: 100,
            plane_type: PlaneType::Primary,
            possible_crtcs: 1,
            zpos: zpos(0),
        }];
        for i in 0..overlays {
            planes.push(PlaneInfo {
                id: 101 + i,
                plane_type: PlaneType::Overlay,
                possible_crtcs: 1,
                zpos: zpos(i64::from(i) + 1),
            });
        }
        planes.push(PlaneInfo {
            id: 200,
            plane_type: PlaneType::Cursor,
            possible_crtcs: 1,
            zpos: zpos(15),
        });
        Self {
            planes,
            commits: Vec::new(),
            busy_budget: 0,
            framebuffers: HashSet::new(),
            dumb: HashMap::new(),
            cursor_moves: Vec::new(),
            next: 1,
        }
    }

    fn next_id(&mut self) -> u32 {
        self.next += 1;
        self.next
    }
}

impl DisplayDevice for SimDevice {
    fn supports_atomic(&self) -> bool {
        true
    }

    fn crtc_id(&self) -> u32 {
        CRTC
    }

    fn crtc_index(&self) -> u32 {
        0
    }

    fn connector_id(&self) -> u32 {
        9
    }

    fn mode(&self) -> DisplayMode {
        DisplayMode {
            width: 1280,
            height: 720,
            refresh: 60,
        }
    }

    fn planes(&mut self) -> Result<Vec<PlaneInfo>> {
        Ok(self.planes.clone())
    }

    fn plane_supports_rotation(&mut self, _plane: PlaneId, _rotation: PlaneRotation) -> Result<bool> {
        Ok(true)
    }

    fn atomic_commit(&mut self, request: &CommitRequest, flags: CommitFlags) -> Result<()> {
        self.commits.push(Commit {
            flags,
            writes: request.writes().to_vec(),
        });
        if self.busy_budget > 0 && flags.contains(CommitFlags::NONBLOCK) {
            self.busy_budget -= 1;
            return Err(CompositorError::from_errno("atomic commit", libc::EBUSY));
        }
        Ok(())
    }

    fn set_crtc(&mut self, _fb: FramebufferId) -> Result<()> {
        Ok(())
    }

    fn page_flip(&mut self, _fb: FramebufferId, _request_event: bool) -> Result<()> {
        Ok(())
    }

    fn set_plane(&mut self, _plane: PlaneId, _fb: FramebufferId, _geometry: &PlaneGeometry) -> Result<()> {
        Ok(())
    }

    fn set_property(&mut self, _object: DrmObject, _name: &str, _value: u64) -> Result<()> {
        Ok(())
    }

    fn add_framebuffer(&mut self, _spec: &FramebufferSpec) -> Result<FramebufferId> {
        let fb = self.next_id();
        self.framebuffers.insert(fb);
        Ok(fb)
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()> {
        self.framebuffers.remove(&fb);
        Ok(())
    }

    fn dumb_buffer_preferred_depth(&self) -> Result<Option<u32>> {
        Ok(Some(32))
    }

    fn create_dumb_buffer(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        let buffer = DumbBuffer {
            handle: self.next_id(),
            width,
            height,
            pitch: width * bpp / 8,
            size: u64::from(width * bpp / 8) * u64::from(height),
            bpp,
        };
        self.dumb.insert(buffer.handle, buffer);
        Ok(buffer)
    }

    fn write_dumb_buffer(&mut self, _buffer: &DumbBuffer, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn destroy_dumb_buffer(&mut self, buffer: DumbBuffer) -> Result<()> {
        self.dumb.remove(&buffer.handle);
        Ok(())
    }

    fn set_cursor(&mut self, _buffer: Option<&DumbBuffer>, _hotspot: (i32, i32)) -> Result<()> {
        Ok(())
    }

    fn move_cursor(&mut self, x: i32, y: i32) -> Result<()> {
        self.cursor_moves.push((x, y));
        Ok(())
    }
}

/// A GPU with a two-buffer window surface.
#[derive(Default)]
pub struct SimGpu {
    next: u32,
    swaps: u64,
    pub live_objects: HashSet<u32>,
}

impl SimGpu {
    fn create(&mut self) -> u32 {
        self.next += 1;
        self.live_objects.insert(self.next);
        self.next
    }
}

impl GpuBackend for SimGpu {
    fn make_current(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear_current(&mut self) -> Result<()> {
        Ok(())
    }

    fn swap_buffers(&mut self) -> Result<()> {
        self.swaps += 1;
        Ok(())
    }

    fn lock_front_buffer(&mut self) -> Result<SurfaceBuffer> {
        let id = self.swaps % 2;
        Ok(SurfaceBuffer {
            id,
            width: 1280,
            height: 720,
            format: 0x3432_5241,
            handle: 900 + id as u32,
            pitch: 1280 * 4,
        })
    }

    fn release_front_buffer(&mut self, _buffer: SurfaceBuffer) -> Result<()> {
        Ok(())
    }

    fn create_scanout_image(&mut self, width: u32, _height: u32) -> Result<GpuImage> {
        let id = self.create();
        Ok(GpuImage {
            id: u64::from(id),
            gem_handle: id,
            pitch: width * 4,
        })
    }

    fn destroy_scanout_image(&mut self, image: GpuImage) -> Result<()> {
        self.live_objects.remove(&(image.id as u32));
        Ok(())
    }

    fn create_renderbuffer(&mut self, _image: &GpuImage) -> Result<RenderbufferId> {
        Ok(self.create())
    }

    fn destroy_renderbuffer(&mut self, renderbuffer: RenderbufferId) -> Result<()> {
        self.live_objects.remove(&renderbuffer);
        Ok(())
    }

    fn create_framebuffer_object(&mut self) -> Result<GlFramebufferId> {
        Ok(self.create())
    }

    fn destroy_framebuffer_object(&mut self, fbo: GlFramebufferId) -> Result<()> {
        self.live_objects.remove(&fbo);
        Ok(())
    }

    fn attach_renderbuffer(&mut self, _fbo: GlFramebufferId, _renderbuffer: RenderbufferId) -> Result<()> {
        Ok(())
    }
}

/// Engine hooks that run posted tasks immediately.
#[derive(Default)]
pub struct Engine {
    pub flips: Mutex<Vec<(u32, u32)>>,
}

impl EngineHooks for Engine {
    fn current_time_ns(&self) -> u64 {
        1_000_000_000
    }

    fn post_task(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }

    fn page_flip_completed(&self, sec: u32, usec: u32) {
        if let Ok(mut flips) = self.flips.lock() {
            flips.push((sec, usec));
        }
    }
}

pub fn engine() -> Arc<Engine> {
    Arc::new(Engine::default())
}
