mod common;

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use rstest::rstest;

use common::{engine, SimDevice, SimGpu};
use novade_drm_compositor::device::CommitFlags;
use novade_drm_compositor::{
    Compositor, CompositorConfig, ConfigLoader, Layer, Mutation, Point, ReleaseOutcome, Rotation, Size, ViewCallbacks,
    ViewId,
};

const FULL: Size = Size {
    width: 1280.0,
    height: 720.0,
};

fn compositor(overlays: u32) -> Compositor<SimDevice, SimGpu> {
    Compositor::new(
        SimDevice::with_overlays(overlays),
        SimGpu::default(),
        engine(),
        &CompositorConfig::default(),
    )
    .unwrap()
}

fn store_layers(compositor: &Compositor<SimDevice, SimGpu>, count: usize) -> Vec<Layer> {
    (0..count)
        .map(|_| {
            let drawable = compositor.create_backing_store(FULL).unwrap();
            Layer::backing_store(drawable, Point::default(), FULL)
        })
        .collect()
}

fn view_layer(view_id: ViewId) -> Layer {
    Layer::platform_view(
        view_id,
        vec![Mutation::Opacity(1.0)],
        Point::new(100.0, 50.0),
        Size::new(640.0, 360.0),
    )
}

#[test]
fn test_view_lifecycle_scenario() {
    let compositor = compositor(3);
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let (mount_log, update_log, unmount_log) = (log.clone(), log.clone(), log.clone());
    compositor
        .set_view_callbacks(
            42,
            ViewCallbacks::new()
                .on_mount(move |_, _, _, _| {
                    mount_log.lock().unwrap().push("mount");
                    Ok(())
                })
                .on_update(move |_, _, _, _| {
                    update_log.lock().unwrap().push("update");
                    Ok(())
                })
                .on_unmount(move |_, _, _| {
                    unmount_log.lock().unwrap().push("unmount");
                    Ok(())
                }),
            None,
        )
        .unwrap();

    let ui = store_layers(&compositor, 1);
    let with_view = vec![ui[0].clone(), view_layer(42)];

    compositor.present_layers(&with_view).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["mount"]);

    compositor.present_layers(&with_view).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["mount"], "an unchanged view gets no callbacks");

    compositor.present_layers(&ui).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["mount", "unmount"]);
}

#[rstest]
#[case::collect_first(true)]
#[case::destroy_first(false)]
fn test_backing_store_recycled_exactly_once(#[case] collect_first: bool) {
    let compositor = compositor(3);
    let drawables: Vec<_> = (0..3).map(|_| compositor.create_backing_store(FULL).unwrap()).collect();

    for drawable in &drawables {
        let (first, second) = if collect_first {
            (
                compositor.collect_backing_store(drawable).unwrap(),
                compositor.destroy_backing_store(drawable).unwrap(),
            )
        } else {
            (
                compositor.destroy_backing_store(drawable).unwrap(),
                compositor.collect_backing_store(drawable).unwrap(),
            )
        };
        assert_eq!((first, second), (ReleaseOutcome::Pending, ReleaseOutcome::Recycled));
    }

    let stats = compositor.pool_stats().unwrap();
    assert_eq!(stats.stale_render_targets, 3, "one recycle per drawable");
    assert_eq!(stats.backing_stores, 0);

    // Creating the same number again must reuse every stale target.
    for _ in 0..3 {
        compositor.create_backing_store(FULL).unwrap();
    }
    let stats = compositor.pool_stats().unwrap();
    assert_eq!((stats.render_targets, stats.stale_render_targets), (3, 0));
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(4)]
fn test_layers_get_distinct_planes(#[case] layer_count: usize) {
    let compositor = compositor(3);
    let layers = store_layers(&compositor, layer_count);
    let report = compositor.present_layers(&layers).unwrap();

    assert!(report.skipped_layers.is_empty(), "enough planes for every layer");
    let planes: HashSet<u32> = report.assignments.iter().map(|a| a.plane_id).collect();
    assert_eq!(planes.len(), layer_count, "no two layers may share a plane");
    let ordered: Vec<u32> = report.assignments.iter().map(|a| a.plane_id).collect();
    let mut sorted = ordered.clone();
    sorted.sort_unstable();
    assert_eq!(ordered, sorted, "planes follow the driver's intrinsic order");
}

#[test]
fn test_ebusy_switches_to_blocking_for_good() {
    let mut device = SimDevice::with_overlays(1);
    device.busy_budget = 5;
    let hooks = engine();
    let compositor = Compositor::new(device, SimGpu::default(), hooks.clone(), &CompositorConfig::default()).unwrap();
    let layers = store_layers(&compositor, 2);

    for _ in 0..3 {
        let report = compositor.present_layers(&layers).unwrap();
        assert!(report.blocking);
    }
    assert!(compositor.uses_blocking_commits().unwrap());

    let flags: Vec<CommitFlags> = compositor
        .with_device(|d| d.commits.iter().map(|c| c.flags).collect())
        .unwrap();
    assert_eq!(flags.len(), 4, "one busy attempt, then three blocking commits");
    assert!(flags[0].contains(CommitFlags::NONBLOCK));
    assert!(flags[1..].iter().all(|f| !f.contains(CommitFlags::NONBLOCK)));
    assert_eq!(hooks.flips.lock().unwrap().len(), 3, "each blocking frame reports a flip");
    assert_eq!(hooks.flips.lock().unwrap()[0], (1, 0));
}

#[test]
fn test_unassigned_overlays_are_switched_off() {
    let compositor = compositor(3);
    let layers = store_layers(&compositor, 3);
    compositor.present_layers(&layers).unwrap();
    compositor.present_layers(&layers[..1]).unwrap();

    let last = compositor.with_device(|d| d.commits.last().cloned()).unwrap().unwrap();
    assert_ne!(last.plane_fb(100), Some(0));
    for overlay in [101, 102, 103] {
        assert_eq!(last.plane_fb(overlay), Some(0), "overlay {} must be disabled", overlay);
    }
}

#[rstest]
#[case(0, (0, 0))]
#[case(90, (31, 0))]
#[case(180, (31, 31))]
#[case(270, (0, 31))]
fn test_cursor_rotation_moves_hotspot(#[case] rotation: i32, #[case] hotspot: (i32, i32)) {
    let compositor = compositor(1);
    compositor.apply_cursor_state(true, rotation, 1.0).unwrap();
    compositor.set_cursor_position(100, 200).unwrap();

    let state = compositor.cursor_state().unwrap();
    assert_eq!(state.rotation, Rotation::try_from(rotation).unwrap());
    assert_eq!((state.hot_x, state.hot_y), hotspot);
    let last_move = compositor.with_device(|d| d.cursor_moves.last().copied()).unwrap();
    assert_eq!(last_move, Some((100 - hotspot.0, 200 - hotspot.1)));
}

#[test]
fn test_config_file_drives_compositor() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[presentation]
blocking_atomic_commits = true

[cursor]
enabled = true
rotation = 180
"#
    )
    .unwrap();

    let config = ConfigLoader::load_from_path(file.path()).unwrap();
    let compositor = Compositor::new(SimDevice::with_overlays(1), SimGpu::default(), engine(), &config).unwrap();
    assert!(compositor.uses_blocking_commits().unwrap());
    assert_eq!(compositor.cursor_state().unwrap().rotation, Rotation::Deg180);

    let layers = store_layers(&compositor, 1);
    let report = compositor.present_layers(&layers).unwrap();
    assert!(report.synthetic_page_flip);
}

#[test]
fn test_shutdown_frees_device_and_gpu_resources() {
    let compositor = compositor(2);
    let layers = store_layers(&compositor, 3);
    compositor.present_layers(&layers).unwrap();
    compositor.apply_cursor_state(true, 0, 1.0).unwrap();

    let (device, gpu) = compositor.shutdown();
    assert!(device.framebuffers.is_empty());
    assert!(device.dumb.is_empty());
    assert!(gpu.live_objects.is_empty());
}
