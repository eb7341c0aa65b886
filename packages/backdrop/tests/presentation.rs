//! End-to-end presentation scenarios against the scriptable backend.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use backdrop::hal::mock::{MockBackend, MockDrawOp};
use backdrop::hal::{
    DeviceOptions, DrawRect, DriverKind, GpuBackend, PixelRect, SurfaceSize, DEVICE_REMOVED,
};
use backdrop::{
    BackingStore, BlitBackingStore, Color, DirtyRegion, GraphicsDevice, PaintWindow,
    SwapChainBackingStore, WindowTarget,
};
use euclid::default::{Point2D, Size2D, Vector2D};
use raw_window_handle::{RawWindowHandle, WebWindowHandle};

struct TestWindow {
    id: u32,
    geometry: Cell<PixelRect>,
    translucent: Cell<bool>,
    owns: bool,
    lost_events: Cell<u32>,
}

impl TestWindow {
    fn new(id: u32, w: i32, h: i32, owns: bool) -> Rc<Self> {
        Rc::new(Self {
            id,
            geometry: Cell::new(PixelRect::from_size(Size2D::new(w, h))),
            translucent: Cell::new(false),
            owns,
            lost_events: Cell::new(0),
        })
    }
}

impl PaintWindow for TestWindow {
    fn geometry(&self) -> PixelRect {
        self.geometry.get()
    }

    fn raw_window_handle(&self) -> RawWindowHandle {
        RawWindowHandle::Web(WebWindowHandle::new(self.id))
    }

    fn is_translucent(&self) -> bool {
        self.translucent.get()
    }

    fn owns_presentation(&self) -> bool {
        self.owns
    }

    fn post_device_lost(&self) {
        self.lost_events.set(self.lost_events.get() + 1);
    }
}

fn gfx(backend: &MockBackend) -> Arc<GraphicsDevice> {
    let gfx = GraphicsDevice::new(Arc::new(backend.clone()), DeviceOptions::default());
    assert!(gfx.init());
    Arc::new(gfx)
}

fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> PixelRect {
    PixelRect::new(Point2D::new(x0, y0), Point2D::new(x1, y1))
}

fn blits(ops: Vec<MockDrawOp>) -> Vec<DrawRect> {
    ops.into_iter()
        .filter_map(|op| match op {
            MockDrawOp::Blit { dst, .. } => Some(dst),
            MockDrawOp::Clear { .. } => None,
        })
        .collect()
}

fn full_bounds(w: f32, h: f32) -> DrawRect {
    DrawRect::new(euclid::default::Point2D::new(0.0, 0.0), euclid::default::Point2D::new(w, h))
}

#[test]
fn first_flush_after_reset_is_full_region_exactly_once() {
    let backend = MockBackend::new();
    let window = TestWindow::new(1, 640, 480, true);
    let gfx = gfx(&backend);
    let mut store = SwapChainBackingStore::new(gfx.clone(), window);
    let small = DirtyRegion::rect(rect(10, 10, 20, 20));

    assert!(store.begin_paint(&small));
    store.end_paint();
    store.flush(None, &small, Vector2D::zero());
    // the very first flush after bitmap creation is full-area too
    assert_eq!(blits(backend.take_draw_ops()), vec![full_bounds(640.0, 480.0)]);

    store.flush(None, &small, Vector2D::zero());
    assert_eq!(
        blits(backend.take_draw_ops()),
        vec![DrawRect::new(
            euclid::default::Point2D::new(10.0, 10.0),
            euclid::default::Point2D::new(20.0, 20.0)
        )]
    );

    assert!(gfx.reset());
    assert!(store.reset_device_dependent_resources());
    // the paint bitmap was dropped with the dead device
    assert!(store.begin_paint(&small));
    store.end_paint();
    store.flush(None, &small, Vector2D::zero());
    assert_eq!(blits(backend.take_draw_ops()), vec![full_bounds(640.0, 480.0)]);
    store.flush(None, &small, Vector2D::zero());
    assert_eq!(
        blits(backend.take_draw_ops()),
        vec![DrawRect::new(
            euclid::default::Point2D::new(10.0, 10.0),
            euclid::default::Point2D::new(20.0, 20.0)
        )]
    );
}

#[test]
fn device_reset_rebuilds_the_paint_bitmap() {
    let backend = MockBackend::new();
    let window = TestWindow::new(1, 200, 100, true);
    let gfx = gfx(&backend);
    let mut store = SwapChainBackingStore::new(gfx.clone(), window);
    let bounds = DirtyRegion::rect(rect(0, 0, 200, 100));

    assert!(store.begin_paint(&bounds));
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());

    let before = backend.stats();
    assert!(gfx.reset());
    assert!(store.reset_device_dependent_resources());
    assert!(store.begin_paint(&bounds));
    // a fresh context and surface, not the ones from the old device
    let after = backend.stats();
    assert!(after.contexts > before.contexts);
    assert!(after.surfaces > before.surfaces);
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());
    assert_eq!(backend.stats().presents, before.presents + 1);
}

#[test]
fn swap_chain_resize_scenario() {
    let backend = MockBackend::new();
    let window = TestWindow::new(1, 800, 600, true);
    let gfx = gfx(&backend);
    let mut target = WindowTarget::new(gfx, window.clone());

    assert!(target.setup_swap_chain());
    assert!(target.setup_bitmap());
    assert!(target.needs_full_repaint());

    let mut source = {
        let device = backend
            .create_device(DriverKind::Hardware, &DeviceOptions::default())
            .unwrap();
        let mut bmp = backdrop::Bitmap::new(&device).unwrap();
        assert!(bmp.resize(SurfaceSize::new(800, 600)));
        bmp
    };
    let bounds = DirtyRegion::rect(rect(0, 0, 800, 600));
    target.flush(&mut source, &bounds, Vector2D::zero());
    assert!(!target.needs_full_repaint());
    target.flush(&mut source, &bounds, Vector2D::zero());
    assert!(!target.needs_full_repaint());

    window.geometry.set(rect(0, 0, 1024, 768));
    assert!(target.resize_swap_chain(SurfaceSize::new(1024, 768)));
    // bitmap was torn down by the resize and comes back at the new size
    assert!(target.setup_bitmap());
    assert!(target.needs_full_repaint());
    assert_eq!(target.bitmap().unwrap().size(), SurfaceSize::new(1024, 768));
}

#[test]
fn device_removed_on_present_posts_exactly_one_event() {
    let backend = MockBackend::new();
    let window = TestWindow::new(1, 320, 240, true);
    let gfx = gfx(&backend);
    let mut store = SwapChainBackingStore::new(gfx.clone(), window.clone());
    let bounds = DirtyRegion::rect(rect(0, 0, 320, 240));

    assert!(store.begin_paint(&bounds));
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());
    assert_eq!(backend.stats().presents, 1);
    assert_eq!(window.lost_events.get(), 0);

    backend.set_present_error(Some(DEVICE_REMOVED));
    store.flush(None, &bounds, Vector2D::zero());
    assert_eq!(window.lost_events.get(), 1);

    // latched: no further swap-chain operations until reset
    let before = backend.stats();
    store.flush(None, &bounds, Vector2D::zero());
    store.window_target().resize_swap_chain(SurfaceSize::new(64, 64));
    let after = backend.stats();
    assert_eq!(after.presents, before.presents);
    assert_eq!(after.resizes, before.resizes);
    assert_eq!(after.swap_chains, before.swap_chains);
    assert_eq!(window.lost_events.get(), 1);

    assert!(gfx.reset());
    assert!(store.reset_device_dependent_resources());
    assert!(store.begin_paint(&bounds));
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());
    assert_eq!(window.lost_events.get(), 1);
    assert_eq!(backend.stats().presents, after.presents + 1);
}

#[test]
fn device_removed_on_resize_posts_one_event() {
    let backend = MockBackend::new();
    let window = TestWindow::new(1, 100, 100, true);
    let mut store = SwapChainBackingStore::new(gfx(&backend), window.clone());
    let bounds = DirtyRegion::rect(rect(0, 0, 100, 100));

    assert!(store.begin_paint(&bounds));
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());

    backend.set_resize_error(Some(DEVICE_REMOVED));
    store.resize(SurfaceSize::new(50, 50), &DirtyRegion::new());
    assert_eq!(window.lost_events.get(), 1);
    store.flush(None, &bounds, Vector2D::zero());
    assert_eq!(window.lost_events.get(), 1);
}

#[test]
fn broken_bridge_switches_to_manual_path_permanently() {
    let backend = MockBackend::new();
    backend.set_dc_bridge(false);
    let window = TestWindow::new(1, 32, 32, false);
    let mut store = BlitBackingStore::new(gfx(&backend), window);
    let bounds = DirtyRegion::rect(rect(0, 0, 32, 32));

    assert!(store.begin_paint(&bounds));
    store.bitmap().unwrap().fill(Color::new([0.0, 1.0, 0.0, 1.0]));
    store.end_paint();

    store.flush(None, &bounds, Vector2D::zero());
    let stats = backend.stats();
    // one staging store for the probe, one for the manual path
    assert_eq!(stats.staging, 2);
    assert_eq!(stats.dc_acquires, 1); // probe only
    assert!(stats.blits >= 2);

    // staging store reused while dimensions are unchanged
    store.flush(None, &bounds, Vector2D::zero());
    let stats = backend.stats();
    assert_eq!(stats.staging, 2);
    assert_eq!(stats.dc_acquires, 1);

    // recreated when the image dimensions change
    store.resize(SurfaceSize::new(64, 64), &DirtyRegion::new());
    store.flush(None, &bounds, Vector2D::zero());
    assert_eq!(backend.stats().staging, 3);
}

#[test]
fn working_bridge_blits_through_the_surface_dc() {
    let backend = MockBackend::new();
    let window = TestWindow::new(1, 16, 16, false);
    let mut store = BlitBackingStore::new(gfx(&backend), window);
    let bounds = DirtyRegion::rect(rect(0, 0, 16, 16));

    assert!(store.begin_paint(&bounds));
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());
    store.flush(None, &bounds, Vector2D::zero());
    let stats = backend.stats();
    // probe's staging store is the only one ever created
    assert_eq!(stats.staging, 1);
    // probe + one acquire per flush
    assert_eq!(stats.dc_acquires, 3);
}

#[test]
fn painted_pixels_reach_the_back_buffer() {
    let backend = MockBackend::new();
    let window = TestWindow::new(1, 8, 8, true);
    window.translucent.set(true);
    let mut store = SwapChainBackingStore::new(gfx(&backend), window);
    let bounds = DirtyRegion::rect(rect(0, 0, 8, 8));

    assert!(store.begin_paint(&bounds));
    store.bitmap().unwrap().fill(Color::new([1.0, 0.0, 0.0, 1.0]));
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());

    let image = store
        .window_target()
        .bitmap()
        .unwrap()
        .to_image(backdrop::hal::SurfaceRect::zero())
        .unwrap();
    assert_eq!(image.pixel(4, 4), 0xFFFF_0000);
    // translucent window presents via layered update, not a swap chain
    let stats = backend.stats();
    assert_eq!(stats.layered_updates, 1);
    assert_eq!(stats.presents, 0);
}

#[test]
fn cross_window_flush_promotes_the_back_buffer() {
    let backend = MockBackend::new();
    let gfx = gfx(&backend);
    let window_a = TestWindow::new(1, 16, 16, true);
    window_a.translucent.set(true);
    let window_b = TestWindow::new(2, 16, 16, true);
    let mut store = SwapChainBackingStore::new(gfx.clone(), window_a);
    let mut target_b = WindowTarget::new(gfx, window_b);
    let bounds = DirtyRegion::rect(rect(0, 0, 16, 16));

    assert!(store.begin_paint(&bounds));
    store.bitmap().unwrap().fill(Color::new([0.0, 0.0, 1.0, 1.0]));
    store.end_paint();
    // populate window A's own back buffer first
    store.flush(None, &bounds, Vector2D::zero());

    store.flush(Some(&mut target_b), &bounds, Vector2D::zero());
    assert_eq!(backend.stats().presents, 1);
    let image = target_b
        .bitmap()
        .unwrap()
        .to_image(backdrop::hal::SurfaceRect::zero())
        .unwrap();
    assert_eq!(image.pixel(8, 8), 0xFF00_00FF);
}

#[test]
fn resize_preserves_requested_region() {
    let backend = MockBackend::new();
    let window = TestWindow::new(1, 8, 8, false);
    let mut store = BlitBackingStore::new(gfx(&backend), window);
    let bounds = DirtyRegion::rect(rect(0, 0, 8, 8));

    assert!(store.begin_paint(&bounds));
    store.bitmap().unwrap().fill(Color::new([0.0, 1.0, 1.0, 1.0]));
    store.end_paint();

    store.resize(SurfaceSize::new(16, 16), &DirtyRegion::rect(rect(0, 0, 8, 8)));
    let image = store.to_image().unwrap();
    assert_eq!(image.size(), SurfaceSize::new(16, 16));
    assert_eq!(image.pixel(4, 4), 0xFF00_FFFF);
    assert_eq!(image.pixel(12, 12), 0);
}

#[test]
fn store_selection_follows_presentation_ownership() {
    let backend = MockBackend::new();
    let gfx = gfx(&backend);
    let owning = TestWindow::new(1, 32, 32, true);
    let child = TestWindow::new(2, 32, 32, false);
    let bounds = DirtyRegion::rect(rect(0, 0, 32, 32));

    let mut store = backdrop::create_backing_store(gfx.clone(), owning);
    assert!(store.begin_paint(&bounds));
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());
    assert_eq!(backend.stats().presents, 1);

    let mut store = backdrop::create_backing_store(gfx, child);
    assert!(store.begin_paint(&bounds));
    store.end_paint();
    store.flush(None, &bounds, Vector2D::zero());
    // child store never touches a swap chain
    assert_eq!(backend.stats().presents, 1);
    assert!(backend.stats().blits >= 1);
}
