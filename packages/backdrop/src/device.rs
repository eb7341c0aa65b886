//! Process-wide GPU device lifecycle.

use std::sync::{Arc, OnceLock, RwLock};

use backdrop_hal::{DeviceOptions, DriverKind, GpuBackend, GpuDevice};
use tracing::{debug, error, warn};

/// Owns the one GPU device the process renders with, and recreates it
/// after a confirmed device loss.
///
/// Holders must re-fetch through [`device`](Self::device) after a
/// [`reset`](Self::reset) rather than caching the `Arc` across it.
pub struct GraphicsDevice {
    backend: Arc<dyn GpuBackend>,
    options: DeviceOptions,
    device: RwLock<Option<Arc<dyn GpuDevice>>>,
    // one-time GDI bridge probe result; a static platform property, so
    // it survives device resets
    bridge_broken: OnceLock<bool>,
}

impl GraphicsDevice {
    pub fn new(backend: Arc<dyn GpuBackend>, options: DeviceOptions) -> Self {
        Self {
            backend,
            options,
            device: RwLock::new(None),
            bridge_broken: OnceLock::new(),
        }
    }

    /// Creates the device, preferring the hardware driver. Returns
    /// `false` when no driver could be initialized; the caller decides
    /// between degraded operation and aborting startup.
    pub fn init(&self) -> bool {
        let device = match self.backend.create_device(DriverKind::Hardware, &self.options) {
            Ok(device) => {
                debug!("hardware gpu device created");
                Some(device)
            }
            Err(err) if self.software_fallback_allowed() => {
                warn!(%err, "hardware device creation failed, trying software driver");
                match self.backend.create_device(DriverKind::Software, &self.options) {
                    Ok(device) => {
                        debug!("software gpu device created");
                        Some(device)
                    }
                    Err(err) => {
                        error!(%err, "software device creation failed");
                        None
                    }
                }
            }
            Err(err) if self.options.allow_software_fallback => {
                error!(%err, "hardware device creation failed, software fallback blocked by core count");
                None
            }
            Err(err) => {
                error!(%err, "hardware device creation failed, software fallback disabled");
                None
            }
        };
        let ok = device.is_some();
        *self.device.write().unwrap() = device;
        ok
    }

    /// Tears the device down and reinitializes it. Every window must
    /// rebuild its device-dependent resources afterwards.
    pub fn reset(&self) -> bool {
        debug!("resetting gpu device");
        // drop before re-creating so backend teardown runs first
        *self.device.write().unwrap() = None;
        self.init()
    }

    pub fn is_initialized(&self) -> bool {
        self.device.read().unwrap().is_some()
    }

    /// Current device, if initialization succeeded.
    pub fn device(&self) -> Option<Arc<dyn GpuDevice>> {
        self.device.read().unwrap().clone()
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Cached result of the one-time GPU-surface/OS-DC bridge probe.
    /// `probe` runs at most once per `GraphicsDevice`.
    pub(crate) fn bridge_broken(&self, probe: impl FnOnce() -> bool) -> bool {
        *self.bridge_broken.get_or_init(probe)
    }

    fn software_fallback_allowed(&self) -> bool {
        // WARP on a weak machine is worse than no acceleration at all
        self.options.allow_software_fallback && num_cpus::get_physical() >= 4
    }
}

static GLOBAL: OnceLock<Arc<GraphicsDevice>> = OnceLock::new();

/// Installs the process-wide device manager and initializes it.
/// Subsequent calls keep the first instance and report its state.
pub fn init_global(backend: Arc<dyn GpuBackend>, options: DeviceOptions) -> bool {
    let gfx = GLOBAL.get_or_init(|| Arc::new(GraphicsDevice::new(backend, options)));
    gfx.is_initialized() || gfx.init()
}

pub fn global() -> Option<Arc<GraphicsDevice>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backdrop_hal::mock::MockBackend;

    #[test]
    fn init_prefers_hardware() {
        let backend = MockBackend::new();
        let gfx = GraphicsDevice::new(Arc::new(backend.clone()), DeviceOptions::default());
        assert!(gfx.init());
        assert_eq!(gfx.device().unwrap().driver(), DriverKind::Hardware);
    }

    #[test]
    fn no_fallback_without_config_flag() {
        let backend = MockBackend::new();
        backend.fail_hardware(true);
        let gfx = GraphicsDevice::new(Arc::new(backend), DeviceOptions::default());
        assert!(!gfx.init());
        assert!(gfx.device().is_none());
    }

    #[test]
    fn fallback_honours_core_heuristic() {
        let backend = MockBackend::new();
        backend.fail_hardware(true);
        let options = DeviceOptions { allow_software_fallback: true, ..Default::default() };
        let gfx = GraphicsDevice::new(Arc::new(backend), options);
        let expect_fallback = num_cpus::get_physical() >= 4;
        assert_eq!(gfx.init(), expect_fallback);
        match gfx.device() {
            Some(device) => {
                assert!(expect_fallback);
                assert_eq!(device.driver(), DriverKind::Software);
            }
            None => assert!(!expect_fallback),
        }
    }

    #[test]
    fn reset_replaces_the_device() {
        let backend = MockBackend::new();
        let gfx = GraphicsDevice::new(Arc::new(backend.clone()), DeviceOptions::default());
        assert!(gfx.init());
        let before = gfx.device().unwrap();
        assert!(gfx.reset());
        let after = gfx.device().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(backend.stats().devices, 2);
    }

    #[test]
    fn bridge_probe_runs_once() {
        let backend = MockBackend::new();
        let gfx = GraphicsDevice::new(Arc::new(backend), DeviceOptions::default());
        assert!(gfx.bridge_broken(|| true));
        // second probe closure must not run
        assert!(gfx.bridge_broken(|| unreachable!()));
    }
}
