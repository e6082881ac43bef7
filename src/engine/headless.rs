//! Headless display engine
//!
//! In-memory stand-in for an engine driver. Imports, applies and captures are
//! recorded instead of programmed into hardware, and [`VsyncTicker`]
//! synthesizes vsync interrupts at each display's refresh rate.

use super::{
    BufferAllocator, BufferUsage, CollectionHandles, CollectionToken, ConfigCheck,
    ConfigCheckResult, DisplayConfigDescriptor, DisplayEngine, LayerContent,
};
use crate::coordinator::CoordinatorHandle;
use crate::status::Status;
use crate::types::{
    CompositionOpcode, ConfigStamp, DisplayId, DriverCaptureHandle, DriverCollectionId,
    DriverImageHandle, ImageMetadata, ImageTiling, Transform,
};
use log::{debug, info, trace};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Layers one display can scan out before the client has to merge
const MAX_HARDWARE_LAYERS: usize = 4;

/// A configuration as it reached the engine
#[derive(Debug, Clone)]
pub struct AppliedConfig {
    pub stamp: ConfigStamp,
    pub displays: Vec<DisplayConfigDescriptor>,
}

#[derive(Debug, Default)]
struct CollectionRecord {
    /// `None` until constraints were set and buffers allocated
    buffer_count: Option<u32>,
}

#[derive(Debug, Default)]
struct EngineState {
    next_handle: u64,
    collections: HashMap<DriverCollectionId, CollectionRecord>,
    images: HashSet<DriverImageHandle>,
    capture_images: HashSet<DriverCaptureHandle>,
    released: Vec<DriverImageHandle>,
    applied: Vec<AppliedConfig>,
    last_applied_stamp: ConfigStamp,
    scripted_check: Option<ConfigCheck>,
    check_calls: usize,
    capture_in_flight: Option<DriverCaptureHandle>,
    capture_starts: Vec<DriverCaptureHandle>,
    fail_next_capture: bool,
    fail_next_apply: bool,
    minimum_rgb: u8,
    power: HashMap<DisplayId, bool>,
}

impl EngineState {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_buffer(&self, collection: DriverCollectionId, index: u32) -> Result<(), Status> {
        let record = self.collections.get(&collection).ok_or(Status::InvalidArgs)?;
        let count = record.buffer_count.ok_or(Status::ShouldWait)?;
        if index >= count {
            return Err(Status::InvalidArgs);
        }
        Ok(())
    }
}

/// Engine that keeps everything in memory
pub struct HeadlessEngine {
    state: Mutex<EngineState>,
    capture_supported: bool,
}

impl HeadlessEngine {
    pub fn new(capture_supported: bool) -> Self {
        info!("Headless display engine created (capture {})", if capture_supported { "on" } else { "off" });
        Self {
            state: Mutex::new(EngineState::default()),
            capture_supported,
        }
    }

    /// Stamp of the most recent apply; reported with every vsync
    pub fn last_applied_stamp(&self) -> ConfigStamp {
        self.state.lock().last_applied_stamp
    }

    pub fn applied_configs(&self) -> Vec<AppliedConfig> {
        self.state.lock().applied.clone()
    }

    pub fn last_applied(&self) -> Option<AppliedConfig> {
        self.state.lock().applied.last().cloned()
    }

    /// Driver handles released so far, in release order
    pub fn released_images(&self) -> Vec<DriverImageHandle> {
        self.state.lock().released.clone()
    }

    pub fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Make every subsequent check return `check` instead of the built-in policy
    pub fn script_check(&self, check: Option<ConfigCheck>) {
        self.state.lock().scripted_check = check;
    }

    pub fn check_calls(&self) -> usize {
        self.state.lock().check_calls
    }

    pub fn capture_in_flight(&self) -> Option<DriverCaptureHandle> {
        self.state.lock().capture_in_flight
    }

    pub fn capture_starts(&self) -> Vec<DriverCaptureHandle> {
        self.state.lock().capture_starts.clone()
    }

    /// Let the next `start_capture` fail
    pub fn fail_next_capture(&self) {
        self.state.lock().fail_next_capture = true;
    }

    /// Let the next `apply_configuration` fail
    pub fn fail_next_apply(&self) {
        self.state.lock().fail_next_apply = true;
    }

    /// Capture targets imported and not yet released
    pub fn live_capture_count(&self) -> usize {
        self.state.lock().capture_images.len()
    }

    /// Mark the in-flight capture done. The caller still has to deliver the
    /// completion to the coordinator.
    pub fn finish_capture(&self) -> Option<DriverCaptureHandle> {
        self.state.lock().capture_in_flight.take()
    }

    pub fn minimum_rgb(&self) -> u8 {
        self.state.lock().minimum_rgb
    }

    pub fn display_power(&self, display: DisplayId) -> Option<bool> {
        self.state.lock().power.get(&display).copied()
    }
}

impl DisplayEngine for HeadlessEngine {
    fn import_buffer_collection(&self, collection: DriverCollectionId) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.collections.contains_key(&collection) {
            return Err(Status::AlreadyExists);
        }
        state.collections.insert(collection, CollectionRecord::default());
        Ok(())
    }

    fn release_buffer_collection(&self, collection: DriverCollectionId) -> Result<(), Status> {
        self.state
            .lock()
            .collections
            .remove(&collection)
            .map(|_| ())
            .ok_or(Status::NotFound)
    }

    fn set_buffer_collection_constraints(
        &self,
        usage: &BufferUsage,
        collection: DriverCollectionId,
    ) -> Result<(), Status> {
        let mut state = self.state.lock();
        let record = state.collections.get_mut(&collection).ok_or(Status::NotFound)?;
        record.buffer_count = Some(usage.min_buffer_count.max(1));
        debug!("Collection {} allocated with {:?}", collection, usage);
        Ok(())
    }

    fn import_image(
        &self,
        metadata: &ImageMetadata,
        collection: DriverCollectionId,
        index: u32,
    ) -> Result<DriverImageHandle, Status> {
        if metadata.tiling == ImageTiling::Capture || metadata.width == 0 || metadata.height == 0 {
            return Err(Status::InvalidArgs);
        }
        let mut state = self.state.lock();
        state.check_buffer(collection, index)?;
        let handle = DriverImageHandle(state.allocate_handle());
        state.images.insert(handle);
        trace!("Imported image {} from collection {}[{}]", handle, collection, index);
        Ok(handle)
    }

    fn import_image_for_capture(
        &self,
        collection: DriverCollectionId,
        index: u32,
    ) -> Result<DriverCaptureHandle, Status> {
        if !self.capture_supported {
            return Err(Status::NotSupported);
        }
        let mut state = self.state.lock();
        state.check_buffer(collection, index)?;
        let handle = DriverCaptureHandle(state.allocate_handle());
        state.capture_images.insert(handle);
        Ok(handle)
    }

    fn release_image(&self, image: DriverImageHandle) {
        let mut state = self.state.lock();
        if state.images.remove(&image) {
            state.released.push(image);
            trace!("Released image {}", image);
        }
    }

    fn release_capture_image(&self, image: DriverCaptureHandle) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.capture_in_flight == Some(image) {
            return Err(Status::ShouldWait);
        }
        if state.capture_images.remove(&image) {
            Ok(())
        } else {
            Err(Status::NotFound)
        }
    }

    fn check_configuration(&self, configs: &[DisplayConfigDescriptor]) -> ConfigCheck {
        let mut state = self.state.lock();
        state.check_calls += 1;
        if let Some(check) = &state.scripted_check {
            return check.clone();
        }
        let mut check = ConfigCheck::accept_all(configs);
        for (config, errors) in configs.iter().zip(check.layer_errors.iter_mut()) {
            if config.mode.width == 0 || config.mode.height == 0 {
                check.result = ConfigCheckResult::UnsupportedModes;
                break;
            }
            let overflow = config.layers.len() > MAX_HARDWARE_LAYERS;
            for (layer, error) in config.layers.iter().zip(errors.iter_mut()) {
                if overflow {
                    *error |= CompositionOpcode::MergeBase.bit();
                }
                if let LayerContent::Primary { transform, .. } = &layer.content {
                    if *transform != Transform::Identity {
                        *error |= CompositionOpcode::Transform.bit();
                    }
                }
            }
        }
        check
    }

    fn apply_configuration(&self, configs: &[DisplayConfigDescriptor], stamp: ConfigStamp) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.fail_next_apply {
            state.fail_next_apply = false;
            return Err(Status::Internal("display pipe fault".to_string()));
        }
        trace!("Applying {} display config(s) at stamp {}", configs.len(), stamp);
        state.last_applied_stamp = stamp;
        state.applied.push(AppliedConfig {
            stamp,
            displays: configs.to_vec(),
        });
        Ok(())
    }

    fn set_display_power(&self, display: DisplayId, power_on: bool) -> Result<(), Status> {
        self.state.lock().power.insert(display, power_on);
        Ok(())
    }

    fn set_minimum_rgb(&self, minimum_rgb: u8) -> Result<(), Status> {
        self.state.lock().minimum_rgb = minimum_rgb;
        Ok(())
    }

    fn is_capture_supported(&self) -> bool {
        self.capture_supported
    }

    fn start_capture(&self, image: DriverCaptureHandle) -> Result<(), Status> {
        if !self.capture_supported {
            return Err(Status::NotSupported);
        }
        let mut state = self.state.lock();
        if state.fail_next_capture {
            state.fail_next_capture = false;
            return Err(Status::Internal("capture engine fault".to_string()));
        }
        if state.capture_in_flight.is_some() {
            return Err(Status::ShouldWait);
        }
        if !state.capture_images.contains(&image) {
            return Err(Status::InvalidArgs);
        }
        state.capture_in_flight = Some(image);
        state.capture_starts.push(image);
        Ok(())
    }
}

/// Allocation service that hands out handles derived from the token
#[derive(Default)]
pub struct HeadlessAllocator {
    bound: Mutex<HashSet<u64>>,
    exhausted: AtomicBool,
}

impl HeadlessAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every bind fail with [`Status::NoMemory`]
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Relaxed);
    }

    /// Bindings not released yet
    pub fn live_bindings(&self) -> usize {
        self.bound.lock().len()
    }
}

impl BufferAllocator for HeadlessAllocator {
    fn bind_shared_collection(&self, token: CollectionToken) -> Result<CollectionHandles, Status> {
        if self.exhausted.load(Ordering::Relaxed) {
            return Err(Status::NoMemory);
        }
        if !self.bound.lock().insert(token.0) {
            // Tokens are single use.
            return Err(Status::InvalidArgs);
        }
        Ok(CollectionHandles {
            local: token.0,
            driver: DriverCollectionId(token.0),
        })
    }

    fn release_shared_collection(&self, handles: CollectionHandles) {
        if !self.bound.lock().remove(&handles.local) {
            debug!("Release of unbound collection {}", handles.driver);
        }
    }
}

/// Synthesizes vsync interrupts for the headless engine
pub struct VsyncTicker {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl VsyncTicker {
    /// Start one interrupt thread per `(display, refresh_hz)` pair
    pub fn start(
        handle: CoordinatorHandle,
        engine: Arc<HeadlessEngine>,
        displays: &[(DisplayId, u32)],
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let started = Instant::now();
        let mut threads = Vec::with_capacity(displays.len());

        for &(display_id, refresh_hz) in displays {
            let running = running.clone();
            let handle = handle.clone();
            let engine = engine.clone();
            let period = Duration::from_secs_f64(1.0 / f64::from(refresh_hz.max(1)));
            let thread = std::thread::Builder::new()
                .name(format!("vsync-{}", display_id))
                .spawn(move || {
                    debug!("Vsync source for display {} running every {:?}", display_id, period);
                    while running.load(Ordering::Relaxed) {
                        std::thread::sleep(period);
                        let timestamp = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
                        if !handle.on_vsync(display_id, timestamp, engine.last_applied_stamp()) {
                            break;
                        }
                    }
                })?;
            threads.push(thread);
        }

        Ok(Self { running, threads })
    }

    pub fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}
