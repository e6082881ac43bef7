//! Display-wide state and the apply/vsync pipeline
//!
//! [`CoordinatorCore`] is the part of the coordinator sessions call into
//! while handling a request. It owns the hardware handles, the controller
//! stamp and, for every display, the list of images the hardware may be
//! scanning out.

use crate::display::DisplayInfo;
use crate::engine::{BufferAllocator, DisplayConfigDescriptor, DisplayEngine};
use crate::image::Image;
use crate::status::Status;
use crate::types::{ClientId, ConfigStamp, DisplayId, DriverCaptureHandle, ImageId};
use log::{debug, trace, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

/// One display's share of a session's apply
#[derive(Debug)]
pub struct DisplayApply {
    pub descriptor: DisplayConfigDescriptor,
    /// The display's layer list changed since the last forwarded apply
    pub apply_layer_change: bool,
    /// Images of the current layers, bottom first
    pub images: Vec<Rc<Image>>,
}

/// Images that entered scanout with one controller stamp
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigImages {
    stamp: ConfigStamp,
    images: Vec<(ClientId, ImageId)>,
}

/// Coordinator-side bookkeeping for one physical display
#[derive(Debug)]
pub struct DisplayState {
    info: DisplayInfo,
    /// Images the hardware may be reading, oldest first
    images: VecDeque<Rc<Image>>,
    pending_layer_change: bool,
    pending_layer_change_stamp: ConfigStamp,
    switching_client: bool,
    /// Client whose apply waits for the layer change to land
    delayed_apply: Option<ClientId>,
    layer_count: usize,
    config_image_queue: VecDeque<ConfigImages>,
}

impl DisplayState {
    fn new(info: DisplayInfo) -> Self {
        Self {
            info,
            images: VecDeque::new(),
            pending_layer_change: false,
            pending_layer_change_stamp: ConfigStamp::INVALID,
            switching_client: false,
            delayed_apply: None,
            layer_count: 0,
            config_image_queue: VecDeque::new(),
        }
    }

    pub fn info(&self) -> &DisplayInfo {
        &self.info
    }

    pub fn presented_images(&self) -> impl Iterator<Item = &Rc<Image>> {
        self.images.iter()
    }
}

/// What one vsync changed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VsyncOutcome {
    /// Client whose deferred apply must be issued again
    pub reapply: Option<ClientId>,
    /// Images that entered scanout with the reported stamp
    pub presented: Vec<(ClientId, ImageId)>,
    /// Images taken off the display's presented list
    pub retired: Vec<(ClientId, ImageId)>,
}

#[derive(Debug, Serialize)]
pub struct DisplaySnapshot {
    pub id: DisplayId,
    pub layer_count: usize,
    pub presented_images: usize,
    pub pending_layer_change: bool,
    pub delayed_apply: Option<ClientId>,
}

pub struct CoordinatorCore {
    engine: Arc<dyn DisplayEngine>,
    allocator: Arc<dyn BufferAllocator>,
    displays: BTreeMap<DisplayId, DisplayState>,
    controller_stamp: ConfigStamp,
    applied_client: Option<ClientId>,
    vc_applied: bool,
    applied_layer_stamp: u64,
    max_layers: usize,
    live_layers: usize,
    stable_image_ids: HashSet<ImageId>,
    /// Released stable ids whose image is still on a display
    retiring_stable_ids: HashSet<ImageId>,
    /// Capture targets of torn-down sessions, released once the capture ends
    orphaned_captures: Vec<DriverCaptureHandle>,
}

impl CoordinatorCore {
    pub fn new(engine: Arc<dyn DisplayEngine>, allocator: Arc<dyn BufferAllocator>, max_layers: usize) -> Self {
        Self {
            engine,
            allocator,
            displays: BTreeMap::new(),
            controller_stamp: ConfigStamp::INVALID,
            applied_client: None,
            vc_applied: false,
            applied_layer_stamp: 0,
            max_layers,
            live_layers: 0,
            stable_image_ids: HashSet::new(),
            retiring_stable_ids: HashSet::new(),
            orphaned_captures: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn DisplayEngine> {
        &self.engine
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }

    pub fn controller_stamp(&self) -> ConfigStamp {
        self.controller_stamp
    }

    pub fn display(&self, id: DisplayId) -> Option<&DisplayState> {
        self.displays.get(&id)
    }

    pub fn display_infos(&self) -> Vec<DisplayInfo> {
        self.displays.values().map(|d| d.info.clone()).collect()
    }

    /// Count a new layer against the coordinator-wide limit
    pub fn reserve_layer(&mut self) -> Result<(), Status> {
        if self.live_layers >= self.max_layers {
            return Err(Status::NoResources);
        }
        self.live_layers += 1;
        Ok(())
    }

    pub fn release_layers(&mut self, count: usize) {
        debug_assert!(count <= self.live_layers);
        self.live_layers = self.live_layers.saturating_sub(count);
    }

    pub fn live_layers(&self) -> usize {
        self.live_layers
    }

    /// Claim a coordinator-wide image id. Fails if it is live anywhere.
    pub fn register_stable_image_id(&mut self, id: ImageId) -> bool {
        self.stable_image_ids.insert(id)
    }

    /// Give up a stable id after an import failed
    pub fn unregister_stable_image_id(&mut self, id: ImageId) {
        self.stable_image_ids.remove(&id);
    }

    /// Give up the stable id of a released image. The id stays claimed while
    /// any display still holds the image.
    pub fn release_stable_image_id(&mut self, image: &Rc<Image>) {
        let on_display = self
            .displays
            .values()
            .any(|display| display.images.iter().any(|queued| Rc::ptr_eq(queued, image)));
        if on_display {
            debug!("Image id {} stays reserved until it retires", image.id());
            self.retiring_stable_ids.insert(image.id());
        } else {
            self.stable_image_ids.remove(&image.id());
        }
    }

    pub fn is_stable_image_id_reserved(&self, id: ImageId) -> bool {
        self.stable_image_ids.contains(&id)
    }

    fn free_retired_stable_ids(&mut self, retired: &[(ClientId, ImageId)]) {
        for (_, id) in retired {
            if self.retiring_stable_ids.remove(id) {
                self.stable_image_ids.remove(id);
            }
        }
    }

    /// Hold a capture target the engine is still writing to
    pub fn orphan_capture(&mut self, handle: DriverCaptureHandle) {
        debug!("Capture target {} released once its capture completes", handle);
        self.orphaned_captures.push(handle);
    }

    /// Release capture targets orphaned while their capture ran
    pub fn release_orphaned_captures(&mut self) {
        let engine = self.engine.clone();
        self.orphaned_captures.retain(|handle| match engine.release_capture_image(*handle) {
            Ok(()) => false,
            Err(Status::ShouldWait) => true,
            Err(e) => {
                warn!("Failed to release orphaned capture target {}: {}", handle, e);
                false
            }
        });
    }

    pub fn orphaned_capture_count(&self) -> usize {
        self.orphaned_captures.len()
    }

    pub fn add_display(&mut self, info: DisplayInfo) {
        debug!("Display {} added", info.id);
        self.displays.insert(info.id, DisplayState::new(info));
    }

    /// Forget a display. Its presented images retire now since no vsync will
    /// ever confirm them.
    pub fn remove_display(&mut self, id: DisplayId) -> Vec<(ClientId, ImageId)> {
        let Some(display) = self.displays.remove(&id) else {
            return Vec::new();
        };
        debug!("Display {} removed, retiring {} image(s)", id, display.images.len());
        let retired: Vec<_> = display
            .images
            .into_iter()
            .map(|image| {
                image.on_retire();
                (image.client(), image.id())
            })
            .collect();
        self.free_retired_stable_ids(&retired);
        retired
    }

    /// Drop every deferred apply `client` still has queued
    pub fn cancel_delayed_apply(&mut self, client: ClientId) {
        for display in self.displays.values_mut() {
            if display.delayed_apply == Some(client) {
                display.delayed_apply = None;
            }
        }
    }

    /// Forward a session's configuration to the hardware.
    ///
    /// Returns the new controller stamp, or `None` when the apply has to wait
    /// for a layer change of another apply to land first. The deferred apply
    /// is handed back through [`VsyncOutcome::reapply`]. An apply the engine
    /// rejects also yields `None` and leaves every display untouched.
    pub fn apply_config(
        &mut self,
        applies: &[DisplayApply],
        is_vc: bool,
        client_stamp: ConfigStamp,
        layer_stamp: u64,
        client: ClientId,
    ) -> Option<ConfigStamp> {
        let switching_client = is_vc != self.vc_applied || Some(client) != self.applied_client;

        if switching_client || layer_stamp != self.applied_layer_stamp {
            for apply in applies {
                let Some(display) = self.displays.get_mut(&apply.descriptor.display_id) else {
                    continue;
                };
                if display.pending_layer_change {
                    debug!(
                        "Deferring apply of client {} until display {} confirms stamp {}",
                        client, display.info.id, display.pending_layer_change_stamp
                    );
                    display.delayed_apply = Some(client);
                    return None;
                }
            }
        }

        let stamp = self.controller_stamp.next();
        let descriptors: Vec<DisplayConfigDescriptor> = applies
            .iter()
            .filter(|apply| self.displays.contains_key(&apply.descriptor.display_id))
            .map(|apply| apply.descriptor.clone())
            .collect();
        if let Err(e) = self.engine.apply_configuration(&descriptors, stamp) {
            warn!("Engine rejected apply of client {} stamp {}: {}", client, client_stamp, e);
            return None;
        }
        self.controller_stamp = stamp;

        for apply in applies {
            let display_id = apply.descriptor.display_id;
            if !self.displays.contains_key(&display_id) {
                continue;
            }

            for image in &apply.images {
                image.start_present(stamp);
                if let Some(previous) = image.presented_on() {
                    if let Some(other) = self.displays.get_mut(&previous) {
                        other.images.retain(|queued| !Rc::ptr_eq(queued, image));
                    }
                }
                image.set_presented_on(Some(display_id));
            }

            let Some(display) = self.displays.get_mut(&display_id) else {
                continue;
            };
            display.switching_client = switching_client;
            display.pending_layer_change = apply.apply_layer_change || switching_client;
            if display.pending_layer_change {
                display.pending_layer_change_stamp = stamp;
            }
            display.layer_count = apply.descriptor.layers.len();
            display.delayed_apply = None;

            if display.layer_count > 0 {
                for image in &apply.images {
                    display.images.push_back(image.clone());
                }
                display.config_image_queue.push_back(ConfigImages {
                    stamp,
                    images: apply.images.iter().map(|i| (i.client(), i.id())).collect(),
                });
            }
        }

        self.vc_applied = is_vc;
        self.applied_client = Some(client);
        self.applied_layer_stamp = layer_stamp;

        trace!("Client {} stamp {} applied as controller stamp {}", client, client_stamp, stamp);
        Some(stamp)
    }

    /// Vsync bookkeeping for `display_id` reporting `stamp`
    pub fn on_display_vsync(&mut self, display_id: DisplayId, stamp: ConfigStamp) -> Option<VsyncOutcome> {
        let Some(display) = self.displays.get_mut(&display_id) else {
            debug!("Vsync for unknown display {}", display_id);
            return None;
        };
        let mut outcome = VsyncOutcome::default();

        if display.pending_layer_change && stamp >= display.pending_layer_change_stamp {
            display.pending_layer_change = false;
            display.pending_layer_change_stamp = ConfigStamp::INVALID;
            display.switching_client = false;
            outcome.reapply = display.delayed_apply.take();
        }

        while let Some(front) = display.config_image_queue.front() {
            if front.stamp > stamp {
                break;
            }
            if let Some(entry) = display.config_image_queue.pop_front() {
                if entry.stamp == stamp {
                    outcome.presented = entry.images;
                }
            }
        }

        if !display.pending_layer_change {
            display.images.retain(|image| {
                if image.latest_controller_stamp() < stamp {
                    image.on_retire();
                    outcome.retired.push((image.client(), image.id()));
                    false
                } else {
                    true
                }
            });
        }

        self.free_retired_stable_ids(&outcome.retired);
        Some(outcome)
    }

    pub fn snapshot(&self) -> Vec<DisplaySnapshot> {
        self.displays
            .values()
            .map(|display| DisplaySnapshot {
                id: display.info.id,
                layer_count: display.layer_count,
                presented_images: display.images.len(),
                pending_layer_change: display.pending_layer_change,
                delayed_apply: display.delayed_apply,
            })
            .collect()
    }
}
