//! Per-client protocol handling
//!
//! A [`Session`] owns every resource one client created: images, layers,
//! buffer collections, gamma tables, fences and its view of each display's
//! configuration. Requests arrive one at a time on the coordinator worker.
//! Recoverable failures come back as a [`Status`]; anything that breaks the
//! protocol is reported as [`SessionError::ProtocolViolation`], after which
//! the coordinator tears the session down.

pub mod check;
pub mod proxy;
pub mod registry;

pub use check::{CheckOutcome, ClientCompositionOp, ConfigResult};
pub use proxy::{ProxyFlags, SessionEvent, SessionProxy, VsyncLimits};
pub use registry::ResourceTable;

use crate::coordinator::core::{CoordinatorCore, DisplayApply};
use crate::display::{DisplayConfigSet, DisplayInfo};
use crate::engine::{BufferUsage, CollectionHandles, CollectionToken};
use crate::fence::{Event, FenceKey, FenceRegistry};
use crate::image::Image;
use crate::layer::{Layer, LayerConfig};
use crate::status::Status;
use crate::types::{
    AlphaMode, BufferCollectionId, ClientId, ClientKind, ColorConversion, ConfigStamp, DisplayId,
    DisplayMode, DriverCaptureHandle, EventId, Frame, GammaTable, GammaTableId, ImageId, ImageMetadata,
    ImageTiling, LayerId, PixelFormat, Transform, VirtconMode, VsyncAckCookie,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Entries in each channel of a gamma table
pub const GAMMA_TABLE_SIZE: usize = 256;

/// Client request
#[derive(Debug)]
pub enum Request {
    ImportImage {
        collection_id: BufferCollectionId,
        metadata: ImageMetadata,
        index: u32,
    },
    /// Import under a client-chosen id, unique across all sessions
    ImportImageWithId {
        collection_id: BufferCollectionId,
        image_id: ImageId,
        metadata: ImageMetadata,
        index: u32,
    },
    ReleaseImage {
        image_id: ImageId,
    },
    ImportEvent {
        event: Event,
        id: EventId,
    },
    ReleaseEvent {
        id: EventId,
    },
    ImportBufferCollection {
        collection_id: BufferCollectionId,
        token: CollectionToken,
    },
    ReleaseBufferCollection {
        collection_id: BufferCollectionId,
    },
    SetBufferCollectionConstraints {
        collection_id: BufferCollectionId,
        usage: BufferUsage,
    },
    CreateLayer,
    DestroyLayer {
        layer_id: LayerId,
    },
    SetLayerPrimaryConfig {
        layer_id: LayerId,
        metadata: ImageMetadata,
    },
    SetLayerPrimaryPosition {
        layer_id: LayerId,
        transform: Transform,
        src_frame: Frame,
        dest_frame: Frame,
    },
    SetLayerPrimaryAlpha {
        layer_id: LayerId,
        mode: AlphaMode,
        alpha: f32,
    },
    SetLayerCursorConfig {
        layer_id: LayerId,
        metadata: ImageMetadata,
    },
    SetLayerCursorPosition {
        layer_id: LayerId,
        x: i32,
        y: i32,
    },
    SetLayerColorConfig {
        layer_id: LayerId,
        format: PixelFormat,
        bytes: Vec<u8>,
    },
    SetLayerImage {
        layer_id: LayerId,
        image_id: ImageId,
        wait_event: Option<EventId>,
    },
    SetDisplayMode {
        display_id: DisplayId,
        mode: DisplayMode,
    },
    SetDisplayColorConversion {
        display_id: DisplayId,
        conversion: ColorConversion,
    },
    SetDisplayLayers {
        display_id: DisplayId,
        layer_ids: Vec<LayerId>,
    },
    ImportGammaTable {
        id: GammaTableId,
        red: Vec<f32>,
        green: Vec<f32>,
        blue: Vec<f32>,
    },
    ReleaseGammaTable {
        id: GammaTableId,
    },
    SetDisplayGammaTable {
        display_id: DisplayId,
        id: GammaTableId,
    },
    CheckConfig {
        discard: bool,
    },
    ApplyConfig,
    GetLatestAppliedConfigStamp,
    EnableVsync {
        enable: bool,
    },
    AcknowledgeVsync {
        cookie: VsyncAckCookie,
    },
    SetDisplayPower {
        display_id: DisplayId,
        power_on: bool,
    },
    SetMinimumRgb {
        minimum_rgb: u8,
    },
    IsCaptureSupported,
    StartCapture {
        signal_event: EventId,
        image_id: ImageId,
    },
    ReleaseCapture {
        image_id: ImageId,
    },
    /// Only honored from the virtual console
    SetVirtconMode {
        mode: VirtconMode,
    },
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    None,
    Image(ImageId),
    Layer(LayerId),
    Check(CheckOutcome),
    Stamp(ConfigStamp),
    CaptureSupported(bool),
}

/// Failure of a request
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Recoverable, reported to the client
    Status(Status),
    /// Fatal to the session
    ProtocolViolation(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Status(status) => write!(f, "{}", status),
            SessionError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<Status> for SessionError {
    fn from(status: Status) -> Self {
        SessionError::Status(status)
    }
}

fn violation(msg: impl Into<String>) -> SessionError {
    SessionError::ProtocolViolation(msg.into())
}

type SessionResult<T> = Result<T, SessionError>;

/// Whether the pending configuration passed its last check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigValidity {
    Unknown,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
struct CaptureImage {
    handle: DriverCaptureHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlightCapture {
    image: ImageId,
    signal_event: EventId,
}

#[derive(Debug, Serialize)]
pub struct SessionSnapshot {
    pub id: ClientId,
    pub kind: ClientKind,
    pub is_owner: bool,
    pub images: usize,
    pub capture_images: usize,
    pub layers: usize,
    pub validity: ConfigValidity,
    pub latest_config_stamp: ConfigStamp,
    pub vsync_enabled: bool,
}

pub struct Session {
    id: ClientId,
    kind: ClientKind,
    proxy: SessionProxy,
    images: ResourceTable<ImageId, Rc<Image>>,
    /// Image ids registered with the coordinator-wide id space
    stable_ids: HashSet<ImageId>,
    capture_images: ResourceTable<ImageId, CaptureImage>,
    layers: ResourceTable<LayerId, Layer>,
    collections: HashMap<BufferCollectionId, CollectionHandles>,
    gamma_tables: HashMap<GammaTableId, Arc<GammaTable>>,
    fences: FenceRegistry,
    configs: BTreeMap<DisplayId, DisplayConfigSet>,
    validity: ConfigValidity,
    is_owner: bool,
    /// Client stamp of the latest apply
    latest_config_stamp: ConfigStamp,
    /// Applies issued so far; doubles as the layer-change sequence
    apply_count: u64,
    capture: Option<InFlightCapture>,
    deferred_capture_release: Option<ImageId>,
    torn_down: bool,
}

impl Session {
    pub fn new(id: ClientId, kind: ClientKind, proxy: SessionProxy, fences: FenceRegistry) -> Self {
        Self {
            id,
            kind,
            proxy,
            images: ResourceTable::new(),
            stable_ids: HashSet::new(),
            capture_images: ResourceTable::new(),
            layers: ResourceTable::new(),
            collections: HashMap::new(),
            gamma_tables: HashMap::new(),
            fences,
            configs: BTreeMap::new(),
            validity: ConfigValidity::Unknown,
            is_owner: false,
            latest_config_stamp: ConfigStamp::INVALID,
            apply_count: 0,
            capture: None,
            deferred_capture_release: None,
            torn_down: false,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn flags(&self) -> Arc<ProxyFlags> {
        self.proxy.flags()
    }

    pub fn image(&self, id: ImageId) -> Option<&Rc<Image>> {
        self.images.get(id)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn config(&self, display: DisplayId) -> Option<&DisplayConfigSet> {
        self.configs.get(&display)
    }

    pub fn handle(&mut self, request: Request, core: &mut CoordinatorCore) -> SessionResult<Reply> {
        match request {
            Request::ImportImage { collection_id, metadata, index } => self
                .import_image(collection_id, None, metadata, index, core)
                .map(Reply::Image),
            Request::ImportImageWithId { collection_id, image_id, metadata, index } => self
                .import_image(collection_id, Some(image_id), metadata, index, core)
                .map(Reply::Image),
            Request::ReleaseImage { image_id } => {
                self.release_image(image_id, core);
                Ok(Reply::None)
            }
            Request::ImportEvent { event, id } => {
                self.fences
                    .import_event(event, id)
                    .map_err(|e| violation(e.to_string()))?;
                Ok(Reply::None)
            }
            Request::ReleaseEvent { id } => {
                self.fences.release_event(id);
                Ok(Reply::None)
            }
            Request::ImportBufferCollection { collection_id, token } => {
                self.import_buffer_collection(collection_id, token, core)?;
                Ok(Reply::None)
            }
            Request::ReleaseBufferCollection { collection_id } => {
                self.release_buffer_collection(collection_id, core);
                Ok(Reply::None)
            }
            Request::SetBufferCollectionConstraints { collection_id, usage } => {
                let handles = self.collections.get(&collection_id).ok_or(Status::InvalidArgs)?;
                core.engine()
                    .set_buffer_collection_constraints(&usage, handles.driver)?;
                Ok(Reply::None)
            }
            Request::CreateLayer => {
                core.reserve_layer()?;
                Ok(Reply::Layer(self.layers.insert_with(Layer::new)))
            }
            Request::DestroyLayer { layer_id } => {
                self.destroy_layer(layer_id, core)?;
                Ok(Reply::None)
            }
            Request::SetLayerPrimaryConfig { layer_id, metadata } => {
                self.layer_mut(layer_id)?.set_primary_config(metadata);
                self.validity = ConfigValidity::Unknown;
                Ok(Reply::None)
            }
            Request::SetLayerPrimaryPosition { layer_id, transform, src_frame, dest_frame } => {
                if !self
                    .layer_mut(layer_id)?
                    .set_primary_position(transform, src_frame, dest_frame)
                {
                    return Err(violation(format!("layer {} is not a primary layer", layer_id)));
                }
                self.validity = ConfigValidity::Unknown;
                Ok(Reply::None)
            }
            Request::SetLayerPrimaryAlpha { layer_id, mode, alpha } => {
                if !(0.0..=1.0).contains(&alpha) {
                    return Err(violation(format!("alpha {} out of range", alpha)));
                }
                if !self.layer_mut(layer_id)?.set_primary_alpha(mode, alpha) {
                    return Err(violation(format!("layer {} is not a primary layer", layer_id)));
                }
                self.validity = ConfigValidity::Unknown;
                Ok(Reply::None)
            }
            Request::SetLayerCursorConfig { layer_id, metadata } => {
                self.layer_mut(layer_id)?.set_cursor_config(metadata);
                self.validity = ConfigValidity::Unknown;
                Ok(Reply::None)
            }
            Request::SetLayerCursorPosition { layer_id, x, y } => {
                if !self.layer_mut(layer_id)?.set_cursor_position(x, y) {
                    return Err(violation(format!("layer {} is not a cursor layer", layer_id)));
                }
                self.validity = ConfigValidity::Unknown;
                Ok(Reply::None)
            }
            Request::SetLayerColorConfig { layer_id, format, bytes } => {
                self.layer_mut(layer_id)?.set_color_config(format, bytes);
                self.validity = ConfigValidity::Unknown;
                Ok(Reply::None)
            }
            Request::SetLayerImage { layer_id, image_id, wait_event } => {
                self.set_layer_image(layer_id, image_id, wait_event)?;
                Ok(Reply::None)
            }
            Request::SetDisplayMode { display_id, mode } => {
                self.set_display_mode(display_id, mode)?;
                Ok(Reply::None)
            }
            Request::SetDisplayColorConversion { display_id, conversion } => {
                match self.configs.get_mut(&display_id) {
                    Some(config) => {
                        config.pending.color_conversion = conversion;
                        config.display_config_change = true;
                        self.validity = ConfigValidity::Unknown;
                    }
                    None => debug!("Client {} set color conversion on unknown display {}", self.id, display_id),
                }
                Ok(Reply::None)
            }
            Request::SetDisplayLayers { display_id, layer_ids } => {
                self.set_display_layers(display_id, layer_ids)?;
                Ok(Reply::None)
            }
            Request::ImportGammaTable { id, red, green, blue } => {
                self.import_gamma_table(id, red, green, blue)?;
                Ok(Reply::None)
            }
            Request::ReleaseGammaTable { id } => {
                self.gamma_tables.remove(&id);
                Ok(Reply::None)
            }
            Request::SetDisplayGammaTable { display_id, id } => {
                self.set_display_gamma_table(display_id, id)?;
                Ok(Reply::None)
            }
            Request::CheckConfig { discard } => Ok(Reply::Check(self.check_config(discard, core))),
            Request::ApplyConfig => {
                self.apply_config(core)?;
                Ok(Reply::None)
            }
            Request::GetLatestAppliedConfigStamp => Ok(Reply::Stamp(self.latest_config_stamp)),
            Request::EnableVsync { enable } => {
                self.proxy.enable_vsync(enable);
                Ok(Reply::None)
            }
            Request::AcknowledgeVsync { cookie } => {
                self.proxy.acknowledge_vsync(cookie);
                Ok(Reply::None)
            }
            Request::SetDisplayPower { display_id, power_on } => {
                if !self.configs.contains_key(&display_id) {
                    return Err(Status::NotFound.into());
                }
                core.engine().set_display_power(display_id, power_on)?;
                Ok(Reply::None)
            }
            Request::SetMinimumRgb { minimum_rgb } => {
                if !self.is_owner {
                    return Err(Status::AccessDenied.into());
                }
                core.engine().set_minimum_rgb(minimum_rgb)?;
                Ok(Reply::None)
            }
            Request::IsCaptureSupported => Ok(Reply::CaptureSupported(core.engine().is_capture_supported())),
            Request::StartCapture { signal_event, image_id } => {
                self.start_capture(signal_event, image_id, core)?;
                Ok(Reply::None)
            }
            Request::ReleaseCapture { image_id } => {
                self.release_capture(image_id, core)?;
                Ok(Reply::None)
            }
            // The coordinator answers this one before it reaches a session.
            Request::SetVirtconMode { .. } => Err(Status::BadState.into()),
        }
    }

    fn layer_mut(&mut self, id: LayerId) -> SessionResult<&mut Layer> {
        self.layers
            .get_mut(id)
            .ok_or_else(|| violation(format!("unknown layer {}", id)))
    }

    fn is_layer_current(&self, id: LayerId) -> bool {
        self.configs.values().any(|config| config.current_layers.contains(&id))
    }

    fn import_image(
        &mut self,
        collection_id: BufferCollectionId,
        client_id: Option<ImageId>,
        metadata: ImageMetadata,
        index: u32,
        core: &mut CoordinatorCore,
    ) -> SessionResult<ImageId> {
        if client_id == Some(ImageId::INVALID) {
            return Err(violation(format!("image id {} is reserved", ImageId::INVALID)));
        }
        let handles = *self.collections.get(&collection_id).ok_or(Status::InvalidArgs)?;

        if metadata.tiling == ImageTiling::Capture {
            if client_id.is_some_and(|id| self.capture_images.contains(id)) {
                return Err(Status::AlreadyExists.into());
            }
            let handle = core.engine().import_image_for_capture(handles.driver, index)?;
            let capture = CaptureImage { handle };
            return Ok(match client_id {
                Some(id) => {
                    let _ = self.capture_images.insert(id, capture);
                    id
                }
                None => self.capture_images.insert_fresh(capture),
            });
        }

        if let Some(id) = client_id {
            if self.images.contains(id) || !core.register_stable_image_id(id) {
                return Err(Status::AlreadyExists.into());
            }
        }
        let handle = match core.engine().import_image(&metadata, handles.driver, index) {
            Ok(handle) => handle,
            Err(status) => {
                if let Some(id) = client_id {
                    core.unregister_stable_image_id(id);
                }
                return Err(status.into());
            }
        };

        let id = client_id.unwrap_or_else(|| self.images.fresh_id());
        let image = Rc::new(Image::new(id, self.id, metadata, handle, core.engine().clone()));
        if self.images.insert(id, image).is_err() {
            return Err(Status::AlreadyExists.into());
        }
        if client_id.is_some() {
            self.stable_ids.insert(id);
        }
        Ok(id)
    }

    fn release_image(&mut self, id: ImageId, core: &mut CoordinatorCore) {
        let Some(image) = self.images.remove(id) else {
            debug!("Client {} released unknown image {}", self.id, id);
            return;
        };
        if self.stable_ids.remove(&id) {
            core.release_stable_image_id(&image);
        }
        if self.clean_up_image(Some(&image)) {
            self.apply_config_internal(core);
        }
    }

    /// Drop layer references to `target` (or every image). Returns whether a
    /// displayed image of a current layer went away.
    fn clean_up_image(&mut self, target: Option<&Rc<Image>>) -> bool {
        let current: HashSet<LayerId> = self
            .configs
            .values()
            .flat_map(|config| config.current_layers.iter().copied())
            .collect();
        let mut changed = false;
        for layer in self.layers.values_mut() {
            if layer.clean_up_image(target, &mut self.fences) && current.contains(&layer.id()) {
                changed = true;
            }
        }
        changed
    }

    fn import_buffer_collection(
        &mut self,
        collection_id: BufferCollectionId,
        token: CollectionToken,
        core: &mut CoordinatorCore,
    ) -> SessionResult<()> {
        if self.collections.contains_key(&collection_id) {
            return Err(violation(format!("buffer collection {} imported twice", collection_id)));
        }
        let handles = core.allocator().bind_shared_collection(token)?;
        if let Err(status) = core.engine().import_buffer_collection(handles.driver) {
            core.allocator().release_shared_collection(handles);
            return Err(status.into());
        }
        self.collections.insert(collection_id, handles);
        Ok(())
    }

    fn release_buffer_collection(&mut self, collection_id: BufferCollectionId, core: &mut CoordinatorCore) {
        let Some(handles) = self.collections.remove(&collection_id) else {
            debug!("Client {} released unknown buffer collection {}", self.id, collection_id);
            return;
        };
        if let Err(e) = core.engine().release_buffer_collection(handles.driver) {
            warn!("Failed to release buffer collection {}: {}", collection_id, e);
        }
        core.allocator().release_shared_collection(handles);
    }

    fn destroy_layer(&mut self, id: LayerId, core: &mut CoordinatorCore) -> SessionResult<()> {
        let Some(layer) = self.layers.get(id) else {
            return Err(violation(format!("destroying unknown layer {}", id)));
        };
        if layer.pending_display().is_some() || self.is_layer_current(id) {
            return Err(violation(format!("destroying layer {} while in use", id)));
        }
        if let Some(mut layer) = self.layers.remove(id) {
            layer.clean_up_image(None, &mut self.fences);
            core.release_layers(1);
        }
        Ok(())
    }

    fn set_layer_image(&mut self, layer_id: LayerId, image_id: ImageId, wait: Option<EventId>) -> SessionResult<()> {
        let image = self
            .images
            .get(image_id)
            .cloned()
            .ok_or_else(|| violation(format!("unknown image {}", image_id)))?;
        let layer = self.layer_mut(layer_id)?;
        if !image.acquire() {
            return Err(violation(format!("image {} is already in use", image_id)));
        }
        let compatible = layer
            .pending_config()
            .and_then(LayerConfig::image_config)
            .is_some_and(|config| image.has_same_config(config));
        if !compatible {
            image.discard_acquire();
            return Err(violation(format!(
                "image {} does not match the config of layer {}",
                image_id, layer_id
            )));
        }
        layer.set_image(image, wait);
        self.validity = ConfigValidity::Unknown;
        Ok(())
    }

    fn set_display_mode(&mut self, display_id: DisplayId, mode: DisplayMode) -> SessionResult<()> {
        let Some(config) = self.configs.get_mut(&display_id) else {
            debug!("Client {} set mode on unknown display {}", self.id, display_id);
            return Ok(());
        };
        if !config.has_mode(&mode) {
            return Err(violation(format!("display {} has no mode {:?}", display_id, mode)));
        }
        config.pending.mode = mode;
        config.display_config_change = true;
        self.validity = ConfigValidity::Unknown;
        Ok(())
    }

    fn set_display_layers(&mut self, display_id: DisplayId, layer_ids: Vec<LayerId>) -> SessionResult<()> {
        let Some(config) = self.configs.get_mut(&display_id) else {
            debug!("Client {} set layers on unknown display {}", self.id, display_id);
            return Ok(());
        };

        let mut seen = HashSet::with_capacity(layer_ids.len());
        for id in &layer_ids {
            if !self.layers.contains(*id) {
                return Err(violation(format!("unknown layer {}", id)));
            }
            if !seen.insert(*id) {
                return Err(violation(format!("layer {} listed twice", id)));
            }
        }

        for id in &config.pending_layers {
            if let Some(layer) = self.layers.get_mut(*id) {
                layer.remove_from_config();
            }
        }
        for id in &layer_ids {
            if let Some(layer) = self.layers.get_mut(*id) {
                if !layer.add_to_config(display_id) {
                    return Err(violation(format!("layer {} is already on another display", id)));
                }
            }
        }
        config.set_pending_layers(layer_ids);
        self.validity = ConfigValidity::Unknown;
        Ok(())
    }

    fn import_gamma_table(&mut self, id: GammaTableId, red: Vec<f32>, green: Vec<f32>, blue: Vec<f32>) -> SessionResult<()> {
        if self.gamma_tables.contains_key(&id) {
            return Err(violation(format!("gamma table {} imported twice", id)));
        }
        if [&red, &green, &blue].iter().any(|c| c.len() != GAMMA_TABLE_SIZE) {
            return Err(violation(format!("gamma table {} has wrong size", id)));
        }
        self.gamma_tables
            .insert(id, Arc::new(GammaTable { id, red, green, blue }));
        Ok(())
    }

    fn set_display_gamma_table(&mut self, display_id: DisplayId, id: GammaTableId) -> SessionResult<()> {
        let table = self
            .gamma_tables
            .get(&id)
            .cloned()
            .ok_or_else(|| violation(format!("unknown gamma table {}", id)))?;
        match self.configs.get_mut(&display_id) {
            Some(config) => {
                config.pending.gamma_table = Some(table);
                config.display_config_change = true;
                self.validity = ConfigValidity::Unknown;
            }
            None => debug!("Client {} set gamma on unknown display {}", self.id, display_id),
        }
        Ok(())
    }

    fn check_config(&mut self, discard: bool, core: &CoordinatorCore) -> CheckOutcome {
        let outcome = check::check_pending_config(&self.configs, &self.layers, core.engine().as_ref());
        self.validity = if outcome.is_ok() {
            ConfigValidity::Valid
        } else {
            ConfigValidity::Invalid
        };
        if discard {
            self.discard_config();
            self.validity = ConfigValidity::Valid;
        }
        outcome
    }

    /// Roll every pending edit back to the current configuration, including
    /// layers moved between displays
    fn discard_config(&mut self) {
        for config in self.configs.values_mut() {
            config.discard();
        }
        for layer in self.layers.values_mut() {
            layer.discard_changes();
            layer.remove_from_config();
        }
        for config in self.configs.values() {
            for id in &config.pending_layers {
                if let Some(layer) = self.layers.get_mut(*id) {
                    let added = layer.add_to_config(config.id);
                    debug_assert!(added, "layer {} current on two displays", id);
                }
            }
        }
    }

    fn apply_config(&mut self, core: &mut CoordinatorCore) -> SessionResult<()> {
        if self.validity != ConfigValidity::Valid {
            let outcome = self.check_config(false, core);
            if !outcome.is_ok() {
                info!("Client {} apply rejected: {:?}", self.id, outcome.result);
                return Err(Status::BadState.into());
            }
        }

        self.latest_config_stamp = self.latest_config_stamp.next();
        let stamp = self.latest_config_stamp;
        for config in self.configs.values_mut() {
            config.commit_display_config();
            for id in &config.pending_layers {
                if let Some(layer) = self.layers.get_mut(*id) {
                    layer.resolve_pending_layer_properties();
                    layer.resolve_pending_image(&mut self.fences, stamp);
                }
            }
            config.commit_layers();
        }
        self.apply_count += 1;
        self.apply_config_internal(core);
        Ok(())
    }

    /// Hand the current configuration to the coordinator if this session owns
    /// the displays and every image layer has something to show
    fn apply_config_internal(&mut self, core: &mut CoordinatorCore) {
        let mut stamp = self.latest_config_stamp;
        let mut missing_image = false;
        let mut applies = Vec::with_capacity(self.configs.len());

        for config in self.configs.values_mut() {
            let mut descriptors = Vec::with_capacity(config.current_layers.len());
            let mut images = Vec::new();
            for (z_index, id) in config.current_layers.iter().enumerate() {
                let Some(layer) = self.layers.get_mut(*id) else {
                    continue;
                };
                if layer.activate_latest_ready_image(&mut self.fences) {
                    config.pending_apply_layer_change = true;
                }
                if !layer.is_color() {
                    match layer.current_client_stamp() {
                        Some(layer_stamp) => stamp = stamp.min(layer_stamp),
                        None => missing_image = true,
                    }
                }
                if let Some(image) = layer.displayed_image() {
                    images.push(image.clone());
                }
                if let Some(descriptor) = layer.current_descriptor(z_index as u32) {
                    descriptors.push(descriptor);
                }
            }
            applies.push(DisplayApply {
                descriptor: config.current_descriptor(descriptors),
                apply_layer_change: config.pending_apply_layer_change,
                images,
            });
        }

        if !self.is_owner {
            return;
        }
        if missing_image {
            debug!("Client {} apply waits for layer images", self.id);
            return;
        }
        let is_vc = self.kind == ClientKind::Virtcon;
        let Some(controller_stamp) = core.apply_config(&applies, is_vc, stamp, self.apply_count, self.id) else {
            return;
        };
        for config in self.configs.values_mut() {
            config.pending_apply_layer_change = false;
        }
        self.proxy.update_config_stamp_mapping(controller_stamp, stamp);
    }

    /// Issue the apply the coordinator deferred
    pub fn reapply(&mut self, core: &mut CoordinatorCore) {
        self.apply_config_internal(core);
    }

    pub fn set_ownership(&mut self, is_owner: bool, core: &mut CoordinatorCore) {
        self.is_owner = is_owner;
        self.proxy.on_ownership_change(is_owner);
        if self.apply_count > 0 {
            self.apply_config_internal(core);
        }
    }

    pub fn on_fence_fired(&mut self, key: FenceKey, core: &mut CoordinatorCore) {
        if !self.fences.on_fired(key) {
            return;
        }
        let mut ready = false;
        for layer in self.layers.values_mut() {
            ready |= layer.on_fence_fired(key);
        }
        if ready {
            self.apply_config_internal(core);
        }
    }

    pub fn on_displays_changed(&mut self, added: &[DisplayInfo], removed: &[DisplayId]) {
        for id in removed {
            if let Some(config) = self.configs.remove(id) {
                for layer_id in &config.pending_layers {
                    if let Some(layer) = self.layers.get_mut(*layer_id) {
                        layer.remove_from_config();
                    }
                }
            }
        }
        for info in added {
            self.configs.insert(info.id, DisplayConfigSet::new(info.clone()));
        }
        self.validity = ConfigValidity::Unknown;
        self.proxy.on_displays_changed(added.to_vec(), removed.to_vec());
    }

    /// Controller `controller_stamp` reached `display_id`
    pub fn on_display_vsync(&mut self, display_id: DisplayId, timestamp: u64, controller_stamp: ConfigStamp) {
        let stamp = self
            .proxy
            .owns_controller_stamp(controller_stamp)
            .unwrap_or(ConfigStamp::INVALID);
        self.proxy.on_display_vsync(display_id, timestamp, stamp);
    }

    fn start_capture(&mut self, signal_event: EventId, image_id: ImageId, core: &mut CoordinatorCore) -> SessionResult<()> {
        if !core.engine().is_capture_supported() {
            return Err(Status::NotSupported.into());
        }
        if !self.is_owner {
            return Err(Status::AccessDenied.into());
        }
        if self.capture.is_some() {
            return Err(Status::ShouldWait.into());
        }
        let image = self.capture_images.get(image_id).ok_or(Status::InvalidArgs)?;
        if !self.fences.contains(signal_event) {
            return Err(Status::InvalidArgs.into());
        }
        core.engine().start_capture(image.handle)?;
        self.proxy.set_capture_active(true);
        self.capture = Some(InFlightCapture { image: image_id, signal_event });
        Ok(())
    }

    fn release_capture(&mut self, image_id: ImageId, core: &mut CoordinatorCore) -> SessionResult<()> {
        if !self.capture_images.contains(image_id) {
            return Err(Status::InvalidArgs.into());
        }
        if self.capture.is_some_and(|c| c.image == image_id) {
            self.deferred_capture_release = Some(image_id);
            return Ok(());
        }
        if let Some(image) = self.capture_images.remove(image_id) {
            core.engine().release_capture_image(image.handle)?;
        }
        Ok(())
    }

    pub fn capture_active(&self) -> bool {
        self.capture.is_some()
    }

    pub fn on_capture_complete(&mut self, core: &mut CoordinatorCore) {
        let Some(capture) = self.capture.take() else {
            return;
        };
        self.fences.signal(capture.signal_event);
        self.proxy.set_capture_active(false);
        if self.deferred_capture_release == Some(capture.image) {
            self.deferred_capture_release = None;
            if let Some(image) = self.capture_images.remove(capture.image) {
                if let Err(e) = core.engine().release_capture_image(image.handle) {
                    warn!("Failed to release capture image {}: {}", capture.image, e);
                }
            }
        }
    }

    /// Release everything the client owns and clear its hardware state.
    /// Safe to call more than once.
    pub fn tear_down(&mut self, core: &mut CoordinatorCore) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.proxy.enable_vsync(false);

        let images = self.images.take_all();
        self.clean_up_image(None);
        self.fences.clear();
        for (id, image) in &images {
            if self.stable_ids.remove(id) {
                core.release_stable_image_id(image);
            }
        }
        drop(images);

        let in_flight = self.capture.take().map(|capture| capture.image);
        self.deferred_capture_release = None;
        self.proxy.set_capture_active(false);
        for (id, image) in self.capture_images.take_all() {
            if in_flight == Some(id) {
                core.orphan_capture(image.handle);
                continue;
            }
            if let Err(e) = core.engine().release_capture_image(image.handle) {
                warn!("Failed to release capture image {} during teardown: {}", id, e);
            }
        }

        for config in self.configs.values_mut() {
            if !config.current_layers.is_empty() {
                config.pending_apply_layer_change = true;
            }
            config.pending_layers.clear();
            config.current_layers.clear();
            config.pending.layer_count = 0;
            config.current.layer_count = 0;
            config.pending_layer_change = false;
        }
        let layers = self.layers.take_all();
        core.release_layers(layers.len());
        drop(layers);

        for (id, handles) in self.collections.drain() {
            if let Err(e) = core.engine().release_buffer_collection(handles.driver) {
                warn!("Failed to release buffer collection {} during teardown: {}", id, e);
            }
            core.allocator().release_shared_collection(handles);
        }
        self.gamma_tables.clear();

        self.apply_config_internal(core);
        self.proxy.clear_stamp_mapping();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            kind: self.kind,
            is_owner: self.is_owner,
            images: self.images.len(),
            capture_images: self.capture_images.len(),
            layers: self.layers.len(),
            validity: self.validity,
            latest_config_stamp: self.latest_config_stamp,
            vsync_enabled: self.proxy.flags().vsync_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DisplayEngine, HeadlessAllocator, HeadlessEngine, LayerContent};
    use crate::fence::FenceNotifier;
    use crate::image::ImageState;
    use crate::types::{DisplayMode, DriverCollectionId};
    use tokio::sync::mpsc;

    struct Harness {
        engine: Arc<HeadlessEngine>,
        allocator: Arc<HeadlessAllocator>,
        core: CoordinatorCore,
        session: Session,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        next_token: u64,
    }

    fn display(id: u64) -> DisplayInfo {
        DisplayInfo {
            id: DisplayId(id),
            modes: vec![
                DisplayMode { width: 128, height: 128, refresh_rate_millihertz: 60_000 },
                DisplayMode { width: 64, height: 64, refresh_rate_millihertz: 60_000 },
            ],
            pixel_formats: vec![PixelFormat::Argb8888],
            cursor_formats: vec![PixelFormat::Argb8888],
        }
    }

    impl Harness {
        fn new(capture_supported: bool) -> Self {
            let engine = Arc::new(HeadlessEngine::new(capture_supported));
            let allocator = Arc::new(HeadlessAllocator::new());
            let mut core = CoordinatorCore::new(engine.clone(), allocator.clone(), 16);
            let displays = [display(1), display(2)];
            for info in &displays {
                core.add_display(info.clone());
            }
            let (tx, events) = mpsc::unbounded_channel();
            let proxy = SessionProxy::new(ClientId(1), tx, VsyncLimits::default());
            let notifier: FenceNotifier = Arc::new(|_, _| {});
            let mut session = Session::new(ClientId(1), ClientKind::Primary, proxy, FenceRegistry::new(ClientId(1), notifier));
            session.on_displays_changed(&displays, &[]);
            session.set_ownership(true, &mut core);
            Self { engine, allocator, core, session, events, next_token: 0 }
        }

        fn call(&mut self, request: Request) -> SessionResult<Reply> {
            self.session.handle(request, &mut self.core)
        }

        fn collection(&mut self, id: u64) -> BufferCollectionId {
            self.next_token += 1;
            let collection_id = BufferCollectionId(id);
            self.call(Request::ImportBufferCollection { collection_id, token: CollectionToken(self.next_token) })
                .unwrap();
            self.call(Request::SetBufferCollectionConstraints {
                collection_id,
                usage: BufferUsage { tiling: ImageTiling::Linear, min_buffer_count: 4 },
            })
            .unwrap();
            collection_id
        }

        fn image(&mut self, collection_id: BufferCollectionId, metadata: ImageMetadata) -> ImageId {
            match self.call(Request::ImportImage { collection_id, metadata, index: 0 }).unwrap() {
                Reply::Image(id) => id,
                other => panic!("unexpected reply {:?}", other),
            }
        }

        fn layer(&mut self) -> LayerId {
            match self.call(Request::CreateLayer).unwrap() {
                Reply::Layer(id) => id,
                other => panic!("unexpected reply {:?}", other),
            }
        }

        fn check(&mut self, discard: bool) -> CheckOutcome {
            match self.call(Request::CheckConfig { discard }).unwrap() {
                Reply::Check(outcome) => outcome,
                other => panic!("unexpected reply {:?}", other),
            }
        }
    }

    fn metadata() -> ImageMetadata {
        ImageMetadata::new(64, 64, PixelFormat::Argb8888)
    }

    #[test]
    fn import_before_allocation_should_wait() {
        let mut h = Harness::new(false);
        let collection_id = BufferCollectionId(1);
        h.call(Request::ImportBufferCollection { collection_id, token: CollectionToken(1) })
            .unwrap();
        assert_eq!(
            h.call(Request::ImportImage { collection_id, metadata: metadata(), index: 0 }),
            Err(SessionError::Status(Status::ShouldWait))
        );
        assert_eq!(
            h.call(Request::ImportImage { collection_id: BufferCollectionId(9), metadata: metadata(), index: 0 }),
            Err(SessionError::Status(Status::InvalidArgs))
        );
    }

    #[test]
    fn client_chosen_image_ids_must_be_unique() {
        let mut h = Harness::new(false);
        let collection_id = h.collection(1);
        let request = || Request::ImportImageWithId {
            collection_id,
            image_id: ImageId(42),
            metadata: metadata(),
            index: 0,
        };
        assert_eq!(h.call(request()), Ok(Reply::Image(ImageId(42))));
        assert_eq!(h.call(request()), Err(SessionError::Status(Status::AlreadyExists)));
        h.call(Request::ReleaseImage { image_id: ImageId(42) }).unwrap();
        assert_eq!(h.call(request()), Ok(Reply::Image(ImageId(42))));
    }

    #[test]
    fn reserved_ids_are_protocol_violations() {
        let mut h = Harness::new(false);
        let result = h.call(Request::ImportEvent { event: Event::new(), id: EventId::INVALID });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
        h.call(Request::ImportEvent { event: Event::new(), id: EventId(1) }).unwrap();

        let collection_id = h.collection(1);
        let result = h.call(Request::ImportImageWithId {
            collection_id,
            image_id: ImageId::INVALID,
            metadata: metadata(),
            index: 0,
        });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
        assert_eq!(h.engine.live_image_count(), 0);
    }

    #[test]
    fn released_stable_id_stays_reserved_until_retired() {
        let mut h = Harness::new(false);
        let collection_id = h.collection(1);
        let request = || Request::ImportImageWithId {
            collection_id,
            image_id: ImageId(42),
            metadata: metadata(),
            index: 0,
        };
        h.call(request()).unwrap();
        let layer_id = h.layer();
        h.call(Request::SetLayerPrimaryConfig { layer_id, metadata: metadata() }).unwrap();
        h.call(Request::SetLayerImage { layer_id, image_id: ImageId(42), wait_event: None }).unwrap();
        h.call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![layer_id] })
            .unwrap();
        h.call(Request::ApplyConfig).unwrap();
        h.core.on_display_vsync(DisplayId(1), ConfigStamp(1));
        h.core.on_display_vsync(DisplayId(2), ConfigStamp(1));

        let next = h.image(collection_id, metadata());
        h.call(Request::SetLayerImage { layer_id, image_id: next, wait_event: None }).unwrap();
        h.call(Request::ApplyConfig).unwrap();
        assert_eq!(h.core.controller_stamp(), ConfigStamp(2));

        // Still on display 1 until stamp 2 is confirmed.
        h.call(Request::ReleaseImage { image_id: ImageId(42) }).unwrap();
        assert!(h.core.is_stable_image_id_reserved(ImageId(42)));
        assert_eq!(h.call(request()), Err(SessionError::Status(Status::AlreadyExists)));

        let outcome = h.core.on_display_vsync(DisplayId(1), ConfigStamp(2)).unwrap();
        assert_eq!(outcome.retired, vec![(ClientId(1), ImageId(42))]);
        assert!(!h.core.is_stable_image_id_reserved(ImageId(42)));
        assert_eq!(h.call(request()), Ok(Reply::Image(ImageId(42))));
    }

    #[test]
    fn layer_in_use_cannot_be_destroyed() {
        let mut h = Harness::new(false);
        let layer_id = h.layer();
        h.call(Request::SetLayerColorConfig { layer_id, format: PixelFormat::Argb8888, bytes: vec![0, 0, 0, 0xff] })
            .unwrap();
        h.call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![layer_id] })
            .unwrap();
        let result = h.call(Request::DestroyLayer { layer_id });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));

        h.call(Request::ApplyConfig).unwrap();
        h.call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![] }).unwrap();
        let result = h.call(Request::DestroyLayer { layer_id });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));

        h.call(Request::ApplyConfig).unwrap();
        h.call(Request::DestroyLayer { layer_id }).unwrap();
        assert_eq!(h.core.live_layers(), 0);
    }

    #[test]
    fn layer_creation_stops_at_global_limit() {
        let mut h = Harness::new(false);
        let layers: Vec<_> = (0..16).map(|_| h.layer()).collect();
        assert_eq!(h.call(Request::CreateLayer), Err(SessionError::Status(Status::NoResources)));
        h.call(Request::DestroyLayer { layer_id: layers[0] }).unwrap();
        assert!(matches!(h.call(Request::CreateLayer), Ok(Reply::Layer(_))));
        assert_eq!(h.core.live_layers(), 16);
    }

    #[test]
    fn exhausted_allocator_reports_no_memory() {
        let mut h = Harness::new(false);
        let collection_id = BufferCollectionId(1);
        h.allocator.set_exhausted(true);
        assert_eq!(
            h.call(Request::ImportBufferCollection { collection_id, token: CollectionToken(1) }),
            Err(SessionError::Status(Status::NoMemory))
        );
        assert_eq!(
            h.call(Request::ImportImage { collection_id, metadata: metadata(), index: 0 }),
            Err(SessionError::Status(Status::InvalidArgs))
        );

        h.allocator.set_exhausted(false);
        h.call(Request::ImportBufferCollection { collection_id, token: CollectionToken(1) })
            .unwrap();
        assert_eq!(h.allocator.live_bindings(), 1);
    }

    #[test]
    fn failed_engine_import_releases_binding() {
        let mut h = Harness::new(false);
        let collection_id = BufferCollectionId(1);
        h.engine.import_buffer_collection(DriverCollectionId(7)).unwrap();
        assert_eq!(
            h.call(Request::ImportBufferCollection { collection_id, token: CollectionToken(7) }),
            Err(SessionError::Status(Status::AlreadyExists))
        );
        assert_eq!(h.allocator.live_bindings(), 0);

        h.engine.release_buffer_collection(DriverCollectionId(7)).unwrap();
        h.call(Request::ImportBufferCollection { collection_id, token: CollectionToken(7) })
            .unwrap();
        assert_eq!(h.allocator.live_bindings(), 1);
    }

    #[test]
    fn released_buffer_collection_is_forgotten() {
        let mut h = Harness::new(false);
        let collection_id = h.collection(1);
        assert_eq!(h.allocator.live_bindings(), 1);

        h.call(Request::ReleaseBufferCollection { collection_id }).unwrap();
        assert_eq!(h.allocator.live_bindings(), 0);
        assert_eq!(
            h.call(Request::ImportImage { collection_id, metadata: metadata(), index: 0 }),
            Err(SessionError::Status(Status::InvalidArgs))
        );
        // The engine no longer knows the driver collection either.
        assert!(h.engine.import_buffer_collection(DriverCollectionId(1)).is_ok());
        h.call(Request::ReleaseBufferCollection { collection_id: BufferCollectionId(9) }).unwrap();
    }

    #[test]
    fn cursor_position_reaches_engine() {
        let mut h = Harness::new(false);
        let collection_id = h.collection(1);
        let image_id = h.image(collection_id, metadata());
        let layer_id = h.layer();
        let result = h.call(Request::SetLayerCursorPosition { layer_id, x: 1, y: 1 });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));

        h.call(Request::SetLayerCursorConfig { layer_id, metadata: metadata() }).unwrap();
        h.call(Request::SetLayerCursorPosition { layer_id, x: -10, y: 5 }).unwrap();
        h.call(Request::SetLayerImage { layer_id, image_id, wait_event: None }).unwrap();
        h.call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![layer_id] })
            .unwrap();
        h.call(Request::ApplyConfig).unwrap();

        assert_eq!(h.engine.applied_configs().len(), 1);
        let applied = h.engine.last_applied().unwrap();
        assert_eq!(applied.stamp, h.core.controller_stamp());
        let display = applied
            .displays
            .iter()
            .find(|config| config.display_id == DisplayId(1))
            .unwrap();
        match &display.layers[0].content {
            LayerContent::Cursor { image, x, y, .. } => {
                assert!(image.is_some());
                assert_eq!((*x, *y), (-10, 5));
            }
            other => panic!("expected a cursor layer, got {:?}", other),
        }
    }

    #[test]
    fn display_power_and_minimum_rgb_reach_engine() {
        let mut h = Harness::new(false);
        assert_eq!(
            h.call(Request::SetDisplayPower { display_id: DisplayId(9), power_on: false }),
            Err(SessionError::Status(Status::NotFound))
        );
        h.call(Request::SetDisplayPower { display_id: DisplayId(1), power_on: false }).unwrap();
        assert_eq!(h.engine.display_power(DisplayId(1)), Some(false));
        assert_eq!(h.engine.display_power(DisplayId(2)), None);

        h.call(Request::SetMinimumRgb { minimum_rgb: 7 }).unwrap();
        assert_eq!(h.engine.minimum_rgb(), 7);
    }

    #[test]
    fn set_display_layers_is_exclusive() {
        let mut h = Harness::new(false);
        let layer = h.layer();
        h.call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![layer] })
            .unwrap();
        let result = h.call(Request::SetDisplayLayers { display_id: DisplayId(2), layer_ids: vec![layer] });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
    }

    #[test]
    fn mismatched_image_is_not_left_acquired() {
        let mut h = Harness::new(false);
        let collection_id = h.collection(1);
        let image_id = h.image(collection_id, ImageMetadata::new(32, 32, PixelFormat::Argb8888));
        let layer_id = h.layer();
        h.call(Request::SetLayerPrimaryConfig { layer_id, metadata: metadata() }).unwrap();

        let result = h.call(Request::SetLayerImage { layer_id, image_id, wait_event: None });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
        assert_eq!(h.session.image(image_id).unwrap().state(), ImageState::Imported);
    }

    #[test]
    fn discard_is_a_true_rollback() {
        let mut h = Harness::new(false);
        let collection_id = h.collection(1);
        let image_id = h.image(collection_id, metadata());
        let layer_id = h.layer();
        h.call(Request::SetLayerPrimaryConfig { layer_id, metadata: metadata() }).unwrap();
        h.call(Request::SetLayerImage { layer_id, image_id, wait_event: None }).unwrap();
        h.call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![layer_id] })
            .unwrap();
        h.call(Request::ApplyConfig).unwrap();
        let baseline = h.check(false);

        // Move the layer to the other display and break its geometry.
        h.call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![] }).unwrap();
        h.call(Request::SetDisplayLayers { display_id: DisplayId(2), layer_ids: vec![layer_id] })
            .unwrap();
        h.call(Request::SetLayerPrimaryPosition {
            layer_id,
            transform: Transform::Rot90,
            src_frame: Frame::new(0, 0, 64, 64),
            dest_frame: Frame::new(0, 0, 64, 64),
        })
        .unwrap();
        assert_ne!(h.check(false), baseline);

        h.check(true);
        assert_eq!(h.check(false), baseline);
        assert_eq!(h.session.layer(layer_id).unwrap().pending_display(), Some(DisplayId(1)));
        assert!(h.session.config(DisplayId(2)).unwrap().pending_layers.is_empty());
    }

    #[test]
    fn apply_rejects_invalid_config() {
        let mut h = Harness::new(false);
        let layer_id = h.layer();
        h.call(Request::SetDisplayLayers { display_id: DisplayId(1), layer_ids: vec![layer_id] })
            .unwrap();
        assert_eq!(h.call(Request::ApplyConfig), Err(SessionError::Status(Status::BadState)));
        assert_eq!(h.call(Request::GetLatestAppliedConfigStamp), Ok(Reply::Stamp(ConfigStamp::INVALID)));
        assert_eq!(h.core.controller_stamp(), ConfigStamp::INVALID);
    }

    #[test]
    fn display_mode_must_be_advertised() {
        let mut h = Harness::new(false);
        let mode = DisplayMode { width: 64, height: 64, refresh_rate_millihertz: 60_000 };
        h.call(Request::SetDisplayMode { display_id: DisplayId(1), mode }).unwrap();
        let bogus = DisplayMode { width: 1, height: 1, refresh_rate_millihertz: 1 };
        let result = h.call(Request::SetDisplayMode { display_id: DisplayId(1), mode: bogus });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
    }

    #[test]
    fn gamma_tables_are_shared_by_reference() {
        let mut h = Harness::new(false);
        let id = GammaTableId(3);
        let curve = vec![0.5; GAMMA_TABLE_SIZE];
        h.call(Request::ImportGammaTable { id, red: curve.clone(), green: curve.clone(), blue: curve.clone() })
            .unwrap();
        h.call(Request::SetDisplayGammaTable { display_id: DisplayId(1), id }).unwrap();
        h.call(Request::ReleaseGammaTable { id }).unwrap();
        assert!(h.session.config(DisplayId(1)).unwrap().pending.gamma_table.is_some());
        let result = h.call(Request::SetDisplayGammaTable { display_id: DisplayId(2), id });
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
    }

    #[test]
    fn capture_tracking_set_only_after_hardware_start() {
        let mut h = Harness::new(true);
        let collection_id = h.collection(1);
        let mut capture_metadata = metadata();
        capture_metadata.tiling = ImageTiling::Capture;
        let image_id = h.image(collection_id, capture_metadata);
        let event = Event::new();
        h.call(Request::ImportEvent { event: event.clone(), id: EventId(1) }).unwrap();

        h.engine.fail_next_capture();
        let result = h.call(Request::StartCapture { signal_event: EventId(1), image_id });
        assert!(matches!(result, Err(SessionError::Status(Status::Internal(_)))));
        assert!(!h.session.capture_active());
        assert!(!h.session.flags().capture_active());

        h.call(Request::StartCapture { signal_event: EventId(1), image_id }).unwrap();
        assert!(h.session.flags().capture_active());
        assert_eq!(h.engine.capture_starts().len(), 1);
        assert_eq!(
            h.call(Request::StartCapture { signal_event: EventId(1), image_id }),
            Err(SessionError::Status(Status::ShouldWait))
        );

        // Release while in flight is deferred until completion.
        h.call(Request::ReleaseCapture { image_id }).unwrap();
        assert!(h.engine.finish_capture().is_some());
        h.session.on_capture_complete(&mut h.core);
        assert!(event.is_signaled());
        assert_eq!(
            h.call(Request::ReleaseCapture { image_id }),
            Err(SessionError::Status(Status::InvalidArgs))
        );
    }

    #[test]
    fn capture_requires_ownership_and_support() {
        let mut h = Harness::new(false);
        assert_eq!(h.call(Request::IsCaptureSupported), Ok(Reply::CaptureSupported(false)));
        assert_eq!(
            h.call(Request::StartCapture { signal_event: EventId(1), image_id: ImageId(1) }),
            Err(SessionError::Status(Status::NotSupported))
        );

        let mut h = Harness::new(true);
        assert!(h.session.flags().is_owner());
        h.session.set_ownership(false, &mut h.core);
        assert!(!h.session.flags().is_owner());
        assert_eq!(
            h.call(Request::StartCapture { signal_event: EventId(1), image_id: ImageId(1) }),
            Err(SessionError::Status(Status::AccessDenied))
        );
        assert_eq!(
            h.call(Request::SetMinimumRgb { minimum_rgb: 4 }),
            Err(SessionError::Status(Status::AccessDenied))
        );
    }

    #[test]
    fn teardown_releases_everything() {
        let mut h = Harness::new(false);
        let collection_id = h.collection(1);
        let image_id = h.image(collection_id, metadata());
        let layer_id = h.layer();
        h.call(Request::SetLayerPrimaryConfig { layer_id, metadata: metadata() }).unwrap();
        h.call(Request::SetLayerImage { layer_id, image_id, wait_event: None }).unwrap();
        assert_eq!(h.core.live_layers(), 1);

        h.session.tear_down(&mut h.core);
        h.session.tear_down(&mut h.core);
        assert_eq!(h.core.live_layers(), 0);
        assert_eq!(h.engine.live_image_count(), 0);
        assert_eq!(h.allocator.live_bindings(), 0);
        while h.events.try_recv().is_ok() {}
    }

    #[test]
    fn teardown_hands_in_flight_capture_to_core() {
        let mut h = Harness::new(true);
        let collection_id = h.collection(1);
        let mut capture_metadata = metadata();
        capture_metadata.tiling = ImageTiling::Capture;
        let image_id = h.image(collection_id, capture_metadata);
        h.image(collection_id, capture_metadata);
        h.call(Request::ImportEvent { event: Event::new(), id: EventId(1) }).unwrap();
        h.call(Request::StartCapture { signal_event: EventId(1), image_id }).unwrap();
        assert_eq!(h.engine.live_capture_count(), 2);

        h.session.tear_down(&mut h.core);
        assert_eq!(h.engine.live_capture_count(), 1);
        assert_eq!(h.core.orphaned_capture_count(), 1);

        // Nothing is released while the engine still writes to the target.
        h.core.release_orphaned_captures();
        assert_eq!(h.core.orphaned_capture_count(), 1);

        assert!(h.engine.finish_capture().is_some());
        h.core.release_orphaned_captures();
        assert_eq!(h.core.orphaned_capture_count(), 0);
        assert_eq!(h.engine.live_capture_count(), 0);
    }
}
