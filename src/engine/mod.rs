//! Hardware abstraction boundary
//!
//! The coordinator never touches display hardware directly. Everything it
//! needs from the engine driver and from the buffer allocation service goes
//! through the two traits in this module:
//! - [`DisplayEngine`] validates and applies configurations, imports images
//!   and drives capture
//! - [`BufferAllocator`] turns a client's collection token into handles the
//!   engine understands
//!
//! Calls are synchronous and must have no side effects when they fail.

pub mod headless;

pub use headless::{HeadlessAllocator, HeadlessEngine, VsyncTicker};

use crate::status::Status;
use crate::types::{
    AlphaMode, ColorConversion, ConfigStamp, DisplayId, DisplayMode, DriverCaptureHandle, DriverCollectionId,
    DriverImageHandle, Frame, GammaTable, ImageMetadata, ImageTiling, LayerId, PixelFormat,
    Transform,
};
use std::sync::Arc;

/// What a layer contributes to a display, as the hardware sees it
#[derive(Debug, Clone, PartialEq)]
pub enum LayerContent {
    Primary {
        image: Option<DriverImageHandle>,
        metadata: ImageMetadata,
        src_frame: Frame,
        dest_frame: Frame,
        transform: Transform,
        alpha_mode: AlphaMode,
        alpha: f32,
    },
    Cursor {
        image: Option<DriverImageHandle>,
        metadata: ImageMetadata,
        x: i32,
        y: i32,
    },
    Color {
        format: PixelFormat,
        bytes: Vec<u8>,
    },
}

/// Hardware-facing description of one layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescriptor {
    pub layer_id: LayerId,
    pub z_index: u32,
    pub content: LayerContent,
}

/// Hardware-facing description of one display's configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfigDescriptor {
    pub display_id: DisplayId,
    pub mode: DisplayMode,
    pub color_conversion: ColorConversion,
    pub gamma_table: Option<Arc<GammaTable>>,
    pub layers: Vec<LayerDescriptor>,
}

/// Display-level verdict of a capability check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigCheckResult {
    #[default]
    Ok,
    TooManyDisplays,
    UnsupportedModes,
}

/// Result of [`DisplayEngine::check_configuration`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigCheck {
    pub result: ConfigCheckResult,
    /// Per display (in request order), per layer (in z order) error bitmask
    /// of [`CompositionOpcode`](crate::types::CompositionOpcode) bits
    pub layer_errors: Vec<Vec<u32>>,
}

impl ConfigCheck {
    /// A check that accepts every layer of `configs`
    pub fn accept_all(configs: &[DisplayConfigDescriptor]) -> Self {
        Self {
            result: ConfigCheckResult::Ok,
            layer_errors: configs.iter().map(|c| vec![0; c.layers.len()]).collect(),
        }
    }
}

/// Opaque token a client obtained from the allocation service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionToken(pub u64);

/// Handle pair produced by binding a token with the allocation service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionHandles {
    /// Coordinator-side participant handle
    pub local: u64,
    /// Identifier the engine uses for the same collection
    pub driver: DriverCollectionId,
}

/// Buffer constraints a client requests for a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferUsage {
    pub tiling: ImageTiling,
    pub min_buffer_count: u32,
}

/// Display engine driver contract
pub trait DisplayEngine: Send + Sync {
    fn import_buffer_collection(&self, collection: DriverCollectionId) -> Result<(), Status>;

    fn release_buffer_collection(&self, collection: DriverCollectionId) -> Result<(), Status>;

    fn set_buffer_collection_constraints(
        &self,
        usage: &BufferUsage,
        collection: DriverCollectionId,
    ) -> Result<(), Status>;

    /// Import buffer `index` of `collection` for scanout.
    ///
    /// Returns [`Status::ShouldWait`] while the collection's buffers are not
    /// allocated yet.
    fn import_image(
        &self,
        metadata: &ImageMetadata,
        collection: DriverCollectionId,
        index: u32,
    ) -> Result<DriverImageHandle, Status>;

    fn import_image_for_capture(
        &self,
        collection: DriverCollectionId,
        index: u32,
    ) -> Result<DriverCaptureHandle, Status>;

    fn release_image(&self, image: DriverImageHandle);

    fn release_capture_image(&self, image: DriverCaptureHandle) -> Result<(), Status>;

    fn check_configuration(&self, configs: &[DisplayConfigDescriptor]) -> ConfigCheck;

    /// Apply `configs` atomically and tag the result with `stamp`. Displays
    /// absent from `configs` show nothing. On error the hardware keeps
    /// scanning out the previous configuration.
    fn apply_configuration(&self, configs: &[DisplayConfigDescriptor], stamp: ConfigStamp) -> Result<(), Status>;

    fn set_display_power(&self, display: DisplayId, power_on: bool) -> Result<(), Status>;

    fn set_minimum_rgb(&self, minimum_rgb: u8) -> Result<(), Status>;

    fn is_capture_supported(&self) -> bool;

    fn start_capture(&self, image: DriverCaptureHandle) -> Result<(), Status>;
}

/// Allocation service contract
pub trait BufferAllocator: Send + Sync {
    fn bind_shared_collection(&self, token: CollectionToken) -> Result<CollectionHandles, Status>;

    /// Drop a binding made by [`bind_shared_collection`](Self::bind_shared_collection)
    fn release_shared_collection(&self, handles: CollectionHandles);
}
