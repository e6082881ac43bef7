//! Imported images and their scanout lifecycle
//!
//! An [`Image`] lives behind an `Rc` inside the coordinator worker. The
//! session's image table holds one reference; layers hold more while the
//! image is pending, waiting or displayed; a display's presented list holds
//! one while the hardware may still scan it out. The engine-side buffer is
//! released when the last reference drops, which cannot happen while the
//! image is on a presented list.

use crate::engine::DisplayEngine;
use crate::types::{ClientId, ConfigStamp, DisplayId, DriverImageHandle, ImageId, ImageMetadata};
use log::trace;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

/// Coarse lifecycle state, derived from the image's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Imported and not referenced by any layer
    Imported,
    /// Held by a layer
    Acquired,
    /// On a display's presented list
    Presenting,
    /// Presenting, but superseded; released from its layer on the next retire
    Retiring,
}

pub struct Image {
    id: ImageId,
    client: ClientId,
    metadata: ImageMetadata,
    handle: DriverImageHandle,
    engine: Arc<dyn DisplayEngine>,
    in_use: Cell<bool>,
    presenting: Cell<bool>,
    retiring: Cell<bool>,
    latest_controller_stamp: Cell<ConfigStamp>,
    latest_client_stamp: Cell<ConfigStamp>,
    presented_on: Cell<Option<DisplayId>>,
}

impl Image {
    pub fn new(
        id: ImageId,
        client: ClientId,
        metadata: ImageMetadata,
        handle: DriverImageHandle,
        engine: Arc<dyn DisplayEngine>,
    ) -> Self {
        Self {
            id,
            client,
            metadata,
            handle,
            engine,
            in_use: Cell::new(false),
            presenting: Cell::new(false),
            retiring: Cell::new(false),
            latest_controller_stamp: Cell::new(ConfigStamp::INVALID),
            latest_client_stamp: Cell::new(ConfigStamp::INVALID),
            presented_on: Cell::new(None),
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn handle(&self) -> DriverImageHandle {
        self.handle
    }

    pub fn state(&self) -> ImageState {
        if self.presenting.get() {
            if self.retiring.get() {
                ImageState::Retiring
            } else {
                ImageState::Presenting
            }
        } else if self.in_use.get() {
            ImageState::Acquired
        } else {
            ImageState::Imported
        }
    }

    /// Claim the image for a layer. Fails if another layer holds it.
    pub fn acquire(&self) -> bool {
        if self.in_use.get() {
            return false;
        }
        self.in_use.set(true);
        true
    }

    /// Undo an [`acquire`](Self::acquire) that never reached the display
    pub fn discard_acquire(&self) {
        debug_assert!(!self.presenting.get());
        self.in_use.set(false);
    }

    /// Drop an image that became ready but was superseded before display
    pub fn early_retire(&self) {
        self.in_use.set(false);
    }

    /// The image is about to be scanned out by the config tagged `stamp`
    pub fn start_present(&self, stamp: ConfigStamp) {
        self.presenting.set(true);
        self.latest_controller_stamp.set(stamp);
    }

    /// The layer no longer displays this image. Frees it right away unless
    /// the hardware may still be reading it.
    pub fn start_retire(&self) {
        if self.presenting.get() {
            self.retiring.set(true);
        } else {
            self.in_use.set(false);
        }
    }

    /// A vsync confirmed the hardware moved past this image
    pub fn on_retire(&self) {
        self.presenting.set(false);
        self.presented_on.set(None);
        if self.retiring.get() {
            self.in_use.set(false);
            self.retiring.set(false);
        }
    }

    pub fn latest_controller_stamp(&self) -> ConfigStamp {
        self.latest_controller_stamp.get()
    }

    pub fn latest_client_stamp(&self) -> ConfigStamp {
        self.latest_client_stamp.get()
    }

    pub fn set_latest_client_stamp(&self, stamp: ConfigStamp) {
        self.latest_client_stamp.set(stamp);
    }

    /// Display whose presented list holds this image
    pub fn presented_on(&self) -> Option<DisplayId> {
        self.presented_on.get()
    }

    pub fn set_presented_on(&self, display: Option<DisplayId>) {
        self.presented_on.set(display);
    }

    /// Whether this image can stand in for one described by `metadata`
    pub fn has_same_config(&self, metadata: &ImageMetadata) -> bool {
        self.metadata.width == metadata.width
            && self.metadata.height == metadata.height
            && self.metadata.pixel_format == metadata.pixel_format
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        trace!("Releasing image {} ({}) of client {}", self.id, self.handle, self.client);
        self.engine.release_image(self.handle);
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("handle", &self.handle)
            .field("state", &self.state())
            .field("latest_controller_stamp", &self.latest_controller_stamp.get())
            .finish()
    }
}
