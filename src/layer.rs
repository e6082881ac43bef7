//! Compositing layers
//!
//! Every layer keeps two snapshots of its configuration. Client edits land in
//! `pending`; an apply copies them into `current`, which is what the hardware
//! is handed. Images follow the same path with one extra stage: an image set
//! on the layer waits in a queue until its fence fires, and only the newest
//! ready image becomes the displayed one.

use crate::engine::{LayerContent, LayerDescriptor};
use crate::fence::{FenceKey, FenceRegistry, FenceWait};
use crate::image::Image;
use crate::types::{
    AlphaMode, ConfigStamp, DisplayId, DriverImageHandle, EventId, Frame, ImageMetadata, LayerId,
    PixelFormat, Transform,
};
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryConfig {
    pub image: ImageMetadata,
    pub src_frame: Frame,
    pub dest_frame: Frame,
    pub transform: Transform,
    pub alpha_mode: AlphaMode,
    pub alpha: f32,
}

impl PrimaryConfig {
    fn new(image: ImageMetadata) -> Self {
        Self {
            image,
            src_frame: image.frame(),
            dest_frame: image.frame(),
            transform: Transform::Identity,
            alpha_mode: AlphaMode::Disable,
            alpha: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorConfig {
    pub image: ImageMetadata,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorConfig {
    pub format: PixelFormat,
    pub bytes: Vec<u8>,
}

/// The three kinds of layer content
#[derive(Debug, Clone, PartialEq)]
pub enum LayerConfig {
    Primary(PrimaryConfig),
    Cursor(CursorConfig),
    Color(ColorConfig),
}

impl LayerConfig {
    /// Geometry an image must have to be shown by this config
    pub fn image_config(&self) -> Option<&ImageMetadata> {
        match self {
            LayerConfig::Primary(cfg) => Some(&cfg.image),
            LayerConfig::Cursor(cfg) => Some(&cfg.image),
            LayerConfig::Color(_) => None,
        }
    }

    fn content(&self, image: Option<DriverImageHandle>) -> LayerContent {
        match self {
            LayerConfig::Primary(cfg) => LayerContent::Primary {
                image,
                metadata: cfg.image,
                src_frame: cfg.src_frame,
                dest_frame: cfg.dest_frame,
                transform: cfg.transform,
                alpha_mode: cfg.alpha_mode,
                alpha: cfg.alpha,
            },
            LayerConfig::Cursor(cfg) => LayerContent::Cursor {
                image,
                metadata: cfg.image,
                x: cfg.x,
                y: cfg.y,
            },
            LayerConfig::Color(cfg) => LayerContent::Color {
                format: cfg.format,
                bytes: cfg.bytes.clone(),
            },
        }
    }
}

#[derive(Debug)]
struct WaitingImage {
    image: Rc<Image>,
    /// `None` once the image is ready to display
    wait: Option<FenceKey>,
}

#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    pending: Option<LayerConfig>,
    current: Option<LayerConfig>,
    config_change: bool,
    pending_image: Option<Rc<Image>>,
    pending_wait: Option<EventId>,
    waiting: VecDeque<WaitingImage>,
    displayed: Option<Rc<Image>>,
    /// Display whose pending layer list holds this layer
    pending_display: Option<DisplayId>,
}

impl Layer {
    pub fn new(id: LayerId) -> Self {
        Self {
            id,
            pending: None,
            current: None,
            config_change: false,
            pending_image: None,
            pending_wait: None,
            waiting: VecDeque::new(),
            displayed: None,
            pending_display: None,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn pending_config(&self) -> Option<&LayerConfig> {
        self.pending.as_ref()
    }

    pub fn current_config(&self) -> Option<&LayerConfig> {
        self.current.as_ref()
    }

    pub fn pending_display(&self) -> Option<DisplayId> {
        self.pending_display
    }

    pub fn displayed_image(&self) -> Option<&Rc<Image>> {
        self.displayed.as_ref()
    }

    pub fn is_color(&self) -> bool {
        matches!(self.current, Some(LayerConfig::Color(_)))
    }

    /// Link the layer into `display`'s pending list. Fails while the layer is
    /// linked into any pending list.
    pub fn add_to_config(&mut self, display: DisplayId) -> bool {
        if self.pending_display.is_some() {
            return false;
        }
        self.pending_display = Some(display);
        true
    }

    pub fn remove_from_config(&mut self) {
        self.pending_display = None;
    }

    pub fn set_primary_config(&mut self, image: ImageMetadata) {
        self.pending = Some(LayerConfig::Primary(PrimaryConfig::new(image)));
        self.drop_mismatched_pending_image();
        self.config_change = true;
    }

    /// Returns false if the pending config is not a primary layer
    pub fn set_primary_position(&mut self, transform: Transform, src_frame: Frame, dest_frame: Frame) -> bool {
        let Some(LayerConfig::Primary(cfg)) = &mut self.pending else {
            return false;
        };
        cfg.transform = transform;
        cfg.src_frame = src_frame;
        cfg.dest_frame = dest_frame;
        self.config_change = true;
        true
    }

    /// Returns false if the pending config is not a primary layer
    pub fn set_primary_alpha(&mut self, mode: AlphaMode, alpha: f32) -> bool {
        let Some(LayerConfig::Primary(cfg)) = &mut self.pending else {
            return false;
        };
        cfg.alpha_mode = mode;
        cfg.alpha = alpha;
        self.config_change = true;
        true
    }

    pub fn set_cursor_config(&mut self, image: ImageMetadata) {
        self.pending = Some(LayerConfig::Cursor(CursorConfig { image, x: 0, y: 0 }));
        self.drop_mismatched_pending_image();
        self.config_change = true;
    }

    /// Returns false if the pending config is not a cursor layer
    pub fn set_cursor_position(&mut self, x: i32, y: i32) -> bool {
        let Some(LayerConfig::Cursor(cfg)) = &mut self.pending else {
            return false;
        };
        cfg.x = x;
        cfg.y = y;
        self.config_change = true;
        true
    }

    pub fn set_color_config(&mut self, format: PixelFormat, bytes: Vec<u8>) {
        self.pending = Some(LayerConfig::Color(ColorConfig { format, bytes }));
        self.drop_mismatched_pending_image();
        self.config_change = true;
    }

    /// Replace the pending image. The caller has already acquired `image`.
    pub fn set_image(&mut self, image: Rc<Image>, wait: Option<EventId>) {
        if let Some(previous) = self.pending_image.replace(image) {
            previous.discard_acquire();
        }
        self.pending_wait = wait;
    }

    fn drop_mismatched_pending_image(&mut self) {
        let keep = match (&self.pending_image, self.pending.as_ref().and_then(LayerConfig::image_config)) {
            (Some(image), Some(config)) => image.has_same_config(config),
            _ => false,
        };
        if !keep {
            if let Some(image) = self.pending_image.take() {
                image.discard_acquire();
            }
            self.pending_wait = None;
        }
    }

    /// Copy pending property edits into the current snapshot
    pub fn resolve_pending_layer_properties(&mut self) {
        if self.config_change {
            self.current = self.pending.clone();
            self.config_change = false;
        }
    }

    /// Move the pending image into the waiting queue, arming its fence.
    /// `client_stamp` is the stamp of the apply that introduced it.
    pub fn resolve_pending_image(&mut self, fences: &mut FenceRegistry, client_stamp: ConfigStamp) {
        let Some(image) = self.pending_image.take() else {
            return;
        };
        image.set_latest_client_stamp(client_stamp);
        let wait = match self.pending_wait.take() {
            Some(event) => match fences.arm_wait(event) {
                FenceWait::Ready => None,
                FenceWait::Pending(key) => Some(key),
            },
            None => None,
        };
        self.waiting.push_back(WaitingImage { image, wait });
    }

    /// Promote the newest ready waiting image to displayed. Older waiting
    /// images are dropped and the previously displayed one starts retiring.
    /// Returns whether the displayed image changed.
    pub fn activate_latest_ready_image(&mut self, fences: &mut FenceRegistry) -> bool {
        let Some(ready) = self.waiting.iter().rposition(|w| w.wait.is_none()) else {
            return false;
        };
        for superseded in self.waiting.drain(..ready) {
            if let Some(key) = superseded.wait {
                fences.disarm(key);
            }
            superseded.image.early_retire();
        }
        let Some(next) = self.waiting.pop_front() else {
            return false;
        };
        if let Some(previous) = self.displayed.replace(next.image) {
            previous.start_retire();
        }
        true
    }

    /// Mark the waiting image armed on `key` ready. Returns false if no
    /// image here waited on it.
    pub fn on_fence_fired(&mut self, key: FenceKey) -> bool {
        match self.waiting.iter_mut().find(|w| w.wait == Some(key)) {
            Some(waiting) => {
                waiting.wait = None;
                true
            }
            None => false,
        }
    }

    /// Client stamp of the displayed image
    pub fn current_client_stamp(&self) -> Option<ConfigStamp> {
        self.displayed.as_ref().map(|image| image.latest_client_stamp())
    }

    /// Drop every reference to `target`, or to all images when `None`.
    /// Returns whether the displayed image went away.
    pub fn clean_up_image(&mut self, target: Option<&Rc<Image>>, fences: &mut FenceRegistry) -> bool {
        let matches = |image: &Rc<Image>| target.map_or(true, |t| Rc::ptr_eq(t, image));

        if self.pending_image.as_ref().is_some_and(matches) {
            if let Some(image) = self.pending_image.take() {
                image.discard_acquire();
            }
            self.pending_wait = None;
        }

        let mut kept = VecDeque::with_capacity(self.waiting.len());
        for waiting in self.waiting.drain(..) {
            if matches(&waiting.image) {
                if let Some(key) = waiting.wait {
                    fences.disarm(key);
                }
                waiting.image.early_retire();
            } else {
                kept.push_back(waiting);
            }
        }
        self.waiting = kept;

        match self.displayed.take() {
            Some(image) if matches(&image) => {
                image.start_retire();
                true
            }
            other => {
                self.displayed = other;
                false
            }
        }
    }

    /// Roll pending property and image edits back to the current state
    pub fn discard_changes(&mut self) {
        self.pending = self.current.clone();
        self.config_change = false;
        if let Some(image) = self.pending_image.take() {
            image.discard_acquire();
        }
        self.pending_wait = None;
    }

    /// Hardware view of the current config at `z_index`
    pub fn current_descriptor(&self, z_index: u32) -> Option<LayerDescriptor> {
        let config = self.current.as_ref()?;
        Some(LayerDescriptor {
            layer_id: self.id,
            z_index,
            content: config.content(self.displayed.as_ref().map(|image| image.handle())),
        })
    }

    /// Hardware view of the pending config at `z_index`, used for checks
    pub fn pending_descriptor(&self, z_index: u32) -> Option<LayerDescriptor> {
        let config = self.pending.as_ref()?;
        let image = self.pending_image.as_ref().or(self.displayed.as_ref());
        Some(LayerDescriptor {
            layer_id: self.id,
            z_index,
            content: config.content(image.map(|image| image.handle())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HeadlessEngine;
    use crate::fence::{Event, FenceNotifier};
    use crate::image::ImageState;
    use crate::test_util;
    use crate::types::ClientId;
    use std::sync::Arc;

    fn fences() -> FenceRegistry {
        let notifier: FenceNotifier = Arc::new(|_, _| {});
        FenceRegistry::new(ClientId(1), notifier)
    }

    fn primary_layer() -> Layer {
        let mut layer = Layer::new(LayerId(1));
        layer.set_primary_config(ImageMetadata::new(64, 64, PixelFormat::Argb8888));
        layer.resolve_pending_layer_properties();
        layer
    }

    #[test]
    fn add_to_config_is_exclusive() {
        let mut layer = Layer::new(LayerId(1));
        assert!(layer.add_to_config(DisplayId(1)));
        assert!(!layer.add_to_config(DisplayId(2)));
        assert!(!layer.add_to_config(DisplayId(1)));
        layer.remove_from_config();
        assert!(layer.add_to_config(DisplayId(2)));
    }

    #[test]
    fn position_setters_check_layer_type() {
        let mut layer = primary_layer();
        assert!(layer.set_primary_alpha(AlphaMode::Premultiplied, 0.5));
        assert!(!layer.set_cursor_position(3, 4));
        layer.set_color_config(PixelFormat::Argb8888, vec![0, 0, 0, 255]);
        assert!(!layer.set_primary_position(Transform::Identity, Frame::default(), Frame::default()));
    }

    #[test]
    fn ready_image_becomes_displayed() {
        let engine = Arc::new(HeadlessEngine::new(false));
        let mut fences = fences();
        let mut layer = primary_layer();
        let image = test_util::image(&engine, 1);
        assert!(image.acquire());
        layer.set_image(image.clone(), None);
        layer.resolve_pending_image(&mut fences, ConfigStamp(3));

        assert!(layer.activate_latest_ready_image(&mut fences));
        assert!(Rc::ptr_eq(layer.displayed_image().unwrap(), &image));
        assert_eq!(layer.current_client_stamp(), Some(ConfigStamp(3)));
        assert!(!layer.activate_latest_ready_image(&mut fences));
    }

    #[test]
    fn fenced_image_waits_for_signal() {
        let engine = Arc::new(HeadlessEngine::new(false));
        let mut fences = fences();
        let event = Event::new();
        fences.import_event(event, EventId(9)).unwrap();
        let mut layer = primary_layer();
        let image = test_util::image(&engine, 1);
        assert!(image.acquire());
        layer.set_image(image, Some(EventId(9)));
        layer.resolve_pending_image(&mut fences, ConfigStamp(1));

        assert!(!layer.activate_latest_ready_image(&mut fences));
        assert!(layer.on_fence_fired(FenceKey(1)));
        assert!(layer.activate_latest_ready_image(&mut fences));
    }

    #[test]
    fn newer_ready_image_supersedes_older_ones() {
        let engine = Arc::new(HeadlessEngine::new(false));
        let mut fences = fences();
        let mut layer = primary_layer();
        let first = test_util::image(&engine, 1);
        let second = test_util::image(&engine, 2);
        for (image, stamp) in [(&first, 1), (&second, 2)] {
            assert!(image.acquire());
            layer.set_image(image.clone(), None);
            layer.resolve_pending_image(&mut fences, ConfigStamp(stamp));
        }

        assert!(layer.activate_latest_ready_image(&mut fences));
        assert!(Rc::ptr_eq(layer.displayed_image().unwrap(), &second));
        assert_eq!(first.state(), ImageState::Imported);
    }

    #[test]
    fn clean_up_retires_displayed_image() {
        let engine = Arc::new(HeadlessEngine::new(false));
        let mut fences = fences();
        let mut layer = primary_layer();
        let image = test_util::image(&engine, 1);
        assert!(image.acquire());
        layer.set_image(image.clone(), None);
        layer.resolve_pending_image(&mut fences, ConfigStamp(1));
        layer.activate_latest_ready_image(&mut fences);
        image.start_present(ConfigStamp(1));

        let other = test_util::image(&engine, 2);
        assert!(!layer.clean_up_image(Some(&other), &mut fences));
        assert!(layer.clean_up_image(Some(&image), &mut fences));
        assert!(layer.displayed_image().is_none());
        assert_eq!(image.state(), ImageState::Retiring);
    }

    #[test]
    fn discard_restores_current_config() {
        let engine = Arc::new(HeadlessEngine::new(false));
        let mut layer = primary_layer();
        let image = test_util::image(&engine, 1);
        assert!(image.acquire());
        layer.set_image(image.clone(), None);
        layer.set_cursor_config(ImageMetadata::new(16, 16, PixelFormat::Argb8888));
        assert_eq!(image.state(), ImageState::Imported);

        layer.discard_changes();
        assert_eq!(layer.pending_config(), layer.current_config());
        assert!(matches!(layer.pending_config(), Some(LayerConfig::Primary(_))));
    }
}
