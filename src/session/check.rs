//! Pending configuration validation
//!
//! Layer-local constraints are checked here first. Only a configuration that
//! passes them is handed to the engine's capability check, whose per-layer
//! error masks are turned into the composition ops the client must perform.

use crate::display::DisplayConfigSet;
use crate::engine::{ConfigCheckResult, DisplayConfigDescriptor, DisplayEngine, LayerContent, LayerDescriptor};
use crate::layer::Layer;
use crate::session::registry::ResourceTable;
use crate::types::{CompositionOpcode, DisplayId, Frame, LayerId};
use log::{debug, info};
use std::collections::BTreeMap;

/// Verdict reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigResult {
    Ok,
    /// Rejected before reaching the hardware
    InvalidConfig,
    /// Some layers need client composition, see the ops
    UnsupportedConfig,
    TooManyDisplays,
    UnsupportedDisplayModes,
}

/// One piece of composition work the client must do itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCompositionOp {
    pub display_id: DisplayId,
    pub layer_id: LayerId,
    pub opcode: CompositionOpcode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub result: ConfigResult,
    pub ops: Vec<ClientCompositionOp>,
}

impl CheckOutcome {
    fn with_result(result: ConfigResult) -> Self {
        Self { result, ops: Vec::new() }
    }

    pub fn is_ok(&self) -> bool {
        self.result == ConfigResult::Ok
    }
}

/// Validate the pending state of every display that has pending layers
pub fn check_pending_config(
    configs: &BTreeMap<DisplayId, DisplayConfigSet>,
    layers: &ResourceTable<LayerId, Layer>,
    engine: &dyn DisplayEngine,
) -> CheckOutcome {
    let mut descriptors = Vec::new();

    for config in configs.values() {
        if config.pending_layers.is_empty() {
            continue;
        }
        let mut layer_descriptors = Vec::with_capacity(config.pending_layers.len());
        for (z_index, layer_id) in config.pending_layers.iter().enumerate() {
            let descriptor = layers
                .get(*layer_id)
                .and_then(|layer| layer.pending_descriptor(z_index as u32));
            let Some(descriptor) = descriptor else {
                debug!("Layer {} on display {} has no configuration", layer_id, config.id);
                return CheckOutcome::with_result(ConfigResult::InvalidConfig);
            };
            if !layer_fits_display(&descriptor, config) {
                debug!("Layer {} does not fit display {}", layer_id, config.id);
                return CheckOutcome::with_result(ConfigResult::InvalidConfig);
            }
            layer_descriptors.push(descriptor);
        }
        descriptors.push(config.pending_descriptor(layer_descriptors));
    }

    if descriptors.is_empty() {
        return CheckOutcome::with_result(ConfigResult::Ok);
    }

    let check = engine.check_configuration(&descriptors);
    match check.result {
        ConfigCheckResult::Ok => {}
        ConfigCheckResult::TooManyDisplays => {
            info!("Engine rejected configuration: too many displays");
            return CheckOutcome::with_result(ConfigResult::TooManyDisplays);
        }
        ConfigCheckResult::UnsupportedModes => {
            info!("Engine rejected configuration: unsupported display modes");
            return CheckOutcome::with_result(ConfigResult::UnsupportedDisplayModes);
        }
    }

    let ops = composition_ops(&descriptors, &check.layer_errors);
    let result = if ops.is_empty() {
        ConfigResult::Ok
    } else {
        ConfigResult::UnsupportedConfig
    };
    CheckOutcome { result, ops }
}

/// Expand per-layer error masks into ops. Of several layers flagged as merge
/// base on one display, only the first stays the base; the rest become
/// merge sources.
fn composition_ops(descriptors: &[DisplayConfigDescriptor], errors: &[Vec<u32>]) -> Vec<ClientCompositionOp> {
    let mut ops = Vec::new();
    for (config, masks) in descriptors.iter().zip(errors) {
        let mut seen_base = false;
        for (layer, mask) in config.layers.iter().zip(masks) {
            let mut mask = mask & CompositionOpcode::ALL_BITS;
            if mask & CompositionOpcode::MergeBase.bit() != 0 {
                if seen_base {
                    mask &= !CompositionOpcode::MergeBase.bit();
                    mask |= CompositionOpcode::MergeSrc.bit();
                } else {
                    seen_base = true;
                }
            }
            ops.extend(
                CompositionOpcode::ALL
                    .iter()
                    .filter(|op| mask & op.bit() != 0)
                    .map(|&opcode| ClientCompositionOp {
                        display_id: config.display_id,
                        layer_id: layer.layer_id,
                        opcode,
                    }),
            );
        }
    }
    ops
}

fn layer_fits_display(layer: &LayerDescriptor, config: &DisplayConfigSet) -> bool {
    let mode = config.pending.mode;
    match &layer.content {
        LayerContent::Primary { metadata, src_frame, dest_frame, .. } => {
            config.info.pixel_formats.contains(&metadata.pixel_format)
                && is_non_empty(src_frame)
                && is_non_empty(dest_frame)
                && metadata.frame().contains(src_frame)
                && mode.frame().contains(dest_frame)
        }
        LayerContent::Cursor { metadata, x, y, .. } => {
            let (x, y) = (i64::from(*x), i64::from(*y));
            config.info.cursor_formats.contains(&metadata.pixel_format)
                && metadata.width > 0
                && metadata.height > 0
                && x > -i64::from(metadata.width)
                && y > -i64::from(metadata.height)
                && x < i64::from(mode.width)
                && y < i64::from(mode.height)
        }
        LayerContent::Color { format, bytes } => {
            config.info.pixel_formats.contains(format) && bytes.len() == format.bytes_per_pixel()
        }
    }
}

fn is_non_empty(frame: &Frame) -> bool {
    frame.width > 0 && frame.height > 0
}
