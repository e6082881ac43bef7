//! Physical displays and per-session display configuration
//!
//! [`DisplayInfo`] is what a client learns about a panel at hotplug.
//! [`DisplayConfigSet`] is one session's double-buffered configuration of
//! that panel. The coordinator's own per-display scanout bookkeeping lives in
//! [`crate::coordinator::core`].

use crate::engine::{DisplayConfigDescriptor, LayerDescriptor};
use crate::types::{ColorConversion, DisplayId, DisplayMode, GammaTable, LayerId, PixelFormat};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Static description of a connected display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub id: DisplayId,
    pub modes: Vec<DisplayMode>,
    pub pixel_formats: Vec<PixelFormat>,
    pub cursor_formats: Vec<PixelFormat>,
}

impl DisplayInfo {
    /// Mode a fresh configuration starts with
    pub fn preferred_mode(&self) -> DisplayMode {
        self.modes.first().copied().unwrap_or(DisplayMode {
            width: 0,
            height: 0,
            refresh_rate_millihertz: 0,
        })
    }
}

/// Display-level half of a configuration snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfigState {
    pub mode: DisplayMode,
    pub color_conversion: ColorConversion,
    pub gamma_table: Option<Arc<GammaTable>>,
    pub layer_count: usize,
}

/// One session's pending and current configuration of one display
#[derive(Debug, Clone)]
pub struct DisplayConfigSet {
    pub id: DisplayId,
    pub info: DisplayInfo,
    pub pending: DisplayConfigState,
    pub current: DisplayConfigState,
    /// Layers in z order, bottom first
    pub pending_layers: Vec<LayerId>,
    pub current_layers: Vec<LayerId>,
    /// The pending layer list differs from the current one
    pub pending_layer_change: bool,
    /// The current layer list changed and the coordinator has not taken it yet
    pub pending_apply_layer_change: bool,
    /// Mode, color conversion or gamma table differ from current
    pub display_config_change: bool,
}

impl DisplayConfigSet {
    pub fn new(info: DisplayInfo) -> Self {
        let state = DisplayConfigState {
            mode: info.preferred_mode(),
            color_conversion: ColorConversion::default(),
            gamma_table: None,
            layer_count: 0,
        };
        Self {
            id: info.id,
            info,
            pending: state.clone(),
            current: state,
            pending_layers: Vec::new(),
            current_layers: Vec::new(),
            pending_layer_change: false,
            pending_apply_layer_change: false,
            display_config_change: false,
        }
    }

    pub fn has_mode(&self, mode: &DisplayMode) -> bool {
        self.info.modes.contains(mode)
    }

    /// Replace the pending layer list
    pub fn set_pending_layers(&mut self, layers: Vec<LayerId>) {
        self.pending.layer_count = layers.len();
        self.pending_layers = layers;
        self.pending_layer_change = true;
    }

    /// Copy display-level pending state into current
    pub fn commit_display_config(&mut self) {
        if self.display_config_change {
            self.current.mode = self.pending.mode;
            self.current.color_conversion = self.pending.color_conversion;
            self.current.gamma_table = self.pending.gamma_table.clone();
            self.display_config_change = false;
        }
    }

    /// Swap in the pending layer list. Returns whether it changed.
    pub fn commit_layers(&mut self) -> bool {
        if !self.pending_layer_change {
            return false;
        }
        self.current_layers = self.pending_layers.clone();
        self.current.layer_count = self.current_layers.len();
        self.pending_layer_change = false;
        self.pending_apply_layer_change = true;
        true
    }

    /// Throw away every pending edit
    pub fn discard(&mut self) {
        self.pending = self.current.clone();
        self.pending_layers = self.current_layers.clone();
        self.pending_layer_change = false;
        self.display_config_change = false;
    }

    /// Hardware description built from the pending display state
    pub fn pending_descriptor(&self, layers: Vec<LayerDescriptor>) -> DisplayConfigDescriptor {
        DisplayConfigDescriptor {
            display_id: self.id,
            mode: self.pending.mode,
            color_conversion: self.pending.color_conversion,
            gamma_table: self.pending.gamma_table.clone(),
            layers,
        }
    }

    /// Hardware description built from the current display state
    pub fn current_descriptor(&self, layers: Vec<LayerDescriptor>) -> DisplayConfigDescriptor {
        DisplayConfigDescriptor {
            display_id: self.id,
            mode: self.current.mode,
            color_conversion: self.current.color_conversion,
            gamma_table: self.current.gamma_table.clone(),
            layers,
        }
    }
}
