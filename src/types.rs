//! Identifiers, config stamps and geometry shared across the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw value as carried on the wire
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }
    };
}

id_type!(
    /// Physical display identifier assigned by the engine at hotplug
    DisplayId
);
id_type!(
    /// Client-visible image identifier
    ImageId
);
id_type!(
    /// Client-visible layer identifier
    LayerId
);
id_type!(
    /// Client-chosen identifier for an imported event
    EventId
);
id_type!(
    /// Client-chosen identifier for a shared buffer collection
    BufferCollectionId
);
id_type!(
    /// Client-chosen identifier for a gamma table
    GammaTableId
);
id_type!(
    /// Session identifier, unique among live sessions
    ClientId
);
id_type!(
    /// Engine-side handle of an imported image
    DriverImageHandle
);
id_type!(
    /// Engine-side handle of an imported capture target
    DriverCaptureHandle
);
id_type!(
    /// Engine-side identifier of a buffer collection
    DriverCollectionId
);

impl ImageId {
    /// Never names an image
    pub const INVALID: ImageId = ImageId(0);
}

impl EventId {
    /// Means "no event" wherever an event is optional
    pub const INVALID: EventId = EventId(0);
}

/// Monotonic stamp correlating an applied configuration with the vsync that
/// confirms it.
///
/// The coordinator owns one stamp space ("controller stamps") and every
/// session owns another ("client stamps"). Zero is never produced by an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ConfigStamp(pub u64);

impl ConfigStamp {
    pub const INVALID: ConfigStamp = ConfigStamp(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// The stamp that follows this one
    #[must_use]
    pub fn next(self) -> Self {
        ConfigStamp(self.0 + 1)
    }
}

impl fmt::Display for ConfigStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cookie attached to a vsync event when the client must acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VsyncAckCookie(pub u64);

impl VsyncAckCookie {
    pub const INVALID: VsyncAckCookie = VsyncAckCookie(0);
}

/// Which kind of client a session serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// Regular compositor client
    Primary,
    /// Virtual console
    Virtcon,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Primary => write!(f, "primary"),
            ClientKind::Virtcon => write!(f, "virtcon"),
        }
    }
}

/// Virtual console ownership policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VirtconMode {
    /// The virtcon never owns the displays
    #[default]
    Inactive,
    /// The virtcon owns the displays while no primary client is connected
    Fallback,
    /// The virtcon always owns the displays
    Forced,
}

impl VirtconMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inactive" => Some(VirtconMode::Inactive),
            "fallback" => Some(VirtconMode::Fallback),
            "forced" => Some(VirtconMode::Forced),
            _ => None,
        }
    }
}

/// Pixel formats understood by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            _ => 4,
        }
    }
}

/// How an image's memory is laid out and used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageTiling {
    #[default]
    Linear,
    /// Target for display capture rather than scanout
    Capture,
}

/// Presentation geometry of an imported image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub tiling: ImageTiling,
}

impl ImageMetadata {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
            tiling: ImageTiling::Linear,
        }
    }

    /// Full-image frame
    pub fn frame(&self) -> Frame {
        Frame::new(0, 0, self.width, self.height)
    }
}

/// Axis-aligned rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Frame {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Whether `inner` lies entirely within `self`
    pub fn contains(&self, inner: &Frame) -> bool {
        let right = u64::from(inner.x) + u64::from(inner.width);
        let bottom = u64::from(inner.y) + u64::from(inner.height);
        inner.x >= self.x
            && inner.y >= self.y
            && right <= u64::from(self.x) + u64::from(self.width)
            && bottom <= u64::from(self.y) + u64::from(self.height)
    }
}

/// Layer orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transform {
    #[default]
    Identity,
    ReflectX,
    ReflectY,
    Rot90,
    Rot180,
    Rot270,
    Rot90ReflectX,
    Rot90ReflectY,
}

/// Layer blending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AlphaMode {
    #[default]
    Disable,
    Premultiplied,
    HwMultiply,
}

/// Display timing reduced to what the coordinator validates against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate_millihertz: u32,
}

impl DisplayMode {
    pub fn frame(&self) -> Frame {
        Frame::new(0, 0, self.width, self.height)
    }
}

/// 3x3 color conversion with pre and post offsets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorConversion {
    pub preoffsets: [f32; 3],
    pub coefficients: [f32; 9],
    pub postoffsets: [f32; 3],
}

impl Default for ColorConversion {
    fn default() -> Self {
        Self {
            preoffsets: [0.0; 3],
            coefficients: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            postoffsets: [0.0; 3],
        }
    }
}

/// Per-channel gamma lookup table. The coordinator treats it as opaque data.
#[derive(Debug, Clone, PartialEq)]
pub struct GammaTable {
    pub id: GammaTableId,
    pub red: Vec<f32>,
    pub green: Vec<f32>,
    pub blue: Vec<f32>,
}

/// Composition work a client must do itself because the hardware refused a layer.
///
/// The discriminant is the bit index used in the engine's per-layer error mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositionOpcode {
    UsePrimary = 0,
    MergeBase = 1,
    MergeSrc = 2,
    FrameScale = 3,
    SrcFrame = 4,
    Transform = 5,
    ColorConversion = 6,
    Alpha = 7,
    UseImage = 8,
}

impl CompositionOpcode {
    pub const ALL: [CompositionOpcode; 9] = [
        CompositionOpcode::UsePrimary,
        CompositionOpcode::MergeBase,
        CompositionOpcode::MergeSrc,
        CompositionOpcode::FrameScale,
        CompositionOpcode::SrcFrame,
        CompositionOpcode::Transform,
        CompositionOpcode::ColorConversion,
        CompositionOpcode::Alpha,
        CompositionOpcode::UseImage,
    ];

    /// Mask covering every defined opcode
    pub const ALL_BITS: u32 = (1 << (CompositionOpcode::UseImage as u32 + 1)) - 1;

    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}
