// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The pure data model for a single composition layer. A [`Layer`]'s type
//! tag fully determines how many swapchain slots it carries and what they
//! mean; everything else (pose, blend, depth test) is common.

use crate::handles::SwapchainRef;

/// Default cap on the number of layers in a single frame. Brokers may
/// configure a different value; this is the spec's suggested default.
pub const DEFAULT_MAX_LAYERS_PER_FRAME: usize = 16;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LayerFlags: u32 {
        const BLEND_TEXTURE_SOURCE_ALPHA = 1 << 0;
        const UNPREMULTIPLIED_ALPHA      = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EyeVisibility {
    Both,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: glam::Quat,
    pub position: glam::Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            orientation: glam::Quat::IDENTITY,
            position: glam::Vec3::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent2D {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorScaleBias {
    pub scale: glam::Vec4,
    pub bias: glam::Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvancedBlend {
    pub src_factor_color: BlendFactor,
    pub dst_factor_color: BlendFactor,
    pub src_factor_alpha: BlendFactor,
    pub dst_factor_alpha: BlendFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthCompareOp {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTestParams {
    pub far_z: f32,
    pub near_z: f32,
    pub compare_op: DepthCompareOp,
}

/// One view's worth of swapchains for a projection layer. `depth` is only
/// present on projection-with-depth layers.
#[derive(Debug, Clone)]
pub struct ViewSwapchain {
    pub color: SwapchainRef,
    pub depth: Option<SwapchainRef>,
    pub pose: Pose,
    pub field_of_view: (f32, f32, f32, f32), // (angle_left, angle_right, angle_up, angle_down)
}

/// The type-specific payload of a layer. The variant alone determines how
/// many swapchain slots are present and what they mean -- see
/// [`Layer::swapchains`].
#[derive(Debug, Clone)]
pub enum LayerData {
    Projection {
        views: Vec<ViewSwapchain>,
    },
    ProjectionDepth {
        views: Vec<ViewSwapchain>,
    },
    Quad {
        swapchain: SwapchainRef,
        size: Extent2D,
    },
    Cube {
        swapchain: SwapchainRef,
    },
    Cylinder {
        swapchain: SwapchainRef,
        radius: f32,
        central_angle: f32,
        aspect_ratio: f32,
    },
    Equirect1 {
        swapchain: SwapchainRef,
        radius: f32,
        scale: glam::Vec2,
        bias: glam::Vec2,
    },
    Equirect2 {
        swapchain: SwapchainRef,
        radius: f32,
        central_horizontal_angle: f32,
        upper_vertical_angle: f32,
        lower_vertical_angle: f32,
    },
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    Projection,
    ProjectionDepth,
    Quad,
    Cube,
    Cylinder,
    Equirect1,
    Equirect2,
    Passthrough,
}

impl LayerData {
    pub fn layer_type(&self) -> LayerType {
        match self {
            LayerData::Projection { .. } => LayerType::Projection,
            LayerData::ProjectionDepth { .. } => LayerType::ProjectionDepth,
            LayerData::Quad { .. } => LayerType::Quad,
            LayerData::Cube { .. } => LayerType::Cube,
            LayerData::Cylinder { .. } => LayerType::Cylinder,
            LayerData::Equirect1 { .. } => LayerType::Equirect1,
            LayerData::Equirect2 { .. } => LayerType::Equirect2,
            LayerData::Passthrough => LayerType::Passthrough,
        }
    }
}

/// A single composition element submitted by a client during one frame.
#[derive(Debug, Clone)]
pub struct Layer {
    pub data: LayerData,
    pub pose: Pose,
    pub eye_visibility: EyeVisibility,
    pub flags: LayerFlags,
    pub color_scale_bias: Option<ColorScaleBias>,
    pub blend: Option<AdvancedBlend>,
    pub depth_test: Option<DepthTestParams>,
    /// The frame must not be presented before this time.
    pub display_no_earlier_than_ns: u64,
}

impl Layer {
    pub fn layer_type(&self) -> LayerType {
        self.data.layer_type()
    }

    /// All swapchain references this layer holds, in submission order.
    /// Used for refcount accounting and for forwarding to the native
    /// compositor without needing to match on the layer type at each call
    /// site.
    pub fn swapchains(&self) -> Vec<&SwapchainRef> {
        match &self.data {
            LayerData::Projection { views } | LayerData::ProjectionDepth { views } => {
                let mut refs = Vec::with_capacity(views.len() * 2);
                for v in views {
                    refs.push(&v.color);
                    if let Some(depth) = &v.depth {
                        refs.push(depth);
                    }
                }
                refs
            }
            LayerData::Quad { swapchain, .. }
            | LayerData::Cube { swapchain, .. }
            | LayerData::Cylinder { swapchain, .. }
            | LayerData::Equirect1 { swapchain, .. }
            | LayerData::Equirect2 { swapchain, .. } => vec![swapchain],
            LayerData::Passthrough => vec![],
        }
    }
}
