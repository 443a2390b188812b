use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::render_pass::RenderPass;
use crate::shader::EntryPoint;

/// An owned wrapper around a `VkPipelineLayout`.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// Create an empty pipeline layout with no descriptor sets and no push
    /// constant ranges.
    pub fn new_empty(device: &Arc<Device>) -> Result<Self, vk::Result> {
        let create_info = vk::PipelineLayoutCreateInfo::default();
        // SAFETY: create_info is default-initialised; it imposes no additional
        // validity requirements on the device.
        let handle = unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: handle was created from parent. All pipelines using this
        // layout must be dropped first.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("No shader stages provided")]
    NoStages,

    #[error("Vulkan error creating empty pipeline layout: {0}")]
    LayoutCreation(vk::Result),

    #[error("Vulkan error creating graphics pipeline: {0}")]
    PipelineCreation(vk::Result),
}

/// A graphics pipeline built against a classic render pass.
///
/// Fixed pipeline state applied during construction:
/// - Vertex input: none (the vertex stage synthesises its own geometry)
/// - Input assembly: `TRIANGLE_LIST`
/// - Viewport/scissor: fully dynamic, supplied per frame
/// - Rasterization: fill mode, back-face culling, clockwise front face,
///   line width fixed at 1.0
/// - Multisample: single sample
/// - Depth/stencil: test and write disabled
/// - Color blend: no blending, full RGBA write mask
pub struct GraphicsPipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl GraphicsPipeline {
    /// Create a graphics pipeline from shader entry points and a render
    /// pass.
    ///
    /// When `layout` is `None` an empty layout is created internally and
    /// owned exclusively by the resulting pipeline.
    pub fn new(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        stages: &[EntryPoint<'_>],
        layout: Option<Arc<PipelineLayout>>,
    ) -> Result<Self, CreatePipelineError> {
        if stages.is_empty() {
            return Err(CreatePipelineError::NoStages);
        }

        let layout = match layout {
            Some(l) => l,
            None => Arc::new(
                PipelineLayout::new_empty(device).map_err(CreatePipelineError::LayoutCreation)?,
            ),
        };

        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = stages
            .iter()
            .map(|ep| ep.as_pipeline_stage_create_info())
            .collect();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        // Viewport and scissor counts must be declared even though their
        // values are supplied dynamically.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default();

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_create_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout.raw_handle())
            .render_pass(render_pass.raw_handle())
            .subpass(0);

        // SAFETY: create_info references valid shader stages, a valid
        // pipeline layout, and a valid render pass, all derived from device
        // and valid for the duration of this call.
        let handle = unsafe { device.create_raw_graphics_pipeline(&create_info) }
            .map_err(CreatePipelineError::PipelineCreation)?;

        tracing::debug!("Graphics pipeline created {:?}", handle);

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout,
        })
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent. All in-flight GPU work
        // referencing this pipeline must be completed before drop.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
        // The layout Arc is released here; the layout itself is destroyed
        // only when all pipelines sharing it have been dropped.
    }
}

/// Whether the frame scheduler may bind a pipeline this frame.
///
/// `NotBuilt` covers both "shader artifacts were never found" and
/// "construction failed"; frames still clear the screen. `Stale` keeps the
/// old pipeline alive (it is valid against the old render pass format) but
/// stops binding it after the surface format has changed out from under it.
#[derive(Debug)]
pub enum PipelineState<P = GraphicsPipeline> {
    NotBuilt,
    Ready(P),
    Stale(P),
}

impl<P> PipelineState<P> {
    /// The pipeline to bind this frame, if any.
    pub fn bindable(&self) -> Option<&P> {
        match self {
            PipelineState::Ready(p) => Some(p),
            PipelineState::NotBuilt | PipelineState::Stale(_) => None,
        }
    }

    /// Demote a ready pipeline after its render-target format changed.
    /// `NotBuilt` and `Stale` are unchanged.
    pub fn mark_stale(&mut self) {
        *self = match std::mem::replace(self, PipelineState::NotBuilt) {
            PipelineState::Ready(p) | PipelineState::Stale(p) => PipelineState::Stale(p),
            PipelineState::NotBuilt => PipelineState::NotBuilt,
        };
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, PipelineState::Ready(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_pipeline_is_bindable() {
        let state: PipelineState<u32> = PipelineState::Ready(7);
        assert_eq!(state.bindable(), Some(&7));
        assert!(state.is_ready());
    }

    #[test]
    fn not_built_is_not_bindable() {
        let state: PipelineState<u32> = PipelineState::NotBuilt;
        assert_eq!(state.bindable(), None);
        assert!(!state.is_ready());
    }

    #[test]
    fn marking_stale_stops_binding_but_keeps_value() {
        let mut state: PipelineState<u32> = PipelineState::Ready(7);
        state.mark_stale();
        assert_eq!(state.bindable(), None);
        assert!(matches!(state, PipelineState::Stale(7)));
    }

    #[test]
    fn marking_not_built_stale_is_a_no_op() {
        let mut state: PipelineState<u32> = PipelineState::NotBuilt;
        state.mark_stale();
        assert!(matches!(state, PipelineState::NotBuilt));
    }
}
