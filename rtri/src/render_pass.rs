use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateRenderPassError {
    #[error("Vulkan error creating render pass: {0}")]
    Vulkan(vk::Result),
}

/// One color attachment: cleared on load, stored for presentation.
fn color_attachment_description(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
}

/// External-to-subpass dependency holding color attachment writes until the
/// acquired image's layout transition has happened.
fn external_color_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
}

/// A single-subpass render pass writing one presentable color attachment.
///
/// Format-dependent; the pipeline and framebuffers are both created against
/// it, so a surface-format change invalidates all three.
pub struct RenderPass {
    parent: Arc<Device>,
    handle: vk::RenderPass,
    format: vk::Format,
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl RenderPass {
    pub fn new(device: &Arc<Device>, format: vk::Format) -> Result<Self, CreateRenderPassError> {
        let attachments = [color_attachment_description(format)];

        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];

        let dependencies = [external_color_dependency()];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        // SAFETY: create_info is fully initialised from local arrays that
        // outlive the call.
        let handle = unsafe { device.create_raw_render_pass(&create_info) }
            .map_err(CreateRenderPassError::Vulkan)?;

        tracing::debug!("Render pass created for format {:?}", format);

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            format,
        })
    }

    pub fn raw_handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// The attachment format this pass was built against.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        tracing::debug!("Dropping render pass {:?}", self.handle);
        // SAFETY: handle was created from parent. All framebuffers and
        // pipelines built against it must already be gone.
        unsafe { self.parent.destroy_raw_render_pass(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_clears_then_presents() {
        let desc = color_attachment_description(vk::Format::B8G8R8A8_SRGB);
        assert_eq!(desc.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(desc.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(desc.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(desc.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(desc.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(desc.samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn dependency_gates_color_output_on_external_work() {
        let dep = external_color_dependency();
        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_subpass, 0);
        assert_eq!(
            dep.src_stage_mask,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(dep.src_access_mask, vk::AccessFlags::empty());
        assert_eq!(
            dep.dst_stage_mask,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(dep.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    }
}
