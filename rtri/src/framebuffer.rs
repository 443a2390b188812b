use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::render_pass::RenderPass;

#[derive(Debug, Error)]
pub enum CreateFramebufferError {
    #[error("Vulkan error creating framebuffer: {0}")]
    Vulkan(vk::Result),
}

fn create_framebuffers_for_views<FCreate, FDestroy>(
    render_pass: vk::RenderPass,
    image_views: &[vk::ImageView],
    extent: vk::Extent2D,
    mut create_framebuffer: FCreate,
    mut destroy_framebuffer: FDestroy,
) -> Result<Vec<vk::Framebuffer>, CreateFramebufferError>
where
    FCreate: FnMut(&vk::FramebufferCreateInfo<'_>) -> Result<vk::Framebuffer, vk::Result>,
    FDestroy: FnMut(vk::Framebuffer),
{
    let mut framebuffers: Vec<vk::Framebuffer> = Vec::with_capacity(image_views.len());
    for view in image_views.iter().copied() {
        let attachments = [view];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match create_framebuffer(&create_info) {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for created in framebuffers.drain(..) {
                    destroy_framebuffer(created);
                }
                return Err(CreateFramebufferError::Vulkan(e));
            }
        }
    }

    Ok(framebuffers)
}

/// One framebuffer per swapchain image view, all sized to the swapchain
/// extent.
///
/// Destroyed and recreated together with the swapchain on every rebuild;
/// [`reset`](Self::reset) exists so the old set can be torn down before the
/// replacement swapchain is created.
pub struct Framebuffers {
    parent: Arc<Device>,
    handles: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for Framebuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffers")
            .field("count", &self.handles.len())
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl Framebuffers {
    /// Create one framebuffer per view in `image_views`.
    ///
    /// `render_pass` and every view must be derived from `device`; the views
    /// stay owned by the swapchain, which must outlive this set.
    pub fn new(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        image_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self, CreateFramebufferError> {
        let handles = create_framebuffers_for_views(
            render_pass.raw_handle(),
            image_views,
            extent,
            |create_info| {
                // SAFETY: create_info references the render pass and a
                // swapchain image view, both derived from device.
                unsafe { device.create_raw_framebuffer(create_info) }
            },
            |framebuffer| {
                // SAFETY: framebuffer was created by device and must be
                // destroyed on early exit.
                unsafe { device.destroy_raw_framebuffer(framebuffer) };
            },
        )?;

        tracing::debug!(
            "Created {} framebuffers at {}x{}",
            handles.len(),
            extent.width,
            extent.height
        );

        Ok(Self {
            parent: Arc::clone(device),
            handles,
            extent,
        })
    }

    pub fn raw_handle(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.handles.get(image_index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Destroy all framebuffers now, leaving the set empty.
    ///
    /// Used during swapchain rebuilds where the old framebuffers must go
    /// before the views they reference. The caller must have synchronized
    /// with the GPU first.
    pub fn reset(&mut self) {
        for framebuffer in self.handles.drain(..) {
            tracing::debug!("Dropping framebuffer {:?}", framebuffer);
            // SAFETY: framebuffer was created by parent and the caller has
            // ensured no in-flight work references it.
            unsafe { self.parent.destroy_raw_framebuffer(framebuffer) };
        }
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn helper_creates_one_framebuffer_per_view() {
        let views = [vk::ImageView::from_raw(1), vk::ImageView::from_raw(2)];
        let produced = [vk::Framebuffer::from_raw(10), vk::Framebuffer::from_raw(11)];
        let calls = RefCell::new(Vec::<(u32, u32)>::new());
        let next = RefCell::new(0usize);

        let result = create_framebuffers_for_views(
            vk::RenderPass::from_raw(99),
            &views,
            EXTENT,
            |create_info| {
                calls
                    .borrow_mut()
                    .push((create_info.width, create_info.height));
                let mut idx = next.borrow_mut();
                let fb = produced[*idx];
                *idx += 1;
                Ok(fb)
            },
            |_| panic!("destroy callback should not be called on success"),
        )
        .expect("helper should succeed");

        assert_eq!(result, produced);
        assert_eq!(calls.borrow().as_slice(), &[(800, 600), (800, 600)]);
    }

    #[test]
    fn helper_cleans_up_on_partial_failure() {
        let views = [
            vk::ImageView::from_raw(1),
            vk::ImageView::from_raw(2),
            vk::ImageView::from_raw(3),
        ];
        let first = vk::Framebuffer::from_raw(10);
        let create_calls = RefCell::new(0usize);
        let destroyed = RefCell::new(Vec::<vk::Framebuffer>::new());

        let result = create_framebuffers_for_views(
            vk::RenderPass::from_raw(99),
            &views,
            EXTENT,
            |_| {
                let mut call = create_calls.borrow_mut();
                let ret = match *call {
                    0 => Ok(first),
                    _ => Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
                };
                *call += 1;
                ret
            },
            |fb| destroyed.borrow_mut().push(fb),
        );

        assert!(matches!(
            result,
            Err(CreateFramebufferError::Vulkan(
                vk::Result::ERROR_OUT_OF_HOST_MEMORY
            ))
        ));
        assert_eq!(destroyed.borrow().as_slice(), &[first]);
    }
}
