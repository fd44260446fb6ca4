use {
    super::{FrameFence, FrameStage, FrameToken, StageProgress, SLOT_COUNT},
    crate::{
        barrier::{record_transitions, ResourceState, TrackedImage},
        context::PresentContext,
        driver::{
            vk, AcquireError, CommandBuffer, DriverError, Image, Queue, SemaphoreSubmit,
            Swapchain, COLOR_SUBRESOURCE_RANGE,
        },
    },
    log::{debug, trace},
    std::{sync::Arc, time::Duration},
};

/// Returns the region copied from an output image of `src` extent to a swapchain image of `dst`
/// extent: the overlap of the two, anchored at the origin.
pub fn copy_region(src: vk::Extent2D, dst: vk::Extent2D) -> vk::ImageCopy {
    let layers = vk::ImageSubresourceLayers {
        aspect_mask: COLOR_SUBRESOURCE_RANGE.aspect_mask,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };

    vk::ImageCopy {
        src_subresource: layers,
        src_offset: vk::Offset3D::default(),
        dst_subresource: layers,
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: src.width.min(dst.width),
            height: src.height.min(dst.height),
            depth: 1,
        },
    }
}

/// The present loop's stage: copies the slot's output image into the next swapchain image and
/// presents it.
#[derive(Debug)]
pub struct SwapchainPresent {
    acquire_timeout: Duration,
    ctx: PresentContext,
    output_states: [TrackedImage; SLOT_COUNT],
    outputs: Arc<[Image; SLOT_COUNT]>,
    swapchain: Swapchain,
}

impl SwapchainPresent {
    /// `output_states` must describe the state each output image was left in by setup.
    pub fn new(
        ctx: PresentContext,
        swapchain: Swapchain,
        outputs: Arc<[Image; SLOT_COUNT]>,
        output_states: [TrackedImage; SLOT_COUNT],
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            acquire_timeout,
            ctx,
            output_states,
            outputs,
            swapchain,
        }
    }
}

impl FrameStage for SwapchainPresent {
    #[profiling::function]
    fn run(&mut self, token: FrameToken) -> Result<StageProgress, DriverError> {
        let image = match Swapchain::acquire(&mut self.swapchain, token.slot, self.acquire_timeout)
        {
            Ok(image) => image,
            Err(AcquireError::Timeout) => {
                trace!("timed out acquiring a swapchain image");

                return Ok(StageProgress::Retry);
            }
            Err(AcquireError::OutOfDate) => {
                debug!("swapchain recreated");

                return Ok(StageProgress::Retry);
            }
            Err(AcquireError::DeviceLost) => return Err(DriverError::DeviceLost),
            Err(AcquireError::SurfaceLost) => return Err(DriverError::SubmitFailed),
        };

        let fence = &self.ctx.fences[token.slot];
        let cmd_buf = &mut self.ctx.cmd_bufs[token.slot];
        let device = &self.ctx.device;
        let output = &mut self.output_states[token.slot];

        CommandBuffer::begin(cmd_buf, fence.completed_value()?)?;

        let transitions = [
            TrackedImage::transition(output, ResourceState::CopySource),
            TrackedImage::transition(
                Swapchain::tracked_image_mut(&mut self.swapchain, image.idx),
                ResourceState::CopyDestination,
            ),
        ];
        record_transitions(device, **cmd_buf, &transitions.into_iter().flatten().collect::<Box<_>>());

        let region = copy_region(Image::extent(&self.outputs[token.slot]), image.extent);

        unsafe {
            device.cmd_copy_image(
                **cmd_buf,
                **output,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        let transitions = [
            TrackedImage::transition(output, ResourceState::UnorderedWrite),
            TrackedImage::transition(
                Swapchain::tracked_image_mut(&mut self.swapchain, image.idx),
                ResourceState::Presentable,
            ),
        ];
        record_transitions(device, **cmd_buf, &transitions.into_iter().flatten().collect::<Box<_>>());

        CommandBuffer::end(cmd_buf)?;

        trace!(
            "present slot {} frame {} to image {}",
            token.slot,
            token.frame,
            image.idx
        );

        CommandBuffer::submit(
            cmd_buf,
            &self.ctx.queue,
            &[
                SemaphoreSubmit::binary(image.acquired, vk::PipelineStageFlags::TRANSFER),
                SemaphoreSubmit::timeline(
                    ***fence,
                    token.wait_value,
                    vk::PipelineStageFlags::TRANSFER,
                ),
            ],
            &[
                SemaphoreSubmit::timeline(
                    ***fence,
                    token.signal_value,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                ),
                SemaphoreSubmit::binary(image.rendered, vk::PipelineStageFlags::ALL_COMMANDS),
            ],
            token.signal_value,
        )?;

        Swapchain::present(&mut self.swapchain, &self.ctx.queue, image)?;

        Ok(StageProgress::Submitted)
    }

    fn drain(&mut self) -> Result<(), DriverError> {
        Queue::wait_idle(&self.ctx.queue, &self.ctx.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    pub fn copy_region_matches_equal_extents() {
        let region = copy_region(extent(1920, 1080), extent(1920, 1080));

        assert_eq!(region.extent.width, 1920);
        assert_eq!(region.extent.height, 1080);
        assert_eq!(region.extent.depth, 1);
    }

    #[test]
    pub fn copy_region_clamps_to_smaller_extent() {
        let region = copy_region(extent(1920, 1080), extent(1280, 1440));

        assert_eq!(region.extent.width, 1280);
        assert_eq!(region.extent.height, 1080);
        assert_eq!(region.src_offset, vk::Offset3D::default());
        assert_eq!(region.dst_offset, vk::Offset3D::default());
    }
}
