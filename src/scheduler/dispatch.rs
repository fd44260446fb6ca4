use {
    super::{FrameFence, FrameStage, FrameToken, StageProgress, SLOT_COUNT},
    crate::{
        accel::{BottomLevel, TopLevel},
        context::DispatchContext,
        driver::{vk, CommandBuffer, DriverError, Image, Queue, SemaphoreSubmit},
        pipeline::{DescriptorBindings, GlobalConstants, RayTracePipeline, ShaderTables},
        scene::{Animation, SceneInstance},
    },
    log::trace,
    std::{slice::from_ref, sync::Arc},
};

/// The dispatch loop's stage: rebuilds the top-level structure and traces one frame into the
/// slot's output image.
///
/// Owns everything the traced rays read, so none of it is released before the dispatch queue
/// has drained.
#[derive(Debug)]
pub struct RayDispatch {
    pub animation: Animation,
    _blas: Vec<BottomLevel>,
    constants: GlobalConstants,
    ctx: DispatchContext,
    descriptor_set: DescriptorBindings,
    extent: vk::Extent2D,
    instances: Vec<SceneInstance>,
    _outputs: Arc<[Image; SLOT_COUNT]>,
    pipeline: RayTracePipeline,
    shader_tables: ShaderTables,
    tlas: TopLevel,
}

impl RayDispatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: DispatchContext,
        pipeline: RayTracePipeline,
        descriptor_set: DescriptorBindings,
        shader_tables: ShaderTables,
        tlas: TopLevel,
        outputs: Arc<[Image; SLOT_COUNT]>,
        blas: Vec<BottomLevel>,
        instances: Vec<SceneInstance>,
        animation: Animation,
        constants: GlobalConstants,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            animation,
            _blas: blas,
            constants,
            ctx,
            descriptor_set,
            extent,
            instances,
            _outputs: outputs,
            pipeline,
            shader_tables,
            tlas,
        }
    }
}

impl FrameStage for RayDispatch {
    #[profiling::function]
    fn run(&mut self, token: FrameToken) -> Result<StageProgress, DriverError> {
        let fence = &self.ctx.fences[token.slot];
        let cmd_buf = &mut self.ctx.cmd_bufs[token.slot];
        let device = &self.ctx.device;

        CommandBuffer::begin(cmd_buf, fence.completed_value()?)?;

        let angle = self.animation.advance();
        let transforms = self
            .instances
            .iter()
            .map(|instance| instance.transform_at(angle).to_instance_matrix())
            .collect::<Box<_>>();

        TopLevel::record_build(&mut self.tlas, cmd_buf, token.slot, &transforms)?;

        self.constants.frame = self.constants.frame.wrapping_add(1);

        unsafe {
            device.cmd_bind_pipeline(
                **cmd_buf,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                *self.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                **cmd_buf,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                RayTracePipeline::layout(&self.pipeline),
                0,
                from_ref(&*self.descriptor_set),
                &[],
            );
            device.cmd_push_constants(
                **cmd_buf,
                RayTracePipeline::layout(&self.pipeline),
                GlobalConstants::STAGES,
                0,
                bytemuck::bytes_of(&self.constants),
            );
            device.ray_tracing_pipeline_ext.cmd_trace_rays(
                **cmd_buf,
                &ShaderTables::raygen_region(&self.shader_tables, token.slot),
                &ShaderTables::miss_region(&self.shader_tables),
                &ShaderTables::hit_region(&self.shader_tables),
                &vk::StridedDeviceAddressRegionKHR::default(),
                self.extent.width,
                self.extent.height,
                1,
            );
        }

        CommandBuffer::end(cmd_buf)?;

        trace!(
            "dispatch slot {} frame {} at angle {angle}",
            token.slot,
            token.frame
        );

        CommandBuffer::submit(
            cmd_buf,
            &self.ctx.queue,
            &[SemaphoreSubmit::timeline(
                ***fence,
                token.wait_value,
                vk::PipelineStageFlags::ALL_COMMANDS,
            )],
            &[SemaphoreSubmit::timeline(
                ***fence,
                token.signal_value,
                vk::PipelineStageFlags::ALL_COMMANDS,
            )],
            token.signal_value,
        )?;

        Ok(StageProgress::Submitted)
    }

    fn drain(&mut self) -> Result<(), DriverError> {
        Queue::wait_idle(&self.ctx.queue, &self.ctx.device)
    }
}
