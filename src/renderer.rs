//! Ordered setup of every GPU object, and ownership of the running frame loops.

use {
    crate::{
        accel::{BottomLevel, TopLevel},
        barrier::{record_transitions, ResourceState, TrackedImage},
        config::MirrorConfig,
        context::{per_slot, GpuContext},
        driver::{
            pick_surface_format, vk, Buffer, CommandBuffer, Device, DriverError, Image, ImageInfo,
            Surface, Swapchain, SwapchainInfo,
        },
        pipeline::{
            DescriptorBindings, GlobalConstants, RayTracePipeline, ShaderRecord, ShaderTables,
        },
        scene::{load_mesh, Animation, Material, Scene},
        scheduler::{
            FrameScheduler, RayDispatch, SchedulerInfo, SchedulerReport,
            SwapchainPresent, SLOT_COUNT,
        },
    },
    log::{error, info},
    raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle},
    std::{fs::read_to_string, sync::Arc},
};

/// Runs one setup step, logging its outcome.
fn step<T>(name: &str, f: impl FnOnce() -> Result<T, DriverError>) -> Result<T, DriverError> {
    match f() {
        Ok(res) => {
            info!("Setup: {name}");

            Ok(res)
        }
        Err(err) => {
            error!("Setup failed at {name}: {err}");

            Err(err)
        }
    }
}

/// Returns the hit record of each mesh part, in instance order.
pub fn hit_records(blas: &[BottomLevel], materials: &[Material]) -> Vec<ShaderRecord> {
    blas.iter()
        .zip(materials)
        .map(|(blas, material)| match *material {
            Material::Mirror => ShaderRecord::Mirror {
                vertices: Buffer::device_address(&blas.vertices),
                indices: Buffer::device_address(&blas.indices),
            },
            Material::Edge { color } => ShaderRecord::Edge { color },
        })
        .collect()
}

/// Each instance selects the hit record at its own index, so the hit table must hold exactly one
/// record per instance.
fn check_hit_table(hit_records: u64, instances: usize) -> Result<(), DriverError> {
    if hit_records != instances as u64 {
        error!("{hit_records} hit records for {instances} instances");

        return Err(DriverError::ShaderTableBuildFailed);
    }

    Ok(())
}

/// The running renderer: both frame loops plus the device they use.
#[derive(Debug)]
pub struct Renderer {
    scheduler: FrameScheduler,
    ctx: GpuContext,
}

impl Renderer {
    /// Creates everything in order and starts the frame loops.
    ///
    /// Setup stops at the first failing step; whatever was already created is dropped in reverse
    /// order.
    #[profiling::function]
    pub fn setup(
        window: &(impl HasRawDisplayHandle + HasRawWindowHandle),
        config: &MirrorConfig,
    ) -> Result<Self, DriverError> {
        let (ctx, surface) = step("device", || GpuContext::create(window, config.debug))?;
        let device = &ctx.device;

        let swapchain = step("swapchain", || create_swapchain(device, surface, config))?;
        let extent = Swapchain::extent(&swapchain);
        let format = swapchain.info.format.format;

        let scene = step("scene", || {
            let parts = match &config.model_path {
                Some(path) => load_mesh(path)?,
                None => Scene::mirror_box(),
            };

            Scene::new(parts, config.materials.clone(), config.mesh_parts)
        })?;

        let mut setup_cmd_buf = CommandBuffer::create(device, device.dispatch_queue.family_index)?;

        let blas = step("bottom-level acceleration structures", || {
            scene
                .parts
                .iter()
                .map(|part| BottomLevel::build(device, &mut setup_cmd_buf, part))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let (tlas, outputs, output_states) =
            step("top-level acceleration structure and output images", || {
                let mut tlas = TopLevel::create(device, &blas, SLOT_COUNT)?;
                let outputs = per_slot(|_| {
                    let mut info = ImageInfo::new_output(extent.width, extent.height, format);

                    if let Some(families) = GpuContext::output_queue_families(&ctx) {
                        info = info.queue_family_indices(families);
                    }

                    Image::create(device, info)
                })?;
                let mut output_states = outputs.each_ref().map(|image| TrackedImage::new(**image));

                CommandBuffer::begin(&mut setup_cmd_buf, 0)?;
                TopLevel::record_build(&mut tlas, &setup_cmd_buf, 0, &scene.instance_matrices(0.0))?;
                record_transitions(
                    device,
                    *setup_cmd_buf,
                    &output_states
                        .iter_mut()
                        .filter_map(|output| {
                            TrackedImage::transition(output, ResourceState::UnorderedWrite)
                        })
                        .collect::<Box<_>>(),
                );
                CommandBuffer::end(&mut setup_cmd_buf)?;
                CommandBuffer::submit_and_wait(&mut setup_cmd_buf, &device.dispatch_queue)?;

                Ok((tlas, Arc::new(outputs), output_states))
            })?;

        let pipeline = step("ray tracing pipeline", || {
            let source = read_to_string(&config.shader_path).map_err(|err| {
                error!("unable to read {}: {err}", config.shader_path.display());

                DriverError::PipelineCompilationFailed
            })?;

            RayTracePipeline::compile(
                device,
                &source,
                &config.shader_path.to_string_lossy(),
                config.max_ray_recursion_depth,
            )
        })?;

        let descriptor_set = step("descriptor set", || {
            DescriptorBindings::create(device, &pipeline, &tlas.accel_struct, outputs.as_slice())
        })?;

        let shader_tables = step("shader tables", || {
            let tables = ShaderTables::build(
                device,
                &pipeline,
                SLOT_COUNT,
                &hit_records(&blas, &scene.materials),
            )?;

            check_hit_table(
                ShaderTables::hit_record_count(&tables),
                TopLevel::instance_count(&tlas),
            )?;

            Ok(tables)
        })?;

        let (dispatch_ctx, present_ctx) = step("frame contexts", || GpuContext::frame_contexts(&ctx))?;
        let fences = dispatch_ctx.fences.clone();

        let constants = GlobalConstants {
            tint: config.tint,
            eye: scene.eye.extend(1.0).to_array(),
            max_depth: pipeline.max_recursion_depth,
            ..Default::default()
        };
        let dispatch = RayDispatch::new(
            dispatch_ctx,
            pipeline,
            descriptor_set,
            shader_tables,
            tlas,
            Arc::clone(&outputs),
            blas,
            scene.instances,
            Animation::new(config.animation_step),
            constants,
            extent,
        );
        let present = SwapchainPresent::new(
            present_ctx,
            swapchain,
            outputs,
            output_states,
            config.fence_timeout,
        );

        let scheduler = step("frame scheduler", || {
            FrameScheduler::start(
                SchedulerInfo::new().fence_timeout(config.fence_timeout),
                fences,
                dispatch,
                present,
            )
        })?;

        Ok(Self { scheduler, ctx })
    }

    /// Returns `true` until either frame loop has exited.
    pub fn is_running(this: &Self) -> bool {
        FrameScheduler::is_running(&this.scheduler)
    }

    /// Stops both frame loops and reports how many frames each completed.
    pub fn stop(this: Self) -> Result<SchedulerReport, DriverError> {
        let Self { scheduler, ctx } = this;
        let res = FrameScheduler::stop(scheduler);

        info!("Stopped after {res:?}");

        drop(ctx);

        res
    }
}

fn create_swapchain(
    device: &Arc<Device>,
    surface: Surface,
    config: &MirrorConfig,
) -> Result<Swapchain, DriverError> {
    let formats = Surface::formats(&surface, &device.physical_device)?;
    let format = pick_surface_format(&formats, |format| {
        Device::supports_format_features(
            device,
            format,
            vk::FormatFeatureFlags::STORAGE_IMAGE | vk::FormatFeatureFlags::TRANSFER_SRC,
        )
    })
    .ok_or_else(|| {
        error!("no surface format supports storage writes");

        DriverError::FeatureUnsupported
    })?;

    info!("Surface format: {:?}", format.format);

    Swapchain::create(
        device,
        surface,
        SwapchainInfo::new(config.width, config.height, format)
            .desired_image_count(config.swapchain_image_count)
            .sync_display(config.sync_display),
        SLOT_COUNT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn step_passes_results_through() {
        assert_eq!(step("ok", || Ok(7)), Ok(7));
        assert_eq!(
            step::<()>("fails", || Err(DriverError::AssetLoadFailed)),
            Err(DriverError::AssetLoadFailed)
        );
    }

    #[test]
    pub fn hit_table_needs_one_record_per_instance() {
        assert_eq!(check_hit_table(2, 2), Ok(()));
        assert_eq!(
            check_hit_table(1, 2),
            Err(DriverError::ShaderTableBuildFailed)
        );
        assert_eq!(
            check_hit_table(3, 2),
            Err(DriverError::ShaderTableBuildFailed)
        );
    }

    #[test]
    pub fn later_steps_are_skipped() {
        let mut ran = vec![];
        let res = (|| {
            step("first", || {
                ran.push(1);

                Err::<(), _>(DriverError::ShaderTableBuildFailed)
            })?;
            step("second", || {
                ran.push(2);

                Ok(())
            })
        })();

        assert_eq!(res, Err(DriverError::ShaderTableBuildFailed));
        assert_eq!(ran, [1]);
    }
}
