//! Vulkan resource wrappers used by the frame pipeline.
//!
//! Every type here owns exactly one Vulkan object (or a small group of objects which are always
//! created and destroyed together) and releases it on drop. Each wrapper keeps an `Arc<Device>`
//! so the logical device always outlives the objects created from it.

mod buffer;
mod cmd_buf;
mod device;
mod fence;
mod image;
mod instance;
mod physical_device;
mod queue;
mod shader;
mod surface;
mod swapchain;

pub use {
    self::{
        buffer::{Buffer, BufferInfo, BufferInfoBuilder},
        cmd_buf::{CommandBuffer, RecorderState},
        device::Device,
        fence::TimelineFence,
        image::{Image, ImageInfo, ImageInfoBuilder, COLOR_SUBRESOURCE_RANGE},
        instance::Instance,
        physical_device::{DeviceSupport, PhysicalDevice, QueueFamily, RayTracingProperties},
        queue::{select_queue_families, Queue, QueueIndex, QueueSelection, SemaphoreSubmit},
        shader::{CompiledShader, EntryPoint, ShaderCompiler, ShaderLibrary, ShaderStage},
        surface::Surface,
        swapchain::{
            pick_surface_format, AcquireError, Swapchain, SwapchainImage, SwapchainInfo,
            SwapchainInfoBuilder,
        },
    },
    ash::{self, vk},
    vk_sync::AccessType,
};

use std::{
    error::Error,
    fmt::{Display, Formatter},
};

/// Rounds `offset` up to the next multiple of `alignment`, which must be a power of two.
pub const fn align_up(offset: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());

    (offset + alignment - 1) & !(alignment - 1)
}

/// Describes the general category of all graphics driver failure cases.
///
/// The first six variants may occur only while the renderer is being set up. The last two are
/// reported by the frame loops, which stop both loops when they happen.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DriverError {
    /// No physical device meets the minimum capability.
    DeviceUnavailable,

    /// The selected device lacks a required ray tracing capability.
    FeatureUnsupported,

    /// A buffer, image, memory or acceleration structure allocation was rejected.
    ResourceCreationFailed,

    /// Shader source failed to compile or the device rejected the pipeline.
    PipelineCompilationFailed,

    /// The shader binding tables could not be laid out or written.
    ShaderTableBuildFailed,

    /// Mesh import failed or produced geometry the pipeline cannot use.
    AssetLoadFailed,

    /// The device was lost while waiting or submitting.
    DeviceLost,

    /// The queue rejected a command submission.
    SubmitFailed,
}

impl DriverError {
    pub(crate) fn from_submit_err(err: vk::Result) -> Self {
        if err == vk::Result::ERROR_DEVICE_LOST {
            Self::DeviceLost
        } else {
            Self::SubmitFailed
        }
    }
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for DriverError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(36, 32), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    pub fn submit_errors() {
        assert_eq!(
            DriverError::from_submit_err(vk::Result::ERROR_DEVICE_LOST),
            DriverError::DeviceLost
        );
        assert_eq!(
            DriverError::from_submit_err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            DriverError::SubmitFailed
        );
    }
}
