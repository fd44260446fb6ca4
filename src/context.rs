//! The device, its queues and the per-loop objects handed to each frame loop.

use {
    crate::{
        driver::{
            select_queue_families, CommandBuffer, Device, DriverError, Instance, PhysicalDevice,
            Queue, Surface, TimelineFence,
        },
        scheduler::SLOT_COUNT,
    },
    log::{info, warn},
    raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle},
    std::{ffi::CStr, sync::Arc},
};

/// Builds one value per frame slot.
pub fn per_slot<T>(
    mut f: impl FnMut(usize) -> Result<T, DriverError>,
) -> Result<[T; SLOT_COUNT], DriverError> {
    let values = (0..SLOT_COUNT).map(&mut f).collect::<Result<Vec<_>, _>>()?;

    values
        .try_into()
        .map_err(|_| DriverError::ResourceCreationFailed)
}

/// Owns the logical device; every other GPU object is created from it.
#[derive(Debug)]
pub struct GpuContext {
    pub device: Arc<Device>,
}

impl GpuContext {
    /// Creates the instance and a presentable surface for `window`, then picks the best ray
    /// tracing device which can present to it.
    #[profiling::function]
    pub fn create(
        window: &(impl HasRawDisplayHandle + HasRawWindowHandle),
        debug: bool,
    ) -> Result<(Self, Surface), DriverError> {
        let required_extensions = ash_window::enumerate_required_extensions(
            window.raw_display_handle(),
        )
        .map_err(|err| {
            warn!("{err}");

            DriverError::DeviceUnavailable
        })?
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(*ext) });

        let instance = Arc::new(Instance::create(debug, required_extensions)?);
        let surface = Surface::create(&instance, window)?;

        let mut physical_devices = Instance::physical_devices(&instance)?
            .into_iter()
            .filter(|physical_device| physical_device.support.is_candidate())
            .collect::<Vec<_>>();
        physical_devices.sort_by_key(|physical_device| PhysicalDevice::score(physical_device));

        let physical_device = physical_devices.pop().ok_or_else(|| {
            warn!("no physical device supports presentation");

            DriverError::DeviceUnavailable
        })?;

        info!("Physical device: {physical_device:?}");

        let present_support = Surface::present_support(&surface, &physical_device);
        let queues = select_queue_families(
            PhysicalDevice::queue_families(&physical_device),
            &present_support,
        )
        .ok_or_else(|| {
            warn!("{physical_device:?} has no usable dispatch and present queues");

            DriverError::DeviceUnavailable
        })?;

        let device = Arc::new(Device::create(&instance, physical_device, queues, debug)?);

        Ok((Self { device }, surface))
    }

    /// Queue family indices which must share the output images, if the loops use two families.
    pub fn output_queue_families(this: &Self) -> Option<[u32; 2]> {
        let dispatch = this.device.dispatch_queue.family_index;
        let present = this.device.present_queue.family_index;

        (dispatch != present).then_some([dispatch, present])
    }

    /// Creates the fences shared by both loops and each loop's command recorders.
    pub fn frame_contexts(this: &Self) -> Result<(DispatchContext, PresentContext), DriverError> {
        let fences = per_slot(|_| TimelineFence::create(&this.device).map(Arc::new))?;

        let dispatch = DispatchContext {
            cmd_bufs: per_slot(|_| {
                CommandBuffer::create(&this.device, this.device.dispatch_queue.family_index)
            })?,
            device: Arc::clone(&this.device),
            fences: fences.clone(),
            queue: this.device.dispatch_queue.clone(),
        };
        let present = PresentContext {
            cmd_bufs: per_slot(|_| {
                CommandBuffer::create(&this.device, this.device.present_queue.family_index)
            })?,
            device: Arc::clone(&this.device),
            fences,
            queue: this.device.present_queue.clone(),
        };

        Ok((dispatch, present))
    }
}

/// What the dispatch loop needs of the device: its queue, recorders and the slot fences.
#[derive(Debug)]
pub struct DispatchContext {
    pub cmd_bufs: [CommandBuffer; SLOT_COUNT],
    pub device: Arc<Device>,
    pub fences: [Arc<TimelineFence>; SLOT_COUNT],
    pub queue: Queue,
}

/// What the present loop needs of the device: its queue, recorders and the slot fences.
#[derive(Debug)]
pub struct PresentContext {
    pub cmd_bufs: [CommandBuffer; SLOT_COUNT],
    pub device: Arc<Device>,
    pub fences: [Arc<TimelineFence>; SLOT_COUNT],
    pub queue: Queue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn per_slot_values() {
        let values = per_slot(Ok).unwrap();

        assert_eq!(values, [0, 1]);
    }

    #[test]
    pub fn per_slot_stops_at_first_error() {
        let mut calls = 0;
        let res = per_slot(|slot| {
            calls += 1;

            if slot == 0 {
                Err(DriverError::ResourceCreationFailed)
            } else {
                Ok(slot)
            }
        });

        assert_eq!(res, Err(DriverError::ResourceCreationFailed));
        assert_eq!(calls, 1);
    }
}
