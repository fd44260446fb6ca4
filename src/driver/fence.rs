use {
    super::{Device, DriverError},
    crate::scheduler::FrameFence,
    ash::vk,
    log::{error, warn},
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        slice::from_ref,
        sync::Arc,
        thread::panicking,
        time::Duration,
    },
};

/// A monotonically increasing completion counter backed by a timeline semaphore.
///
/// The GPU advances the counter by signalling it from queue submissions; the host observes it
/// with [`FrameFence::wait`] or [`FrameFence::completed_value`].
pub struct TimelineFence {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl TimelineFence {
    #[profiling::function]
    pub fn create(device: &Arc<Device>) -> Result<Self, DriverError> {
        let device = Arc::clone(device);
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let semaphore = unsafe { device.create_semaphore(&create_info, None) }.map_err(|err| {
            warn!("{err}");

            DriverError::ResourceCreationFailed
        })?;

        Ok(Self { device, semaphore })
    }
}

impl FrameFence for TimelineFence {
    fn completed_value(&self) -> Result<u64, DriverError> {
        unsafe { self.device.get_semaphore_counter_value(self.semaphore) }.map_err(|err| {
            error!("unable to read fence value: {err}");

            DriverError::from_submit_err(err)
        })
    }

    #[profiling::function]
    fn wait(&self, value: u64, timeout: Duration) -> Result<bool, DriverError> {
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(from_ref(&self.semaphore))
            .values(from_ref(&value));

        match unsafe {
            self.device
                .wait_semaphores(&wait_info, timeout.as_nanos() as u64)
        } {
            Ok(_) => Ok(true),
            Err(err) if err == vk::Result::TIMEOUT => Ok(false),
            Err(err) => {
                error!("unable to wait for fence value {value}: {err}");

                Err(DriverError::from_submit_err(err))
            }
        }
    }
}

impl Debug for TimelineFence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimelineFence({:?})", self.semaphore)
    }
}

impl Deref for TimelineFence {
    type Target = vk::Semaphore;

    fn deref(&self) -> &Self::Target {
        &self.semaphore
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
