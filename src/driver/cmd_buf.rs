use {
    super::{Device, DriverError, Queue, SemaphoreSubmit},
    ash::vk,
    log::{error, trace, warn},
    std::{fmt::Debug, ops::Deref, slice::from_ref, sync::Arc, thread::panicking},
};

/// Lifecycle of a [`CommandBuffer`]: reset, record, close, submit, then reset again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecorderState {
    /// Ready to begin recording.
    Initial,

    /// Commands are being recorded.
    Recording,

    /// Recording was closed and the commands may be submitted.
    Executable,

    /// Submitted; the submission signals the contained fence value when it completes.
    Pending(u64),
}

impl RecorderState {
    /// Returns `true` if a recorder in this state may be reset and re-recorded once the fence its
    /// previous submission signals has reached `completed`.
    pub fn can_begin(self, completed: u64) -> bool {
        match self {
            Self::Recording => false,
            Self::Pending(value) => completed >= value,
            Self::Initial | Self::Executable => true,
        }
    }
}

/// A reusable command pool and primary command buffer pair.
///
/// A recorder may not be reset while its previous submission is still pending. Callers prove
/// completion by passing the completed value of the fence the submission signals.
#[derive(Debug)]
pub struct CommandBuffer {
    cmd_buf: vk::CommandBuffer,
    device: Arc<Device>,

    /// Binary fence used only by blocking setup submissions.
    fence: vk::Fence,

    pool: vk::CommandPool,
    pub queue_family_index: u32,
    state: RecorderState,
}

impl CommandBuffer {
    #[profiling::function]
    pub fn create(device: &Arc<Device>, queue_family_index: u32) -> Result<Self, DriverError> {
        let device = Arc::clone(device);
        let cmd_pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
            .queue_family_index(queue_family_index);
        let pool = unsafe {
            device
                .create_command_pool(&cmd_pool_info, None)
                .map_err(|err| {
                    warn!("{err}");

                    DriverError::ResourceCreationFailed
                })?
        };
        let cmd_buf_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);
        let cmd_buf = unsafe { device.allocate_command_buffers(&cmd_buf_info) }
            .ok()
            .and_then(|cmd_bufs| cmd_bufs.into_iter().next());
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) };

        let (cmd_buf, fence) = match (cmd_buf, fence) {
            (Some(cmd_buf), Ok(fence)) => (cmd_buf, fence),
            (_, fence) => {
                warn!("unable to allocate command buffer");

                unsafe {
                    if let Ok(fence) = fence {
                        device.destroy_fence(fence, None);
                    }

                    device.destroy_command_pool(pool, None);
                }

                return Err(DriverError::ResourceCreationFailed);
            }
        };

        Ok(Self {
            cmd_buf,
            device,
            fence,
            pool,
            queue_family_index,
            state: RecorderState::Initial,
        })
    }

    /// Resets the recorder and begins recording.
    ///
    /// `completed` is the current value of the fence which the previous submission signals.
    #[profiling::function]
    pub fn begin(this: &mut Self, completed: u64) -> Result<(), DriverError> {
        if !this.state.can_begin(completed) {
            error!(
                "command buffer cannot begin while {:?} (completed {completed})",
                this.state
            );

            return Err(DriverError::SubmitFailed);
        }

        unsafe {
            this.device
                .reset_command_buffer(this.cmd_buf, vk::CommandBufferResetFlags::empty())
                .and_then(|_| {
                    this.device.begin_command_buffer(
                        this.cmd_buf,
                        &vk::CommandBufferBeginInfo::builder()
                            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                    )
                })
                .map_err(|err| {
                    warn!("{err}");

                    DriverError::from_submit_err(err)
                })?;
        }

        this.state = RecorderState::Recording;

        Ok(())
    }

    /// Closes recording.
    pub fn end(this: &mut Self) -> Result<(), DriverError> {
        debug_assert_eq!(this.state, RecorderState::Recording);

        unsafe { this.device.end_command_buffer(this.cmd_buf) }.map_err(|err| {
            warn!("{err}");

            DriverError::from_submit_err(err)
        })?;

        this.state = RecorderState::Executable;

        Ok(())
    }

    /// Submits the recorded commands; `pending` is the fence value the submission will signal.
    #[profiling::function]
    pub fn submit(
        this: &mut Self,
        queue: &Queue,
        waits: &[SemaphoreSubmit],
        signals: &[SemaphoreSubmit],
        pending: u64,
    ) -> Result<(), DriverError> {
        debug_assert_eq!(this.state, RecorderState::Executable);
        debug_assert_eq!(queue.family_index, this.queue_family_index);

        Queue::submit(
            queue,
            &this.device,
            this.cmd_buf,
            waits,
            signals,
            vk::Fence::null(),
        )?;

        this.state = RecorderState::Pending(pending);

        Ok(())
    }

    /// Submits the recorded commands and blocks until the device has executed them.
    #[profiling::function]
    pub fn submit_and_wait(this: &mut Self, queue: &Queue) -> Result<(), DriverError> {
        debug_assert_eq!(this.state, RecorderState::Executable);

        unsafe { this.device.reset_fences(from_ref(&this.fence)) }.map_err(|err| {
            warn!("{err}");

            DriverError::from_submit_err(err)
        })?;

        Queue::submit(queue, &this.device, this.cmd_buf, &[], &[], this.fence)?;

        trace!("waiting for setup submission");

        unsafe {
            this.device
                .wait_for_fences(from_ref(&this.fence), true, u64::MAX)
        }
        .map_err(|err| {
            error!("unable to wait for setup submission: {err}");

            DriverError::from_submit_err(err)
        })?;

        this.state = RecorderState::Initial;

        Ok(())
    }

    pub fn state(this: &Self) -> RecorderState {
        this.state
    }
}

impl Deref for CommandBuffer {
    type Target = vk::CommandBuffer;

    fn deref(&self) -> &Self::Target {
        &self.cmd_buf
    }
}

impl Drop for CommandBuffer {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device
                .free_command_buffers(self.pool, from_ref(&self.cmd_buf));
            self.device.destroy_command_pool(self.pool, None);
            self.device.destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn pending_recorder_waits_for_its_fence() {
        assert!(!RecorderState::Pending(5).can_begin(4));
        assert!(RecorderState::Pending(5).can_begin(5));
        assert!(RecorderState::Pending(5).can_begin(6));
    }

    #[test]
    pub fn idle_recorder_may_begin() {
        assert!(RecorderState::Initial.can_begin(0));
        assert!(RecorderState::Executable.can_begin(0));
    }

    #[test]
    pub fn recording_recorder_may_not_begin() {
        assert!(!RecorderState::Recording.can_begin(u64::MAX));
    }
}
