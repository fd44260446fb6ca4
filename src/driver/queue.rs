use {
    super::{Device, DriverError, QueueFamily},
    ash::vk,
    log::warn,
    parking_lot::{Mutex, MutexGuard},
    std::{slice::from_ref, sync::Arc},
};

/// Location of one hardware queue: a family index and the queue index within that family.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct QueueIndex {
    pub family: u32,
    pub index: u32,
}

/// The queues chosen for the ray dispatch loop and for the copy-and-present loop.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct QueueSelection {
    pub dispatch: QueueIndex,
    pub present: QueueIndex,
}

impl QueueSelection {
    /// Returns `true` when both loops submit to the same hardware queue.
    pub fn is_shared(&self) -> bool {
        self.dispatch == self.present
    }

    /// Returns `true` when resources used by both loops need concurrent sharing.
    pub fn spans_families(&self) -> bool {
        self.dispatch.family != self.present.family
    }

    /// Returns each used family with the number of queues to create from it.
    pub fn family_queue_counts(&self) -> Vec<(u32, u32)> {
        let mut res: Vec<(u32, u32)> = vec![];

        for queue in [self.dispatch, self.present] {
            match res.iter_mut().find(|(family, _)| *family == queue.family) {
                Some((_, count)) => *count = (*count).max(queue.index + 1),
                None => res.push((queue.family, queue.index + 1)),
            }
        }

        res
    }
}

/// Picks a dispatch queue and a present queue.
///
/// `supports_present` holds one entry per family. Preference order:
///
/// 1. Two queues of a single graphics, compute and present capable family
/// 2. A compute family for dispatch and a different graphics and present family
/// 3. One graphics, compute and present capable queue shared by both loops
pub fn select_queue_families(
    families: &[QueueFamily],
    supports_present: &[bool],
) -> Option<QueueSelection> {
    let can_present = |family: &QueueFamily| {
        supports_present
            .get(family.idx as usize)
            .copied()
            .unwrap_or_default()
            && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    };
    let is_universal = |family: &QueueFamily| {
        can_present(family) && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
    };

    if let Some(family) = families
        .iter()
        .find(|family| is_universal(family) && family.queue_count >= 2)
    {
        return Some(QueueSelection {
            dispatch: QueueIndex {
                family: family.idx,
                index: 0,
            },
            present: QueueIndex {
                family: family.idx,
                index: 1,
            },
        });
    }

    let present_family = families.iter().find(|family| can_present(family));
    if let Some(present_family) = present_family {
        // Prefer a dedicated compute family; any other compute family also works
        let dispatch_family = families
            .iter()
            .filter(|family| {
                family.idx != present_family.idx
                    && family.queue_count > 0
                    && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            })
            .min_by_key(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS));

        if let Some(dispatch_family) = dispatch_family {
            return Some(QueueSelection {
                dispatch: QueueIndex {
                    family: dispatch_family.idx,
                    index: 0,
                },
                present: QueueIndex {
                    family: present_family.idx,
                    index: 0,
                },
            });
        }
    }

    families
        .iter()
        .find(|family| is_universal(family) && family.queue_count > 0)
        .map(|family| {
            let queue = QueueIndex {
                family: family.idx,
                index: 0,
            };

            QueueSelection {
                dispatch: queue,
                present: queue,
            }
        })
}

/// One semaphore operation of a submission.
///
/// `value` is ignored for binary semaphores.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage: vk::PipelineStageFlags,
}

impl SemaphoreSubmit {
    pub fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        Self {
            semaphore,
            value: 0,
            stage,
        }
    }

    pub fn timeline(semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags) -> Self {
        Self {
            semaphore,
            value,
            stage,
        }
    }
}

/// A hardware queue.
///
/// Clones share the same submit lock, so when both loops were given the same hardware queue
/// their submissions are serialized as Vulkan requires.
#[derive(Clone, Debug)]
pub struct Queue {
    pub family_index: u32,
    queue: Arc<Mutex<vk::Queue>>,
}

impl Queue {
    pub(super) fn new(family_index: u32, queue: vk::Queue) -> Self {
        Self {
            family_index,
            queue: Arc::new(Mutex::new(queue)),
        }
    }

    pub(crate) fn lock(this: &Self) -> MutexGuard<'_, vk::Queue> {
        this.queue.lock()
    }

    /// Submits one command buffer which waits on and signals the given semaphores.
    #[profiling::function]
    pub fn submit(
        this: &Self,
        device: &Device,
        cmd_buf: vk::CommandBuffer,
        waits: &[SemaphoreSubmit],
        signals: &[SemaphoreSubmit],
        fence: vk::Fence,
    ) -> Result<(), DriverError> {
        let wait_semaphores = waits.iter().map(|wait| wait.semaphore).collect::<Box<_>>();
        let wait_values = waits.iter().map(|wait| wait.value).collect::<Box<_>>();
        let wait_stages = waits.iter().map(|wait| wait.stage).collect::<Box<_>>();
        let signal_semaphores = signals
            .iter()
            .map(|signal| signal.semaphore)
            .collect::<Box<_>>();
        let signal_values = signals.iter().map(|signal| signal.value).collect::<Box<_>>();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(from_ref(&cmd_buf))
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let queue = Self::lock(this);

        unsafe { device.queue_submit(*queue, from_ref(&*submit_info), fence) }.map_err(|err| {
            warn!("unable to submit: {err}");

            DriverError::from_submit_err(err)
        })
    }

    /// Blocks until all work submitted to this queue has finished.
    pub fn wait_idle(this: &Self, device: &Device) -> Result<(), DriverError> {
        let queue = Self::lock(this);

        unsafe { device.queue_wait_idle(*queue) }.map_err(|err| {
            warn!("unable to wait for queue idle: {err}");

            DriverError::from_submit_err(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIVERSAL: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const COMPUTE: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
    );

    fn family(idx: u32, queue_flags: vk::QueueFlags, queue_count: u32) -> QueueFamily {
        QueueFamily {
            idx,
            queue_flags,
            queue_count,
        }
    }

    #[test]
    pub fn prefers_two_queues_of_one_family() {
        let families = [family(0, UNIVERSAL, 16), family(1, COMPUTE, 8)];
        let selection = select_queue_families(&families, &[true, false]).unwrap();

        assert_eq!(selection.dispatch, QueueIndex { family: 0, index: 0 });
        assert_eq!(selection.present, QueueIndex { family: 0, index: 1 });
        assert!(!selection.is_shared());
        assert!(!selection.spans_families());
        assert_eq!(selection.family_queue_counts(), vec![(0, 2)]);
    }

    #[test]
    pub fn falls_back_to_separate_families() {
        let families = [family(0, UNIVERSAL, 1), family(1, COMPUTE, 2)];
        let selection = select_queue_families(&families, &[true, false]).unwrap();

        assert_eq!(selection.dispatch, QueueIndex { family: 1, index: 0 });
        assert_eq!(selection.present, QueueIndex { family: 0, index: 0 });
        assert!(selection.spans_families());
        assert_eq!(selection.family_queue_counts(), vec![(1, 1), (0, 1)]);
    }

    #[test]
    pub fn prefers_dedicated_compute_family() {
        let families = [
            family(0, UNIVERSAL, 1),
            family(1, UNIVERSAL, 1),
            family(2, COMPUTE, 1),
        ];
        let selection = select_queue_families(&families, &[true, true, false]).unwrap();

        assert_eq!(selection.dispatch.family, 2);
        assert_eq!(selection.present.family, 0);
    }

    #[test]
    pub fn shares_a_single_queue() {
        let families = [family(0, UNIVERSAL, 1)];
        let selection = select_queue_families(&families, &[true]).unwrap();

        assert!(selection.is_shared());
        assert_eq!(selection.family_queue_counts(), vec![(0, 1)]);
    }

    #[test]
    pub fn requires_presentation() {
        let families = [family(0, UNIVERSAL, 4), family(1, COMPUTE, 4)];

        assert_eq!(select_queue_families(&families, &[false, false]), None);
        assert_eq!(select_queue_families(&families, &[]), None);
    }

    #[test]
    pub fn present_family_must_be_graphics() {
        let families = [family(0, COMPUTE, 4)];

        assert_eq!(select_queue_families(&families, &[true]), None);
    }
}
