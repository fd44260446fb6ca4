//! Image state tracking and the barriers that move images between states.

use {
    crate::driver::{ash, vk, AccessType, COLOR_SUBRESOURCE_RANGE},
    log::trace,
    std::ops::Deref,
    vk_sync::{cmd::pipeline_barrier, GlobalBarrier, ImageBarrier, ImageLayout},
};

/// The roles an image takes on during a frame.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ResourceState {
    /// Contents are undefined; any transition out of this state discards them.
    #[default]
    Undefined,

    /// Written by ray tracing shaders as a storage image.
    UnorderedWrite,

    /// Read by a copy command.
    CopySource,

    /// Written by a copy command.
    CopyDestination,

    /// Handed to the presentation engine.
    Presentable,
}

impl ResourceState {
    pub fn accesses(self) -> &'static [AccessType] {
        match self {
            Self::Undefined => &[AccessType::Nothing],
            Self::UnorderedWrite => &[AccessType::AnyShaderWrite],
            Self::CopySource => &[AccessType::TransferRead],
            Self::CopyDestination => &[AccessType::TransferWrite],
            Self::Presentable => &[AccessType::Present],
        }
    }

    pub fn layout(self) -> ImageLayout {
        match self {
            Self::UnorderedWrite => ImageLayout::General,
            _ => ImageLayout::Optimal,
        }
    }
}

/// One recorded state change of a tracked image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub from: ResourceState,
    pub to: ResourceState,
}

impl ImageTransition {
    fn barrier(&self) -> ImageBarrier<'static> {
        ImageBarrier {
            previous_accesses: self.from.accesses(),
            next_accesses: self.to.accesses(),
            previous_layout: self.from.layout(),
            next_layout: self.to.layout(),
            discard_contents: self.from == ResourceState::Undefined,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: self.image,
            range: COLOR_SUBRESOURCE_RANGE,
        }
    }
}

/// An image handle paired with the state its most recent barrier left it in.
///
/// The tracker does not own the image.
#[derive(Debug)]
pub struct TrackedImage {
    image: vk::Image,
    state: ResourceState,
}

impl TrackedImage {
    pub fn new(image: vk::Image) -> Self {
        Self {
            image,
            state: ResourceState::Undefined,
        }
    }

    pub fn state(this: &Self) -> ResourceState {
        this.state
    }

    /// Moves the image to `to`, returning the transition which must be recorded.
    ///
    /// Returns `None` if the image is already in `to`.
    pub fn transition(this: &mut Self, to: ResourceState) -> Option<ImageTransition> {
        if this.state == to {
            return None;
        }

        let transition = ImageTransition {
            image: this.image,
            from: this.state,
            to,
        };
        this.state = to;

        Some(transition)
    }
}

impl Deref for TrackedImage {
    type Target = vk::Image;

    fn deref(&self) -> &Self::Target {
        &self.image
    }
}

/// Records `transitions` into `cmd_buf` as a single pipeline barrier.
#[profiling::function]
pub fn record_transitions(
    device: &ash::Device,
    cmd_buf: vk::CommandBuffer,
    transitions: &[ImageTransition],
) {
    if transitions.is_empty() {
        return;
    }

    for transition in transitions {
        trace!(
            "{:?}: {:?} -> {:?}",
            transition.image,
            transition.from,
            transition.to
        );
    }

    let image_barriers = transitions
        .iter()
        .map(ImageTransition::barrier)
        .collect::<Box<[_]>>();

    pipeline_barrier(device, cmd_buf, None, &[], &image_barriers);
}

/// Records an execution and memory dependency between two sets of accesses.
pub fn record_global(
    device: &ash::Device,
    cmd_buf: vk::CommandBuffer,
    previous_accesses: &[AccessType],
    next_accesses: &[AccessType],
) {
    pipeline_barrier(
        device,
        cmd_buf,
        Some(GlobalBarrier {
            previous_accesses,
            next_accesses,
        }),
        &[],
        &[],
    );
}

#[cfg(test)]
mod tests {
    use {super::*, ash::vk::Handle};

    fn image() -> TrackedImage {
        TrackedImage::new(vk::Image::from_raw(0x42))
    }

    #[test]
    pub fn output_image_cycle() {
        let mut output = image();

        let setup = TrackedImage::transition(&mut output, ResourceState::UnorderedWrite).unwrap();
        assert_eq!(setup.from, ResourceState::Undefined);
        assert!(setup.barrier().discard_contents);

        // Ray dispatch keeps the image in the write state
        assert!(TrackedImage::transition(&mut output, ResourceState::UnorderedWrite).is_none());

        let before_copy = TrackedImage::transition(&mut output, ResourceState::CopySource).unwrap();
        assert_eq!(before_copy.from, ResourceState::UnorderedWrite);
        assert_eq!(before_copy.to, ResourceState::CopySource);
        assert!(!before_copy.barrier().discard_contents);

        let after_copy =
            TrackedImage::transition(&mut output, ResourceState::UnorderedWrite).unwrap();
        assert_eq!(after_copy.from, ResourceState::CopySource);
        assert_eq!(
            TrackedImage::state(&output),
            ResourceState::UnorderedWrite
        );
    }

    #[test]
    pub fn presentable_cycle() {
        let mut surface = image();

        TrackedImage::transition(&mut surface, ResourceState::Presentable);

        let before_copy =
            TrackedImage::transition(&mut surface, ResourceState::CopyDestination).unwrap();
        let barrier = before_copy.barrier();
        assert_eq!(barrier.previous_accesses, &[AccessType::Present]);
        assert_eq!(barrier.next_accesses, &[AccessType::TransferWrite]);

        let after_copy =
            TrackedImage::transition(&mut surface, ResourceState::Presentable).unwrap();
        let barrier = after_copy.barrier();
        assert_eq!(barrier.previous_accesses, &[AccessType::TransferWrite]);
        assert_eq!(barrier.next_accesses, &[AccessType::Present]);
    }

    #[test]
    pub fn unordered_write_uses_general_layout() {
        assert!(matches!(
            ResourceState::UnorderedWrite.layout(),
            ImageLayout::General
        ));
        assert!(matches!(
            ResourceState::CopySource.layout(),
            ImageLayout::Optimal
        ));
    }

    #[test]
    pub fn first_use_of_presentable_discards() {
        let mut surface = image();

        let first =
            TrackedImage::transition(&mut surface, ResourceState::CopyDestination).unwrap();

        assert!(first.barrier().discard_contents);
        assert_eq!(first.barrier().previous_accesses, &[AccessType::Nothing]);
    }
}
