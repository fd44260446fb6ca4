//! The dual-queue, double-buffered frame scheduler.
//!
//! Two threads run the frame loops: the dispatch loop traces rays on the dispatch queue and the
//! present loop copies the traced image to the swapchain on the present queue. Each loop walks
//! the frame slots in turn and hands off to the other through that slot's [`FrameFence`]:
//!
//! | Loop     | Waits for (host and device) | Signals  |
//! |----------|-----------------------------|----------|
//! | dispatch | `2k`                        | `2k + 1` |
//! | present  | `2k + 1`                    | `2k + 2` |
//!
//! Here `k` counts the frames previously completed on the slot. After `N` frames a slot's fence
//! therefore reads `2N - 1` once the dispatch completes and `2N` once the present completes, and
//! a slot is only re-recorded after everything which used it before has finished.

mod dispatch;
mod present;

pub use self::{dispatch::RayDispatch, present::SwapchainPresent};

use {
    crate::driver::DriverError,
    derive_builder::Builder,
    log::{error, info, trace},
    std::{
        fmt::{Display, Formatter},
        panic::resume_unwind,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Number of frames which may be in flight at once.
pub const SLOT_COUNT: usize = 2;

/// A monotonically increasing completion counter shared by both loops.
pub trait FrameFence: Send + Sync {
    /// Returns the most recently signalled value.
    fn completed_value(&self) -> Result<u64, DriverError>;

    /// Blocks until the fence reaches `value` or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait(&self, value: u64, timeout: Duration) -> Result<bool, DriverError>;
}

/// Which side of the slot handshake a loop runs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LoopKind {
    Dispatch,
    Present,
}

impl LoopKind {
    /// Returns the token of frame `frame` of `slot`.
    pub fn token(self, slot: usize, frame: u64) -> FrameToken {
        let wait_value = match self {
            Self::Dispatch => 2 * frame,
            Self::Present => 2 * frame + 1,
        };

        FrameToken {
            frame,
            signal_value: wait_value + 1,
            slot,
            wait_value,
        }
    }
}

impl Display for LoopKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Dispatch => "dispatch",
            Self::Present => "present",
        })
    }
}

/// One unit of work handed to a [`FrameStage`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FrameToken {
    /// Frames previously completed by this loop on `slot`.
    pub frame: u64,

    /// The fence value the stage's submission must signal.
    pub signal_value: u64,

    pub slot: usize,

    /// The fence value the loop has already observed on the host, and which the stage's
    /// submission must also wait for on the device.
    pub wait_value: u64,
}

/// Whether a stage finished the frame it was handed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StageProgress {
    /// The submission which signals the token's value was made.
    Submitted,

    /// Nothing was submitted; the loop re-checks the stop flag and retries the same token.
    Retry,
}

/// The per-frame work of one loop.
pub trait FrameStage: Send {
    /// Records and submits the work of `token`.
    ///
    /// Called only once the slot's fence has reached `token.wait_value`.
    fn run(&mut self, token: FrameToken) -> Result<StageProgress, DriverError>;

    /// Called once as the loop exits, whether or not it failed.
    fn drain(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Cooperative termination shared by both loops and their owner.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build"),
    derive(Debug),
    pattern = "owned"
)]
pub struct SchedulerInfo {
    /// How long a loop blocks on a fence before re-checking the stop flag.
    #[builder(default = "Duration::from_millis(1000)")]
    pub fence_timeout: Duration,

    /// Stops each loop once every slot has completed this many frames.
    #[builder(default, setter(strip_option))]
    pub frame_limit: Option<u64>,
}

impl SchedulerInfo {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> SchedulerInfoBuilder {
        SchedulerInfoBuilder::default()
    }
}

impl Default for SchedulerInfo {
    fn default() -> Self {
        Self::new().build()
    }
}

// HACK: https://github.com/colin-kiegel/rust-derive-builder/issues/56
impl SchedulerInfoBuilder {
    pub fn build(self) -> SchedulerInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<SchedulerInfoBuilder> for SchedulerInfo {
    fn from(info: SchedulerInfoBuilder) -> Self {
        info.build()
    }
}

/// Frames completed by one loop, per slot.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct LoopReport {
    pub frames: [u64; SLOT_COUNT],
}

impl LoopReport {
    pub fn total(&self) -> u64 {
        self.frames.iter().sum()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SchedulerReport {
    pub dispatch: LoopReport,
    pub present: LoopReport,
}

/// Runs one frame loop on the calling thread until `stop` is set, the frame limit is reached,
/// or an error occurs.
///
/// An error sets `stop` so the other loop exits too.
#[profiling::function]
pub fn run_loop<F, S>(
    kind: LoopKind,
    fences: &[Arc<F>; SLOT_COUNT],
    stage: &mut S,
    stop: &StopFlag,
    info: SchedulerInfo,
) -> Result<LoopReport, DriverError>
where
    F: FrameFence + ?Sized,
    S: FrameStage + ?Sized,
{
    let mut report = LoopReport::default();
    let mut slot = 0;

    let res = loop {
        if stop.is_set() {
            break Ok(());
        }

        if let Some(frame_limit) = info.frame_limit {
            if report.frames.iter().all(|&frames| frames >= frame_limit) {
                break Ok(());
            }

            if report.frames[slot] >= frame_limit {
                slot = (slot + 1) % SLOT_COUNT;
                continue;
            }
        }

        let token = kind.token(slot, report.frames[slot]);

        match fences[slot].wait(token.wait_value, info.fence_timeout) {
            Ok(true) => (),
            Ok(false) => {
                trace!(
                    "{kind} slot {slot} timed out waiting for {}",
                    token.wait_value
                );

                continue;
            }
            Err(err) => break Err(err),
        }

        if stop.is_set() {
            break Ok(());
        }

        match stage.run(token) {
            Ok(StageProgress::Submitted) => {
                report.frames[slot] += 1;
                slot = (slot + 1) % SLOT_COUNT;
            }
            Ok(StageProgress::Retry) => (),
            Err(err) => break Err(err),
        }
    };

    if let Err(err) = res {
        error!("{kind} loop failed: {err}");

        stop.set();
    }

    let drained = stage.drain();

    info!("{kind} loop exited after {:?} frames", report.frames);

    res.and(drained).map(|_| report)
}

/// Owns the two frame loop threads.
#[derive(Debug)]
pub struct FrameScheduler {
    dispatch: Option<JoinHandle<Result<LoopReport, DriverError>>>,
    present: Option<JoinHandle<Result<LoopReport, DriverError>>>,
    stop: StopFlag,
}

impl FrameScheduler {
    /// Spawns the dispatch and present loops.
    pub fn start<F, D, P>(
        info: impl Into<SchedulerInfo>,
        fences: [Arc<F>; SLOT_COUNT],
        mut dispatch: D,
        mut present: P,
    ) -> Result<Self, DriverError>
    where
        F: FrameFence + ?Sized + 'static,
        D: FrameStage + 'static,
        P: FrameStage + 'static,
    {
        let info = info.into();
        let stop = StopFlag::default();

        let dispatch = {
            let fences = fences.clone();
            let stop = stop.clone();

            Self::spawn(LoopKind::Dispatch, move || {
                run_loop(LoopKind::Dispatch, &fences, &mut dispatch, &stop, info)
            })?
        };

        let present = {
            let stop = stop.clone();

            Self::spawn(LoopKind::Present, move || {
                run_loop(LoopKind::Present, &fences, &mut present, &stop, info)
            })
        };

        let present = match present {
            Ok(present) => present,
            Err(err) => {
                stop.set();
                let _ = dispatch.join();

                return Err(err);
            }
        };

        Ok(Self {
            dispatch: Some(dispatch),
            present: Some(present),
            stop,
        })
    }

    fn spawn(
        kind: LoopKind,
        f: impl FnOnce() -> Result<LoopReport, DriverError> + Send + 'static,
    ) -> Result<JoinHandle<Result<LoopReport, DriverError>>, DriverError> {
        thread::Builder::new()
            .name(format!("{kind} loop"))
            .spawn(f)
            .map_err(|err| {
                error!("unable to spawn {kind} loop: {err}");

                DriverError::ResourceCreationFailed
            })
    }

    /// Returns `true` until either loop has exited.
    pub fn is_running(this: &Self) -> bool {
        [&this.dispatch, &this.present]
            .into_iter()
            .all(|handle| handle.as_ref().is_some_and(|handle| !handle.is_finished()))
    }

    pub fn stop_flag(this: &Self) -> StopFlag {
        this.stop.clone()
    }

    /// Sets the stop flag and waits for both loops to exit.
    pub fn stop(mut this: Self) -> Result<SchedulerReport, DriverError> {
        this.stop.set();
        Self::join_loops(&mut this)
    }

    /// Waits for both loops to exit on their own.
    pub fn join(mut this: Self) -> Result<SchedulerReport, DriverError> {
        Self::join_loops(&mut this)
    }

    fn join_loops(this: &mut Self) -> Result<SchedulerReport, DriverError> {
        let join = |handle: Option<JoinHandle<_>>| {
            handle
                .map(|handle| handle.join().unwrap_or_else(|err| resume_unwind(err)))
                .unwrap_or(Ok(LoopReport::default()))
        };

        let dispatch = join(this.dispatch.take());
        let present = join(this.present.take());

        Ok(SchedulerReport {
            dispatch: dispatch?,
            present: present?,
        })
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }

        self.stop.set();

        for handle in [self.dispatch.take(), self.present.take()].into_iter().flatten() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        parking_lot::{Condvar, Mutex},
        std::time::Instant,
    };

    #[derive(Default)]
    struct CountingFence {
        value: Mutex<u64>,
        signalled: Condvar,
    }

    impl CountingFence {
        fn signal(&self, value: u64) {
            let mut current = self.value.lock();
            assert!(value > *current, "fence values must increase");
            *current = value;
            self.signalled.notify_all();
        }
    }

    impl FrameFence for CountingFence {
        fn completed_value(&self) -> Result<u64, DriverError> {
            Ok(*self.value.lock())
        }

        fn wait(&self, value: u64, timeout: Duration) -> Result<bool, DriverError> {
            let deadline = Instant::now() + timeout;
            let mut current = self.value.lock();

            while *current < value {
                if self.signalled.wait_until(&mut current, deadline).timed_out() {
                    return Ok(*current >= value);
                }
            }

            Ok(true)
        }
    }

    struct Signaller {
        fences: [Arc<CountingFence>; SLOT_COUNT],
        tokens: Vec<FrameToken>,
    }

    impl FrameStage for Signaller {
        fn run(&mut self, token: FrameToken) -> Result<StageProgress, DriverError> {
            assert_eq!(
                self.fences[token.slot].completed_value().unwrap(),
                token.wait_value
            );

            self.tokens.push(token);
            self.fences[token.slot].signal(token.signal_value);

            Ok(StageProgress::Submitted)
        }
    }

    fn fences() -> [Arc<CountingFence>; SLOT_COUNT] {
        [Arc::default(), Arc::default()]
    }

    fn info() -> SchedulerInfo {
        SchedulerInfo::new()
            .fence_timeout(Duration::from_millis(10))
            .build()
    }

    #[test]
    pub fn token_values() {
        let dispatch = LoopKind::Dispatch.token(1, 3);
        let present = LoopKind::Present.token(1, 3);

        assert_eq!((dispatch.wait_value, dispatch.signal_value), (6, 7));
        assert_eq!((present.wait_value, present.signal_value), (7, 8));
        assert_eq!(dispatch.slot, 1);
        assert_eq!(present.frame, 3);
    }

    #[test]
    pub fn scheduler_info_defaults() {
        let info = SchedulerInfo::default();

        assert_eq!(info.fence_timeout, Duration::from_millis(1000));
        assert_eq!(info.frame_limit, None);
    }

    #[test]
    pub fn dispatch_alternates_slots() {
        let fences = fences();
        let mut stage = Signaller {
            fences: fences.clone(),
            tokens: vec![],
        };
        let info = SchedulerInfo::new().frame_limit(1).build();

        let report = run_loop(
            LoopKind::Dispatch,
            &fences,
            &mut stage,
            &StopFlag::default(),
            info,
        )
        .unwrap();

        assert_eq!(report.frames, [1, 1]);
        assert_eq!(
            stage.tokens.iter().map(|token| token.slot).collect::<Vec<_>>(),
            [0, 1]
        );
        assert_eq!(fences[0].completed_value().unwrap(), 1);
        assert_eq!(fences[1].completed_value().unwrap(), 1);
    }

    #[test]
    pub fn dispatch_blocks_until_present() {
        let fences = fences();
        let mut stage = Signaller {
            fences: fences.clone(),
            tokens: vec![],
        };
        let stop = StopFlag::default();

        // The second frame of each slot waits for a present which never happens
        let stopper = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                stop.set();
            })
        };

        let report = run_loop(LoopKind::Dispatch, &fences, &mut stage, &stop, info()).unwrap();
        stopper.join().unwrap();

        assert_eq!(report.frames, [1, 1]);
    }

    #[test]
    pub fn present_waits_for_dispatch() {
        let fences = fences();
        let mut stage = Signaller {
            fences: fences.clone(),
            tokens: vec![],
        };
        let stop = StopFlag::default();
        let stopper = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                stop.set();
            })
        };

        let report = run_loop(LoopKind::Present, &fences, &mut stage, &stop, info()).unwrap();
        stopper.join().unwrap();

        assert_eq!(report.frames, [0, 0]);
        assert!(stage.tokens.is_empty());
    }

    #[test]
    pub fn stage_error_sets_stop() {
        struct Failing;

        impl FrameStage for Failing {
            fn run(&mut self, _: FrameToken) -> Result<StageProgress, DriverError> {
                Err(DriverError::SubmitFailed)
            }
        }

        let stop = StopFlag::default();
        let res = run_loop(LoopKind::Dispatch, &fences(), &mut Failing, &stop, info());

        assert_eq!(res, Err(DriverError::SubmitFailed));
        assert!(stop.is_set());
    }

    #[test]
    pub fn retry_keeps_token() {
        struct RetryOnce {
            fences: [Arc<CountingFence>; SLOT_COUNT],
            retried: bool,
            tokens: Vec<FrameToken>,
        }

        impl FrameStage for RetryOnce {
            fn run(&mut self, token: FrameToken) -> Result<StageProgress, DriverError> {
                self.tokens.push(token);

                if !self.retried {
                    self.retried = true;

                    return Ok(StageProgress::Retry);
                }

                self.fences[token.slot].signal(token.signal_value);

                Ok(StageProgress::Submitted)
            }
        }

        let fences = fences();
        let mut stage = RetryOnce {
            fences: fences.clone(),
            retried: false,
            tokens: vec![],
        };
        let info = SchedulerInfo::new().frame_limit(1).build();

        let report =
            run_loop(LoopKind::Dispatch, &fences, &mut stage, &StopFlag::default(), info).unwrap();

        assert_eq!(report.frames, [1, 1]);
        assert_eq!(stage.tokens[0], stage.tokens[1]);
        assert_eq!(stage.tokens.len(), 3);
    }
}
