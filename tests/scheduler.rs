use {
    infinity_mirror::{
        driver::DriverError,
        scheduler::{
            FrameFence, FrameScheduler, FrameStage, FrameToken, SchedulerInfo, StageProgress,
            SLOT_COUNT,
        },
    },
    parking_lot::{Condvar, Mutex},
    std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
};

/// A timeline fence signalled from the host.
#[derive(Debug, Default)]
struct HostFence {
    value: Mutex<u64>,
    signalled: Condvar,
}

impl HostFence {
    fn signal(&self, value: u64) {
        let mut current = self.value.lock();

        assert!(value > *current, "{value} does not follow {}", *current);

        *current = value;
        self.signalled.notify_all();
    }

    fn value(&self) -> u64 {
        *self.value.lock()
    }
}

impl FrameFence for HostFence {
    fn completed_value(&self) -> Result<u64, DriverError> {
        Ok(self.value())
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

/// Completes every frame it is handed, recording the order it saw them in.
struct HostStage {
    delay: Duration,
    fences: [Arc<HostFence>; SLOT_COUNT],
    log: Arc<Mutex<Vec<(&'static str, FrameToken)>>>,
    name: &'static str,
}

impl FrameStage for HostStage {
    fn run(&mut self, token: FrameToken) -> Result<StageProgress, DriverError> {
        let fence = &self.fences[token.slot];

        // Nothing may have signalled past the value this frame waited for
        assert_eq!(fence.value(), token.wait_value);

        thread::sleep(self.delay);

        self.log.lock().push((self.name, token));
        fence.signal(token.signal_value);

        Ok(StageProgress::Submitted)
    }
}

fn fences() -> [Arc<HostFence>; SLOT_COUNT] {
    [Arc::default(), Arc::default()]
}

fn stages(
    fences: &[Arc<HostFence>; SLOT_COUNT],
    delay: Duration,
) -> (HostStage, HostStage, Arc<Mutex<Vec<(&'static str, FrameToken)>>>) {
    let log = Arc::new(Mutex::new(vec![]));
    let stage = |name| HostStage {
        delay,
        fences: fences.clone(),
        log: Arc::clone(&log),
        name,
    };

    (stage("dispatch"), stage("present"), log)
}

#[test]
pub fn frame_limit_leaves_fences_at_twice_the_frame_count() {
    let fences = fences();
    let (dispatch, present, log) = stages(&fences, Duration::ZERO);

    let scheduler = FrameScheduler::start(
        SchedulerInfo::new()
            .fence_timeout(Duration::from_millis(10))
            .frame_limit(5),
        fences.clone(),
        dispatch,
        present,
    )
    .unwrap();
    let report = FrameScheduler::join(scheduler).unwrap();

    assert_eq!(report.dispatch.frames, [5, 5]);
    assert_eq!(report.present.frames, [5, 5]);

    for fence in &fences {
        assert_eq!(fence.value(), 10);
    }

    // Each slot alternates strictly between the two loops
    let log = log.lock();
    for slot in 0..SLOT_COUNT {
        let names = log
            .iter()
            .filter(|(_, token)| token.slot == slot)
            .map(|(name, token)| {
                assert_eq!(token.signal_value, token.wait_value + 1);

                *name
            })
            .collect::<Vec<_>>();

        assert_eq!(names.len(), 10);
        assert!(names
            .chunks(2)
            .all(|pair| pair == ["dispatch", "present"]));
    }
}

#[test]
pub fn stop_while_present_is_stalled() {
    struct Stalled;

    impl FrameStage for Stalled {
        fn run(&mut self, _: FrameToken) -> Result<StageProgress, DriverError> {
            Ok(StageProgress::Retry)
        }
    }

    let fences = fences();
    let (dispatch, _, log) = stages(&fences, Duration::ZERO);

    let scheduler = FrameScheduler::start(
        SchedulerInfo::new().fence_timeout(Duration::from_millis(5)),
        fences.clone(),
        dispatch,
        Stalled,
    )
    .unwrap();

    thread::sleep(Duration::from_millis(50));

    assert!(FrameScheduler::is_running(&scheduler));

    let report = FrameScheduler::stop(scheduler).unwrap();

    // Dispatch ran ahead by exactly one frame per slot
    assert_eq!(report.dispatch.frames, [1, 1]);
    assert_eq!(report.present.frames, [0, 0]);
    assert_eq!(fences[0].value(), 1);
    assert_eq!(fences[1].value(), 1);
    assert_eq!(log.lock().len(), 2);
}

#[test]
pub fn stage_error_stops_both_loops() {
    struct FailsOnFrame(u64, HostStage);

    impl FrameStage for FailsOnFrame {
        fn run(&mut self, token: FrameToken) -> Result<StageProgress, DriverError> {
            if token.frame == self.0 {
                return Err(DriverError::DeviceLost);
            }

            self.1.run(token)
        }
    }

    let fences = fences();
    let (dispatch, present, _) = stages(&fences, Duration::from_millis(1));

    let scheduler = FrameScheduler::start(
        SchedulerInfo::new().fence_timeout(Duration::from_millis(5)),
        fences,
        dispatch,
        FailsOnFrame(3, present),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while FrameScheduler::is_running(&scheduler) {
        assert!(Instant::now() < deadline, "loops did not stop");

        thread::sleep(Duration::from_millis(1));
    }

    assert!(FrameScheduler::stop_flag(&scheduler).is_set());
    assert_eq!(FrameScheduler::join(scheduler), Err(DriverError::DeviceLost));
}

#[test]
pub fn drain_runs_on_exit() {
    struct Draining(Arc<Mutex<u32>>);

    impl FrameStage for Draining {
        fn run(&mut self, _: FrameToken) -> Result<StageProgress, DriverError> {
            Ok(StageProgress::Retry)
        }

        fn drain(&mut self) -> Result<(), DriverError> {
            *self.0.lock() += 1;

            Ok(())
        }
    }

    let drained = Arc::new(Mutex::new(0));
    let scheduler = FrameScheduler::start(
        SchedulerInfo::new().fence_timeout(Duration::from_millis(5)),
        fences(),
        Draining(Arc::clone(&drained)),
        Draining(Arc::clone(&drained)),
    )
    .unwrap();

    FrameScheduler::stop(scheduler).unwrap();

    assert_eq!(*drained.lock(), 2);
}
