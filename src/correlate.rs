//! Sleep/wake correlation engine
//!
//! The one stateful component between the trace stream and the aggregate
//! buckets. Tracks every task currently off-CPU as a [`SleepEpisode`],
//! routes call-stack continuation lines to whichever pending episode is
//! expecting them, and closes episodes when their task is switched back
//! in. Malformed or out-of-order input degrades to missed correlations,
//! never to an error: everything that cannot be attributed is dropped and
//! counted.
//!
//! Stack routing needs care because continuation lines carry no task
//! identity of their own. A `<stack trace>` sentinel record names the task
//! whose stack follows: for a sleep stack that is the sleeper itself, for
//! a wakeup stack it is the waker, which is usually a different task on a
//! different CPU. The engine keeps a waker → sleeper association from each
//! wakeup event so the sentinel can find the right episode.

use fnv::FnvHashMap;

use crate::sched::{SchedClassifier, SwitchEvent, WakeupEvent};
use crate::traceline::TraceRecord;

/// Separator between frames in a joined stack signature
pub const FRAME_SEP: char = ':';

/// The idle task; never tracked as a sleeper
const IDLE_PID: u32 = 0;

/// One continuous off-CPU period for a single task, from switch-out to
/// switch-in
#[derive(Debug, Clone, PartialEq)]
pub struct SleepEpisode {
    pub pid: u32,
    pub comm: String,
    pub sleep_start_us: u64,
    /// CPU the task was switched out on
    pub source_cpu: u32,
    /// Frames joined with [`FRAME_SEP`], innermost first; empty until the
    /// stack block arrives
    pub sleep_stack: String,
    /// Stack of the task that issued the wakeup, if captured
    pub wakeup_stack: String,
    /// A wakeup event was matched to this episode
    pub woken: bool,
    /// When the task was marked runnable (valid only if `woken`)
    pub wakeup_us: u64,
    /// When the task was switched back in (set at close)
    pub slept_until_us: u64,
    /// Switched back in on a different CPU than it left (set at close)
    pub changed_cpu: bool,
}

impl SleepEpisode {
    fn open(ev: &SwitchEvent, rec: &TraceRecord) -> Self {
        Self {
            pid: ev.prev_pid,
            comm: ev.prev_comm.clone(),
            sleep_start_us: rec.timestamp_us,
            source_cpu: rec.cpu,
            sleep_stack: String::new(),
            wakeup_stack: String::new(),
            woken: false,
            wakeup_us: 0,
            slept_until_us: 0,
            changed_cpu: false,
        }
    }

    /// Off-CPU duration in seconds; zero until the episode is closed
    pub fn sleep_secs(&self) -> f64 {
        self.slept_until_us.saturating_sub(self.sleep_start_us) as f64 / 1_000_000.0
    }

    /// Runnable-to-running gap in seconds, if a wakeup was observed
    pub fn wake_latency_secs(&self) -> Option<f64> {
        if !self.woken {
            return None;
        }
        Some(self.slept_until_us.saturating_sub(self.wakeup_us) as f64 / 1_000_000.0)
    }
}

/// Which stack field of the target episode receives frames
#[derive(Debug, Clone, Copy, PartialEq)]
enum StackKind {
    Sleep,
    Wake,
}

/// Drop counters for diagnostics; reported at flush, never in the summary
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrelatorCounters {
    /// Continuation lines that arrived with no armed target
    pub dropped_frames: u64,
    /// Episodes discarded without aggregation (missed wakeups, reopened
    /// subjects)
    pub discarded_episodes: u64,
}

/// The correlation state machine
///
/// Feed it record lines via [`on_record`](Self::on_record) and stack
/// continuation frames via [`on_stack_frame`](Self::on_stack_frame), in
/// stream order. Each switch-in that closes an episode returns it,
/// finalized, for aggregation.
#[derive(Debug)]
pub struct Correlator {
    classifier: SchedClassifier,
    /// Live episodes keyed by sleeper pid
    episodes: FnvHashMap<u32, SleepEpisode>,
    /// Waker pid → sleeper pid awaiting a wakeup stack
    wake_by_waker: FnvHashMap<u32, u32>,
    /// Episode (and stack field) currently receiving continuation frames
    target: Option<(u32, StackKind)>,
    /// Also correlate sched_wakeup events
    track_wakeups: bool,
    /// Only open episodes for comms containing this substring
    name_filter: Option<String>,
    counters: CorrelatorCounters,
}

impl Correlator {
    pub fn new(track_wakeups: bool, name_filter: Option<String>) -> Self {
        Self {
            classifier: SchedClassifier::new(),
            episodes: FnvHashMap::default(),
            wake_by_waker: FnvHashMap::default(),
            target: None,
            track_wakeups,
            name_filter,
            counters: CorrelatorCounters::default(),
        }
    }

    /// Process one record line. Returns the episode closed by this record,
    /// if it closed one.
    pub fn on_record(&mut self, rec: &TraceRecord) -> Option<SleepEpisode> {
        // Any record line ends the current continuation block.
        self.target = None;

        if rec.is_stack_sentinel() {
            self.arm_stack_target(rec);
            return None;
        }
        if let Some(ev) = self.classifier.classify_switch(&rec.payload) {
            return self.on_switch(&ev, rec);
        }
        if self.track_wakeups {
            if let Some(ev) = self.classifier.classify_wakeup(&rec.payload) {
                self.on_wakeup(&ev, rec);
            }
        }
        None
    }

    /// Append one continuation frame to the armed episode. Frames with no
    /// armed target are dropped.
    pub fn on_stack_frame(&mut self, frame: &str) {
        let Some((pid, kind)) = self.target else {
            self.counters.dropped_frames += 1;
            return;
        };
        let Some(ep) = self.episodes.get_mut(&pid) else {
            self.target = None;
            self.counters.dropped_frames += 1;
            return;
        };
        let stack = match kind {
            StackKind::Sleep => &mut ep.sleep_stack,
            StackKind::Wake => &mut ep.wakeup_stack,
        };
        if !stack.is_empty() {
            stack.push(FRAME_SEP);
        }
        stack.push_str(frame);
    }

    /// Discard all in-flight state. Called at window boundaries so no
    /// episode spans two reporting windows.
    pub fn flush(&mut self) {
        self.episodes.clear();
        self.wake_by_waker.clear();
        self.target = None;
    }

    pub fn counters(&self) -> CorrelatorCounters {
        self.counters
    }

    /// Number of tasks currently tracked off-CPU
    pub fn in_flight(&self) -> usize {
        self.episodes.len()
    }

    fn on_switch(&mut self, ev: &SwitchEvent, rec: &TraceRecord) -> Option<SleepEpisode> {
        let closed = self.episodes.remove(&ev.next_pid).map(|mut ep| {
            ep.slept_until_us = rec.timestamp_us;
            ep.changed_cpu = ep.source_cpu != rec.cpu;
            ep
        });

        if ev.prev_pid != IDLE_PID && self.name_matches(&ev.prev_comm) {
            let opened = SleepEpisode::open(ev, rec);
            // A leftover entry here means we never saw this task switch
            // back in; the stale episode is unusable.
            if self.episodes.insert(ev.prev_pid, opened).is_some() {
                self.counters.discarded_episodes += 1;
            }
        }
        closed
    }

    fn on_wakeup(&mut self, ev: &WakeupEvent, rec: &TraceRecord) {
        let Some(ep) = self.episodes.get_mut(&ev.pid) else {
            return;
        };
        if ep.woken {
            return;
        }
        ep.woken = true;
        ep.wakeup_us = rec.timestamp_us;
        // The wakeup stack that follows is dumped under the waker's pid.
        self.wake_by_waker.insert(rec.pid, ev.pid);
    }

    fn arm_stack_target(&mut self, rec: &TraceRecord) {
        if let Some(ep) = self.episodes.get(&rec.pid) {
            if ep.sleep_stack.is_empty() {
                self.target = Some((rec.pid, StackKind::Sleep));
            } else {
                // A second stack block before the episode closed means we
                // missed its switch-in entirely. The episode can no longer
                // be charged anywhere trustworthy.
                self.episodes.remove(&rec.pid);
                self.counters.discarded_episodes += 1;
            }
            return;
        }
        if let Some(sleeper) = self.wake_by_waker.remove(&rec.pid) {
            let awaiting = self
                .episodes
                .get(&sleeper)
                .map(|ep| ep.woken && ep.wakeup_stack.is_empty())
                .unwrap_or(false);
            if awaiting {
                self.target = Some((sleeper, StackKind::Wake));
            }
        }
    }

    fn name_matches(&self, comm: &str) -> bool {
        self.name_filter
            .as_deref()
            .map_or(true, |needle| comm.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, comm: &str, cpu: u32, timestamp_us: u64, payload: &str) -> TraceRecord {
        TraceRecord {
            comm: comm.to_string(),
            pid,
            cpu,
            timestamp_us,
            payload: payload.to_string(),
        }
    }

    fn switch_payload(prev: (&str, u32), next: (&str, u32)) -> String {
        format!(
            "sched_switch: prev_comm={} prev_pid={} prev_prio=120 prev_state=D ==> next_comm={} next_pid={} next_prio=120",
            prev.0, prev.1, next.0, next.1
        )
    }

    fn wakeup_payload(comm: &str, pid: u32, cpu: u32) -> String {
        format!(
            "sched_wakeup: comm={} pid={} prio=120 target_cpu={:03}",
            comm, pid, cpu
        )
    }

    #[test]
    fn test_episode_with_stack_and_cpu_change() {
        let mut c = Correlator::new(false, None);

        let out = record(5, "dd", 0, 0, &switch_payload(("dd", 5), ("swapper/0", 0)));
        assert!(c.on_record(&out).is_none());
        assert!(c
            .on_record(&record(5, "dd", 0, 0, "<stack trace>"))
            .is_none());
        c.on_stack_frame("a");
        c.on_stack_frame("b");

        let back = record(
            7,
            "bash",
            1,
            3_000_000,
            &switch_payload(("bash", 7), ("dd", 5)),
        );
        let ep = c.on_record(&back).expect("switch-in closes the episode");
        assert_eq!(ep.pid, 5);
        assert_eq!(ep.comm, "dd");
        assert_eq!(ep.sleep_stack, "a:b");
        assert!((ep.sleep_secs() - 3.0).abs() < 1e-9);
        assert!(ep.changed_cpu);
        assert!(!ep.woken);
    }

    #[test]
    fn test_same_cpu_switch_in_is_not_a_change() {
        let mut c = Correlator::new(false, None);
        c.on_record(&record(5, "dd", 2, 0, &switch_payload(("dd", 5), ("x", 9))));
        let ep = c
            .on_record(&record(9, "x", 2, 1_000, &switch_payload(("x", 9), ("dd", 5))))
            .unwrap();
        assert!(!ep.changed_cpu);
    }

    #[test]
    fn test_wakeup_latency_and_wake_stack() {
        let mut c = Correlator::new(true, None);

        c.on_record(&record(
            5,
            "dd",
            0,
            1_000_000,
            &switch_payload(("dd", 5), ("swapper/0", 0)),
        ));
        c.on_record(&record(5, "dd", 0, 1_000_000, "<stack trace>"));
        c.on_stack_frame("io_schedule");

        // Wakeup issued by pid 30 on another cpu, followed by its stack.
        c.on_record(&record(30, "kworker/1:1", 1, 1_200_000, &wakeup_payload("dd", 5, 1)));
        c.on_record(&record(30, "kworker/1:1", 1, 1_200_000, "<stack trace>"));
        c.on_stack_frame("wake_up_process");
        c.on_stack_frame("end_bio");

        let ep = c
            .on_record(&record(
                0,
                "swapper/1",
                1,
                1_500_000,
                &switch_payload(("swapper/1", 0), ("dd", 5)),
            ))
            .unwrap();
        assert!(ep.woken);
        assert_eq!(ep.sleep_stack, "io_schedule");
        assert_eq!(ep.wakeup_stack, "wake_up_process:end_bio");
        assert!((ep.wake_latency_secs().unwrap() - 0.3).abs() < 1e-9);
        assert!((ep.sleep_secs() - 0.5).abs() < 1e-9);
        assert!(ep.changed_cpu);
    }

    #[test]
    fn test_wakeups_ignored_when_not_tracked() {
        let mut c = Correlator::new(false, None);
        c.on_record(&record(5, "dd", 0, 0, &switch_payload(("dd", 5), ("x", 9))));
        c.on_record(&record(30, "k", 1, 100, &wakeup_payload("dd", 5, 1)));
        let ep = c
            .on_record(&record(9, "x", 0, 200, &switch_payload(("x", 9), ("dd", 5))))
            .unwrap();
        assert!(!ep.woken);
        assert!(ep.wake_latency_secs().is_none());
    }

    #[test]
    fn test_missed_wakeup_discards_stale_episode() {
        let mut c = Correlator::new(false, None);

        c.on_record(&record(5, "dd", 0, 0, &switch_payload(("dd", 5), ("x", 9))));
        c.on_record(&record(5, "dd", 0, 0, "<stack trace>"));
        c.on_stack_frame("first_stack");

        // Second stack block for pid 5 without an intervening switch-in.
        c.on_record(&record(5, "dd", 0, 500, "<stack trace>"));
        assert_eq!(c.counters().discarded_episodes, 1);
        assert_eq!(c.in_flight(), 0);

        // Frames after the discard have nowhere to go.
        c.on_stack_frame("second_stack");
        assert_eq!(c.counters().dropped_frames, 1);

        // And a later switch-in must not resurrect it.
        assert!(c
            .on_record(&record(9, "x", 0, 1_000, &switch_payload(("x", 9), ("dd", 5))))
            .is_none());
    }

    #[test]
    fn test_idle_pid_never_tracked() {
        let mut c = Correlator::new(false, None);
        c.on_record(&record(
            0,
            "swapper/0",
            0,
            0,
            &switch_payload(("swapper/0", 0), ("dd", 5)),
        ));
        assert_eq!(c.in_flight(), 0);
        assert!(c
            .on_record(&record(5, "dd", 0, 100, &switch_payload(("dd", 5), ("swapper/0", 0))))
            .is_none());
        // the dd episode opened fine
        assert_eq!(c.in_flight(), 1);
    }

    #[test]
    fn test_orphan_frames_are_dropped() {
        let mut c = Correlator::new(false, None);
        c.on_stack_frame("nowhere");
        c.on_stack_frame("to_go");
        assert_eq!(c.counters().dropped_frames, 2);
    }

    #[test]
    fn test_record_line_resets_continuation_target() {
        let mut c = Correlator::new(false, None);
        c.on_record(&record(5, "dd", 0, 0, &switch_payload(("dd", 5), ("x", 9))));
        c.on_record(&record(5, "dd", 0, 0, "<stack trace>"));
        c.on_stack_frame("a");
        // An unrelated record line closes the block...
        c.on_record(&record(40, "irq/foo", 3, 10, "softirq_entry: vec=9"));
        // ...so later frames no longer attach.
        c.on_stack_frame("b");
        let ep = c
            .on_record(&record(9, "x", 0, 100, &switch_payload(("x", 9), ("dd", 5))))
            .unwrap();
        assert_eq!(ep.sleep_stack, "a");
        assert_eq!(c.counters().dropped_frames, 1);
    }

    #[test]
    fn test_name_filter_gates_opening_not_closing() {
        let mut c = Correlator::new(false, Some("rsync".to_string()));

        // bash does not match: no episode opened.
        c.on_record(&record(7, "bash", 0, 0, &switch_payload(("bash", 7), ("x", 9))));
        assert_eq!(c.in_flight(), 0);

        // rsync matches by substring.
        c.on_record(&record(8, "rsync-worker", 0, 0, &switch_payload(("rsync-worker", 8), ("x", 9))));
        assert_eq!(c.in_flight(), 1);

        // Closing is not filtered.
        let ep = c
            .on_record(&record(
                9,
                "x",
                0,
                100,
                &switch_payload(("x", 9), ("rsync-worker", 8)),
            ))
            .unwrap();
        assert_eq!(ep.pid, 8);
    }

    #[test]
    fn test_reopened_subject_counts_discard() {
        let mut c = Correlator::new(false, None);
        c.on_record(&record(5, "dd", 0, 0, &switch_payload(("dd", 5), ("x", 9))));
        // Same pid switches out again without us seeing it come back.
        c.on_record(&record(5, "dd", 1, 900, &switch_payload(("dd", 5), ("y", 10))));
        assert_eq!(c.counters().discarded_episodes, 1);
        assert_eq!(c.in_flight(), 1);
    }

    #[test]
    fn test_flush_clears_in_flight_state() {
        let mut c = Correlator::new(true, None);
        c.on_record(&record(5, "dd", 0, 0, &switch_payload(("dd", 5), ("x", 9))));
        c.on_record(&record(30, "k", 1, 10, &wakeup_payload("dd", 5, 1)));
        assert_eq!(c.in_flight(), 1);
        c.flush();
        assert_eq!(c.in_flight(), 0);
        assert!(c
            .on_record(&record(9, "x", 0, 100, &switch_payload(("x", 9), ("dd", 5))))
            .is_none());
    }
}
