//! Scheduler event classification
//!
//! Decodes the `sched_switch` and `sched_wakeup` payloads out of a record
//! line, e.g.:
//!
//! ```text
//! sched_switch: prev_comm=umount prev_pid=7868 prev_prio=120 prev_state=D ==> next_comm=swapper/0 next_pid=0 next_prio=120
//! sched_wakeup: comm=umount pid=7868 prio=120 target_cpu=002
//! ```
//!
//! Most payloads in a live stream are neither; classification returns
//! `None` for those and the caller drops them.

use regex::Regex;

/// A CPU handing off from one task to another
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchEvent {
    pub prev_comm: String,
    pub prev_pid: u32,
    pub next_comm: String,
    pub next_pid: u32,
}

/// A sleeping task being marked runnable, ahead of its actual switch-in
#[derive(Debug, Clone, PartialEq)]
pub struct WakeupEvent {
    pub comm: String,
    pub pid: u32,
    pub target_cpu: u32,
}

/// Classifier for scheduler payloads. Owns its compiled patterns.
#[derive(Debug)]
pub struct SchedClassifier {
    switch_re: Regex,
    wakeup_re: Regex,
}

impl Default for SchedClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedClassifier {
    pub fn new() -> Self {
        Self {
            switch_re: Regex::new(
                r"sched_switch: prev_comm=(.+) prev_pid=(\d+) .* ==> next_comm=(.+) next_pid=(\d+)",
            )
            .expect("switch pattern is valid"),
            // `success=` only appears on older kernels
            wakeup_re: Regex::new(
                r"sched_wakeup: comm=(.+) pid=(\d+) prio=\d+(?: success=\d+)? target_cpu=(\d+)",
            )
            .expect("wakeup pattern is valid"),
        }
    }

    pub fn classify_switch(&self, payload: &str) -> Option<SwitchEvent> {
        let caps = self.switch_re.captures(payload)?;
        Some(SwitchEvent {
            prev_comm: caps[1].to_string(),
            prev_pid: caps[2].parse().ok()?,
            next_comm: caps[3].to_string(),
            next_pid: caps[4].parse().ok()?,
        })
    }

    pub fn classify_wakeup(&self, payload: &str) -> Option<WakeupEvent> {
        let caps = self.wakeup_re.captures(payload)?;
        Some(WakeupEvent {
            comm: caps[1].to_string(),
            pid: caps[2].parse().ok()?,
            target_cpu: caps[3].parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWITCH: &str = "sched_switch: prev_comm=umount prev_pid=7868 prev_prio=120 prev_state=D ==> next_comm=swapper/0 next_pid=0 next_prio=120";

    #[test]
    fn test_classifies_switch() {
        let c = SchedClassifier::new();
        let ev = c.classify_switch(SWITCH).unwrap();
        assert_eq!(ev.prev_comm, "umount");
        assert_eq!(ev.prev_pid, 7868);
        assert_eq!(ev.next_comm, "swapper/0");
        assert_eq!(ev.next_pid, 0);
    }

    #[test]
    fn test_classifies_wakeup_modern_format() {
        let c = SchedClassifier::new();
        let ev = c
            .classify_wakeup("sched_wakeup: comm=umount pid=7868 prio=120 target_cpu=002")
            .unwrap();
        assert_eq!(ev.comm, "umount");
        assert_eq!(ev.pid, 7868);
        assert_eq!(ev.target_cpu, 2);
    }

    #[test]
    fn test_classifies_wakeup_legacy_success_field() {
        let c = SchedClassifier::new();
        let ev = c
            .classify_wakeup("sched_wakeup: comm=rcu_sched pid=11 prio=120 success=1 target_cpu=001")
            .unwrap();
        assert_eq!(ev.pid, 11);
        assert_eq!(ev.target_cpu, 1);
    }

    #[test]
    fn test_switch_rejects_other_payloads() {
        let c = SchedClassifier::new();
        assert!(c.classify_switch("sys_exit: NR 13 = 0").is_none());
        assert!(c
            .classify_switch("sched_wakeup: comm=x pid=1 prio=120 target_cpu=000")
            .is_none());
        assert!(c.classify_switch("<stack trace>").is_none());
    }

    #[test]
    fn test_wakeup_rejects_switch_payload() {
        let c = SchedClassifier::new();
        assert!(c.classify_wakeup(SWITCH).is_none());
    }

    #[test]
    fn test_comm_with_spaces_survives() {
        let c = SchedClassifier::new();
        let ev = c
            .classify_switch("sched_switch: prev_comm=Web Content prev_pid=901 prev_prio=120 prev_state=S ==> next_comm=swapper/1 next_pid=0 next_prio=120")
            .unwrap();
        assert_eq!(ev.prev_comm, "Web Content");
    }
}
