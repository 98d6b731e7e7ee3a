//! Syscall latency ranking from enter/exit pairs
//!
//! The structurally simple sibling of the sleep correlator: pair each
//! task's `sys_enter` with its `sys_exit`, charge the gap to the syscall,
//! and rank by total latency. Two payload flavors exist, raw
//! (`sys_enter: NR 0 (...)` / `sys_exit: NR 0 = 0`) and symbolic
//! (`sys_read(...)` / `sys_read -> 0x0`); both are handled. No interval
//! merging and no stacks here.

use std::collections::HashMap;
use std::io::{self, Write};

use fnv::FnvHashMap;
use regex::Regex;

use crate::syscalls;
use crate::traceline::TraceRecord;

/// One in-flight syscall for a task
#[derive(Debug, Clone)]
struct PendingCall {
    name: String,
    /// Set for the raw format; exit matching goes by number then
    nr: Option<i64>,
    enter_us: u64,
}

/// Accumulated latency figures for one syscall
#[derive(Debug, Clone, Default)]
pub struct CallStats {
    pub count: u64,
    pub errors: u64,
    pub total_us: u64,
    pub min_us: u64,
    pub max_us: u64,
}

impl CallStats {
    fn record(&mut self, duration_us: u64, failed: bool) {
        if self.count == 0 {
            self.min_us = duration_us;
            self.max_us = duration_us;
        } else {
            self.min_us = self.min_us.min(duration_us);
            self.max_us = self.max_us.max(duration_us);
        }
        self.count += 1;
        self.total_us += duration_us;
        if failed {
            self.errors += 1;
        }
    }

    pub fn avg_secs(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_us as f64 / self.count as f64 / 1_000_000.0
    }
}

/// Pairs enters with exits per task and aggregates per syscall
#[derive(Debug)]
pub struct SyscallAnalyzer {
    enter_raw_re: Regex,
    enter_sym_re: Regex,
    exit_raw_re: Regex,
    exit_sym_re: Regex,
    pending: FnvHashMap<u32, PendingCall>,
    stats: HashMap<String, CallStats>,
    mismatched_exits: u64,
}

impl Default for SyscallAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallAnalyzer {
    pub fn new() -> Self {
        Self {
            enter_raw_re: Regex::new(r"^sys_enter: NR (\d+) \((.*)\)")
                .expect("raw enter pattern is valid"),
            enter_sym_re: Regex::new(r"^(sys_\w+)\((.*)\)").expect("enter pattern is valid"),
            exit_raw_re: Regex::new(r"^sys_exit: NR (-?\d+) = (-?\d+)")
                .expect("raw exit pattern is valid"),
            exit_sym_re: Regex::new(r"^(sys_\w+) -> 0x([0-9a-fA-F]+)")
                .expect("exit pattern is valid"),
            pending: FnvHashMap::default(),
            stats: HashMap::new(),
            mismatched_exits: 0,
        }
    }

    /// Process one record; non-syscall payloads are ignored
    pub fn feed(&mut self, rec: &TraceRecord) {
        if !rec.payload.contains("sys_") {
            return;
        }
        if let Some(pending) = self.classify_enter(&rec.payload, rec.timestamp_us) {
            // A second enter without an exit replaces the stale one.
            self.pending.insert(rec.pid, pending);
            return;
        }
        if let Some((exit_nr, exit_name, retval)) = self.classify_exit(&rec.payload) {
            let Some(call) = self.pending.remove(&rec.pid) else {
                return;
            };
            if !exit_matches(&call, exit_nr, exit_name.as_deref()) {
                self.mismatched_exits += 1;
                return;
            }
            let duration = rec.timestamp_us.saturating_sub(call.enter_us);
            self.stats
                .entry(call.name)
                .or_default()
                .record(duration, retval < 0);
        }
    }

    /// Exits that arrived with no or with the wrong pending enter
    pub fn mismatched_exits(&self) -> u64 {
        self.mismatched_exits
    }

    pub fn stats(&self) -> &HashMap<String, CallStats> {
        &self.stats
    }

    /// Render the fixed-width ranking table, highest total latency first
    pub fn render(&self, out: &mut impl Write) -> io::Result<()> {
        let mut rows = vec![vec![
            "Call".to_string(),
            "Average lat".to_string(),
            "Min lat".to_string(),
            "Max lat".to_string(),
            "Total lat".to_string(),
            "Calls".to_string(),
            "Errors".to_string(),
        ]];

        let mut entries: Vec<(&String, &CallStats)> = self.stats.iter().collect();
        entries.sort_by(|a, b| b.1.total_us.cmp(&a.1.total_us));
        for (name, stats) in entries {
            rows.push(vec![
                name.clone(),
                format!("{:.6}", stats.avg_secs()),
                format!("{:.6}", stats.min_us as f64 / 1_000_000.0),
                format!("{:.6}", stats.max_us as f64 / 1_000_000.0),
                format!("{:.6}", stats.total_us as f64 / 1_000_000.0),
                format!("{}", stats.count),
                if stats.errors > 0 {
                    stats.errors.to_string()
                } else {
                    String::new()
                },
            ]);
        }

        let width = rows
            .iter()
            .flatten()
            .map(String::len)
            .max()
            .unwrap_or(0)
            + 2;
        for row in rows {
            for cell in row {
                write!(out, "{:<1$}", cell, width)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn classify_enter(&self, payload: &str, timestamp_us: u64) -> Option<PendingCall> {
        if let Some(caps) = self.enter_raw_re.captures(payload) {
            let nr: i64 = caps[1].parse().ok()?;
            return Some(PendingCall {
                name: syscalls::syscall_name(nr),
                nr: Some(nr),
                enter_us: timestamp_us,
            });
        }
        let caps = self.enter_sym_re.captures(payload)?;
        Some(PendingCall {
            name: caps[1].to_string(),
            nr: None,
            enter_us: timestamp_us,
        })
    }

    fn classify_exit(&self, payload: &str) -> Option<(Option<i64>, Option<String>, i64)> {
        if let Some(caps) = self.exit_raw_re.captures(payload) {
            let nr: i64 = caps[1].parse().ok()?;
            let retval: i64 = caps[2].parse().ok()?;
            return Some((Some(nr), None, retval));
        }
        let caps = self.exit_sym_re.captures(payload)?;
        let retval = u64::from_str_radix(&caps[2], 16).ok()? as i64;
        Some((None, Some(caps[1].to_string()), retval))
    }
}

/// rt_sigreturn reports NR -1 on exit; everything else must match its
/// enter exactly.
fn exit_matches(call: &PendingCall, exit_nr: Option<i64>, exit_name: Option<&str>) -> bool {
    match (call.nr, exit_nr, exit_name) {
        (Some(nr), Some(exit_nr), _) => exit_nr == nr || (exit_nr == -1 && nr == 15),
        (None, _, Some(exit_name)) => exit_name == call.name,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, timestamp_us: u64, payload: &str) -> TraceRecord {
        TraceRecord {
            comm: "test".to_string(),
            pid,
            cpu: 0,
            timestamp_us,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_symbolic_enter_exit_pair() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(10, 1_000_000, "sys_write(fd: 1, buf: ..., count: 5)"));
        a.feed(&record(10, 1_000_250, "sys_write -> 0x5"));
        let stats = &a.stats()["sys_write"];
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_us, 250);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_raw_enter_exit_resolves_name() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(10, 100, "sys_enter: NR 0 (3, 7f0000, 4096)"));
        a.feed(&record(10, 600, "sys_exit: NR 0 = 4096"));
        let stats = &a.stats()["read"];
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_us, 500);
    }

    #[test]
    fn test_raw_negative_retval_counts_error() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(10, 100, "sys_enter: NR 2 (deadbeef, 0, 0)"));
        a.feed(&record(10, 200, "sys_exit: NR 2 = -2"));
        assert_eq!(a.stats()["open"].errors, 1);
    }

    #[test]
    fn test_rt_sigreturn_exit_reports_minus_one() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(10, 100, "sys_enter: NR 15 ()"));
        a.feed(&record(10, 180, "sys_exit: NR -1 = 0"));
        let stats = &a.stats()["rt_sigreturn"];
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_us, 80);
        assert_eq!(a.mismatched_exits(), 0);
    }

    #[test]
    fn test_mismatched_exit_dropped() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(10, 100, "sys_enter: NR 0 (3)"));
        a.feed(&record(10, 200, "sys_exit: NR 1 = 0"));
        assert!(a.stats().is_empty());
        assert_eq!(a.mismatched_exits(), 1);
    }

    #[test]
    fn test_exit_without_enter_ignored() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(10, 200, "sys_exit: NR 0 = 0"));
        assert!(a.stats().is_empty());
    }

    #[test]
    fn test_pids_tracked_independently() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(1, 0, "sys_enter: NR 0 (3)"));
        a.feed(&record(2, 50, "sys_enter: NR 1 (4)"));
        a.feed(&record(2, 150, "sys_exit: NR 1 = 8"));
        a.feed(&record(1, 400, "sys_exit: NR 0 = 8"));
        assert_eq!(a.stats()["read"].total_us, 400);
        assert_eq!(a.stats()["write"].total_us, 100);
    }

    #[test]
    fn test_second_enter_replaces_stale_pending() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(1, 0, "sys_enter: NR 0 (3)"));
        a.feed(&record(1, 1_000, "sys_enter: NR 0 (3)"));
        a.feed(&record(1, 1_100, "sys_exit: NR 0 = 0"));
        assert_eq!(a.stats()["read"].count, 1);
        assert_eq!(a.stats()["read"].total_us, 100);
    }

    #[test]
    fn test_min_max_tracking() {
        let mut a = SyscallAnalyzer::new();
        for (enter, exit) in [(0u64, 300u64), (1_000, 1_050), (2_000, 2_800)] {
            a.feed(&record(1, enter, "sys_enter: NR 0 (3)"));
            a.feed(&record(1, exit, "sys_exit: NR 0 = 1"));
        }
        let stats = &a.stats()["read"];
        assert_eq!(stats.min_us, 50);
        assert_eq!(stats.max_us, 800);
        assert_eq!(stats.count, 3);
    }

    #[test]
    fn test_render_ranks_by_total_latency() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(1, 0, "sys_enter: NR 0 (3)"));
        a.feed(&record(1, 100, "sys_exit: NR 0 = 1"));
        a.feed(&record(1, 200, "sys_enter: NR 1 (4)"));
        a.feed(&record(1, 900, "sys_exit: NR 1 = 1"));

        let mut out = Vec::new();
        a.render(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Call"));
        assert!(text.find("write").unwrap() < text.find("read").unwrap());
    }

    #[test]
    fn test_non_syscall_payloads_ignored() {
        let mut a = SyscallAnalyzer::new();
        a.feed(&record(1, 0, "sched_switch: prev_comm=a prev_pid=1 ..."));
        a.feed(&record(1, 0, "irq_handler_entry: irq=28"));
        assert!(a.stats().is_empty());
    }
}
