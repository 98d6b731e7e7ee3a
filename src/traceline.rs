//! Trace line tokenizer for the ftrace text format
//!
//! Two record header shapes show up depending on kernel version:
//!
//! ```text
//!     python2.7-4415  [011] .... 161710.648515: sys_exit: NR 13 = 0
//!     python2.7-4415  [011] 161710.648515: sys_exit: NR 13 = 0
//! ```
//!
//! Newer kernels insert an irq/preempt flags field between the cpu and the
//! timestamp; older ones don't. Both are accepted and the flags are ignored.
//! Everything that is not a record line (stack continuation lines, blank
//! lines, buffer banners) tokenizes to `None` rather than an error.

use regex::Regex;

/// Payload that marks the start of a call-stack dump
pub const STACK_SENTINEL: &str = "<stack trace>";

/// One parsed record line from the trace stream
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    /// Task name; may itself contain dashes and spaces
    pub comm: String,
    pub pid: u32,
    pub cpu: u32,
    /// Trace clock timestamp in microseconds
    pub timestamp_us: u64,
    /// Everything after the `timestamp:` separator
    pub payload: String,
}

impl TraceRecord {
    /// Timestamp in seconds, as printed in the raw stream
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_us as f64 / 1_000_000.0
    }

    /// True when this record announces a call-stack dump
    pub fn is_stack_sentinel(&self) -> bool {
        self.payload == STACK_SENTINEL
    }
}

/// Tokenizer for raw trace lines. Owns its compiled patterns; otherwise
/// stateless.
#[derive(Debug)]
pub struct LineTokenizer {
    record_re: Regex,
    stack_re: Regex,
}

impl Default for LineTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineTokenizer {
    pub fn new() -> Self {
        Self {
            // comm is matched greedily so the rightmost `-pid` wins; the
            // optional 4-5 char field between cpu and timestamp is the
            // kernel-version-dependent flags block.
            record_re: Regex::new(
                r"^\s*(.*)-(\d+)\s+\[(\d+)\]\s+(?:[^\s:]{4,5}\s+)?(\d+)\.(\d+): (.*)$",
            )
            .expect("record pattern is valid"),
            stack_re: Regex::new(r"^\s*=>\s*(\S+)").expect("stack pattern is valid"),
        }
    }

    /// Tokenize one raw line into a [`TraceRecord`].
    ///
    /// Returns `None` for anything that is not a record line; that is the
    /// normal signal for continuation and garbage lines, not a failure.
    pub fn parse_line(&self, raw: &str) -> Option<TraceRecord> {
        let caps = self.record_re.captures(raw)?;
        Some(TraceRecord {
            comm: caps[1].to_string(),
            pid: caps[2].parse().ok()?,
            cpu: caps[3].parse().ok()?,
            timestamp_us: timestamp_us(&caps[4], &caps[5])?,
            payload: caps[6].to_string(),
        })
    }

    /// Extract the frame name from a stack continuation line (` => frame`).
    ///
    /// Offset suffixes (`schedule+0x3a/0x50`) are stripped so the same
    /// sleep site hashes to the same stack signature across kernels.
    pub fn parse_stack_line(&self, raw: &str) -> Option<String> {
        let caps = self.stack_re.captures(raw)?;
        let frame = caps[1].split('+').next().unwrap_or(&caps[1]);
        if frame.is_empty() {
            return None;
        }
        Some(frame.to_string())
    }
}

/// Combine the integral and fractional second captures into microseconds.
fn timestamp_us(secs: &str, frac: &str) -> Option<u64> {
    let whole: u64 = secs.parse().ok()?;
    let digits = frac.len().min(6);
    let frac_val: u64 = frac[..digits].parse().ok()?;
    let micros = frac_val * 10u64.pow((6 - digits) as u32);
    whole.checked_mul(1_000_000)?.checked_add(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_record_with_flags_field() {
        let tok = LineTokenizer::new();
        let rec = tok
            .parse_line("     python2.7-4415  [011] .... 161710.648515: sys_exit: NR 13 = 0")
            .unwrap();
        assert_eq!(rec.comm, "python2.7");
        assert_eq!(rec.pid, 4415);
        assert_eq!(rec.cpu, 11);
        assert_eq!(rec.timestamp_us, 161_710_648_515);
        assert_eq!(rec.payload, "sys_exit: NR 13 = 0");
    }

    #[test]
    fn test_parses_record_without_flags_field() {
        let tok = LineTokenizer::new();
        let rec = tok
            .parse_line("     python2.7-4415  [011] 161710.648515: sys_exit: NR 13 = 0")
            .unwrap();
        assert_eq!(rec.pid, 4415);
        assert_eq!(rec.timestamp_us, 161_710_648_515);
    }

    #[test]
    fn test_comm_with_dashes_keeps_rightmost_pid() {
        let tok = LineTokenizer::new();
        let rec = tok
            .parse_line(" kworker/u8:3-events-142   [002] 99.000001: sched_wakeup: comm=x pid=1 prio=120 target_cpu=000")
            .unwrap();
        assert_eq!(rec.comm, "kworker/u8:3-events");
        assert_eq!(rec.pid, 142);
        assert_eq!(rec.cpu, 2);
    }

    #[test]
    fn test_five_char_flags_field() {
        let tok = LineTokenizer::new();
        let rec = tok
            .parse_line(" cat-77    [000] d..4. 12.500000: sched_switch: prev_comm=cat prev_pid=77 prev_prio=120 prev_state=S ==> next_comm=swapper/0 next_pid=0 next_prio=120")
            .unwrap();
        assert_eq!(rec.pid, 77);
        assert_eq!(rec.timestamp_us, 12_500_000);
    }

    #[test]
    fn test_non_record_lines_return_none() {
        let tok = LineTokenizer::new();
        assert!(tok.parse_line("").is_none());
        assert!(tok.parse_line(" => io_schedule").is_none());
        assert!(tok.parse_line("# tracer: nop").is_none());
        assert!(tok.parse_line("CPU:0 [LOST 1234 EVENTS]").is_none());
    }

    #[test]
    fn test_stack_sentinel_recognized() {
        let tok = LineTokenizer::new();
        let rec = tok
            .parse_line(" umount-7868 [000] 100.000000: <stack trace>")
            .unwrap();
        assert!(rec.is_stack_sentinel());
    }

    #[test]
    fn test_stack_line_extracts_frame() {
        let tok = LineTokenizer::new();
        assert_eq!(tok.parse_stack_line(" => io_schedule").unwrap(), "io_schedule");
        assert_eq!(
            tok.parse_stack_line(" => schedule+0x3a/0x50").unwrap(),
            "schedule"
        );
    }

    #[test]
    fn test_stack_line_rejects_records() {
        let tok = LineTokenizer::new();
        assert!(tok
            .parse_stack_line(" umount-7868 [000] 100.000000: <stack trace>")
            .is_none());
        assert!(tok.parse_stack_line("").is_none());
    }

    #[test]
    fn test_timestamp_sub_second_padding() {
        // ftrace always prints six fractional digits, but don't depend on it
        assert_eq!(timestamp_us("5", "5"), Some(5_500_000));
        assert_eq!(timestamp_us("5", "000001"), Some(5_000_001));
        assert_eq!(timestamp_us("0", "123456789"), Some(123_456));
    }

    #[test]
    fn test_timestamp_secs_round_trip() {
        let tok = LineTokenizer::new();
        let rec = tok
            .parse_line(" a-1 [000] 1.500000: x")
            .unwrap();
        assert!((rec.timestamp_secs() - 1.5).abs() < 1e-9);
    }
}
