//! Sleep-time aggregation and report rendering
//!
//! Closed episodes land here, charged to one bucket per subject (or one
//! per task name when grouping). Sleep time is charged per call stack into
//! a [`TimeRange`] so overlapping or repeated windows are never counted
//! twice. The renderer ranks buckets by total sleep time and prints the
//! text summary; `--format json` gets a serialized mirror of the same
//! report.

use std::collections::HashMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::correlate::{SleepEpisode, FRAME_SEP};
use crate::timerange::TimeRange;

/// Running wake-latency statistics in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WakeLatency {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    samples: u64,
}

impl WakeLatency {
    pub fn add_sample(&mut self, sample: f64) {
        if self.samples == 0 {
            self.min = sample;
            self.avg = sample;
            self.max = sample;
        } else {
            // Running blend, not an arithmetic mean: recent samples weigh
            // more heavily.
            self.avg = (self.avg + sample) / 2.0;
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Aggregation key: one bucket per task, or per comm when grouping
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SubjectKey {
    Pid(u32),
    Comm(String),
}

/// Accumulated sleep behavior for one subject over a reporting window
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    /// Absent when tasks are grouped by comm
    pub pid: Option<u32>,
    pub comm: String,
    pub sleep_by_stack: HashMap<String, TimeRange>,
    pub wake_stacks: HashMap<String, u64>,
    pub episodes: u64,
    pub cpu_changes: u64,
    pub wake_latency: WakeLatency,
}

impl Bucket {
    pub fn total_sleep_us(&self) -> u64 {
        self.sleep_by_stack.values().map(TimeRange::total_us).sum()
    }

    pub fn total_sleep_secs(&self) -> f64 {
        self.total_sleep_us() as f64 / 1_000_000.0
    }

    fn label(&self) -> String {
        match self.pid {
            Some(pid) => format!("{}-{}", self.comm, pid),
            None => self.comm.clone(),
        }
    }
}

/// Collects closed episodes into buckets and renders the ranked summary
#[derive(Debug)]
pub struct Aggregator {
    buckets: HashMap<SubjectKey, Bucket>,
    group_by_comm: bool,
}

impl Aggregator {
    pub fn new(group_by_comm: bool) -> Self {
        Self {
            buckets: HashMap::new(),
            group_by_comm,
        }
    }

    pub fn add_episode(&mut self, ep: &SleepEpisode) {
        let key = if self.group_by_comm {
            SubjectKey::Comm(ep.comm.clone())
        } else {
            SubjectKey::Pid(ep.pid)
        };
        let pid = (!self.group_by_comm).then_some(ep.pid);
        let bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            pid,
            comm: ep.comm.clone(),
            ..Bucket::default()
        });

        bucket
            .sleep_by_stack
            .entry(ep.sleep_stack.clone())
            .or_default()
            .insert(ep.sleep_start_us, ep.slept_until_us);
        if !ep.wakeup_stack.is_empty() {
            *bucket.wake_stacks.entry(ep.wakeup_stack.clone()).or_insert(0) += 1;
        }
        bucket.episodes += 1;
        if ep.changed_cpu {
            bucket.cpu_changes += 1;
        }
        if let Some(latency) = ep.wake_latency_secs() {
            bucket.wake_latency.add_sample(latency);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop all buckets; the next window starts clean
    pub fn reset(&mut self) {
        self.buckets.clear();
    }

    /// Buckets in descending order of total sleep time. Ties land in
    /// arbitrary order.
    fn ranked(&self) -> Vec<&Bucket> {
        let mut buckets: Vec<&Bucket> = self.buckets.values().collect();
        buckets.sort_by(|a, b| b.total_sleep_us().cmp(&a.total_sleep_us()));
        buckets
    }

    /// Render the ranked text summary for one window
    pub fn render_text(&self, window_secs: f64, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "Total window: {:.6} seconds", window_secs)?;
        for bucket in self.ranked() {
            let sleep = bucket.total_sleep_secs();
            writeln!(
                out,
                "  Process {} slept for {:.6} seconds, {} cpu changes, {} sleeps, {:.2}% of window",
                bucket.label(),
                sleep,
                bucket.cpu_changes,
                bucket.episodes,
                percent(sleep, window_secs),
            )?;
            if bucket.wake_latency.samples() > 0 {
                let lat = bucket.wake_latency;
                writeln!(
                    out,
                    "    Wake latency: min {:.6}s avg {:.6}s max {:.6}s",
                    lat.min, lat.avg, lat.max
                )?;
            }

            let mut stacks: Vec<(&String, &TimeRange)> = bucket.sleep_by_stack.iter().collect();
            stacks.sort_by(|a, b| b.1.total_us().cmp(&a.1.total_us()));
            for (stack, range) in stacks {
                writeln!(
                    out,
                    "    Spent {:.6} seconds here, {:.2}% of sleep time",
                    range.total_secs(),
                    percent(range.total_secs(), sleep),
                )?;
                write_frames(out, stack, "      ")?;
            }

            let mut wake_stacks: Vec<(&String, &u64)> = bucket.wake_stacks.iter().collect();
            wake_stacks.sort_by(|a, b| b.1.cmp(a.1));
            for (stack, count) in wake_stacks {
                writeln!(out, "    Woken {} times from:", count)?;
                write_frames(out, stack, "      ")?;
            }
        }
        Ok(())
    }

    /// Render the same summary as pretty JSON
    pub fn render_json(&self, window_secs: f64, out: &mut impl Write) -> io::Result<()> {
        let report = self.to_report(window_secs);
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(out, "{}", json)
    }

    fn to_report(&self, window_secs: f64) -> JsonReport {
        let buckets = self
            .ranked()
            .into_iter()
            .map(|bucket| {
                let mut stacks: Vec<(&String, &TimeRange)> =
                    bucket.sleep_by_stack.iter().collect();
                stacks.sort_by(|a, b| b.1.total_us().cmp(&a.1.total_us()));
                let mut wake_stacks: Vec<(&String, &u64)> = bucket.wake_stacks.iter().collect();
                wake_stacks.sort_by(|a, b| b.1.cmp(a.1));

                JsonBucket {
                    pid: bucket.pid,
                    comm: bucket.comm.clone(),
                    total_sleep_secs: bucket.total_sleep_secs(),
                    cpu_changes: bucket.cpu_changes,
                    episodes: bucket.episodes,
                    wake_latency: (bucket.wake_latency.samples() > 0).then(|| JsonWakeLatency {
                        min: bucket.wake_latency.min,
                        avg: bucket.wake_latency.avg,
                        max: bucket.wake_latency.max,
                        samples: bucket.wake_latency.samples(),
                    }),
                    stacks: stacks
                        .into_iter()
                        .map(|(stack, range)| JsonStack {
                            frames: split_frames(stack),
                            sleep_secs: range.total_secs(),
                        })
                        .collect(),
                    wake_stacks: wake_stacks
                        .into_iter()
                        .map(|(stack, count)| JsonWakeStack {
                            frames: split_frames(stack),
                            count: *count,
                        })
                        .collect(),
                }
            })
            .collect();
        JsonReport {
            window_secs,
            buckets,
        }
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        0.0
    } else {
        part / whole * 100.0
    }
}

fn split_frames(stack: &str) -> Vec<String> {
    if stack.is_empty() {
        return Vec::new();
    }
    stack.split(FRAME_SEP).map(str::to_string).collect()
}

fn write_frames(out: &mut impl Write, stack: &str, indent: &str) -> io::Result<()> {
    for frame in split_frames(stack) {
        writeln!(out, "{}{}", indent, frame)?;
    }
    Ok(())
}

/// JSON mirror of one window's report
#[derive(Debug, Serialize)]
pub struct JsonReport {
    pub window_secs: f64,
    pub buckets: Vec<JsonBucket>,
}

#[derive(Debug, Serialize)]
pub struct JsonBucket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub comm: String,
    pub total_sleep_secs: f64,
    pub cpu_changes: u64,
    pub episodes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_latency: Option<JsonWakeLatency>,
    pub stacks: Vec<JsonStack>,
    pub wake_stacks: Vec<JsonWakeStack>,
}

#[derive(Debug, Serialize)]
pub struct JsonWakeLatency {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub samples: u64,
}

#[derive(Debug, Serialize)]
pub struct JsonStack {
    pub frames: Vec<String>,
    pub sleep_secs: f64,
}

#[derive(Debug, Serialize)]
pub struct JsonWakeStack {
    pub frames: Vec<String>,
    pub count: u64,
}
