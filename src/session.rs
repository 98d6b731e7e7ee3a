//! Session driver
//!
//! Owns the read loop and the wiring between tokenizer, correlator, and
//! aggregator. Two modes share the same per-line path: replaying a saved
//! trace file once, or sampling the live `trace_pipe` in repeating
//! reporting windows. The live mode also owns the messy parts: enabling
//! and tearing down the kernel trace facilities (teardown is guaranteed,
//! interrupt included), non-blocking polling of a pipe that may go quiet,
//! and scoping the session to a profiled child command.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};

use crate::aggregate::Aggregator;
use crate::cli::OutputFormat;
use crate::correlate::Correlator;
use crate::ftrace::TraceFs;
use crate::traceline::LineTokenizer;

const SWITCH_EVENT: &str = "sched/sched_switch";
const WAKEUP_EVENT: &str = "sched/sched_wakeup";

/// How long one poll cycle waits for the kernel buffer to fill
const POLL_INTERVAL_MS: u16 = 100;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Correlate sched_wakeup events as well as switches
    pub track_wakeups: bool,
    /// Only open episodes for tasks whose comm contains this
    pub name_filter: Option<String>,
    /// Merge tasks sharing a comm into one bucket
    pub group_by_comm: bool,
    pub format: OutputFormat,
    /// Reporting window for live sessions
    pub window: Duration,
    /// Stop a live session after this long
    pub duration: Option<Duration>,
    /// Copy raw trace lines here while processing
    pub tee: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            track_wakeups: false,
            name_filter: None,
            group_by_comm: false,
            format: OutputFormat::Text,
            window: Duration::from_secs(5),
            duration: None,
            tee: None,
        }
    }
}

/// One processing session: the line path plus its running state
pub struct Session {
    tokenizer: LineTokenizer,
    correlator: Correlator,
    aggregator: Aggregator,
    format: OutputFormat,
    tee: Option<File>,
    first_record_us: Option<u64>,
    last_record_us: u64,
}

impl Session {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let tee = match &config.tee {
            Some(path) => Some(
                File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self {
            tokenizer: LineTokenizer::new(),
            correlator: Correlator::new(config.track_wakeups, config.name_filter.clone()),
            aggregator: Aggregator::new(config.group_by_comm),
            format: config.format,
            tee,
            first_record_us: None,
            last_record_us: 0,
        })
    }

    /// Run one raw line through tee → tokenizer → correlator → aggregator
    pub fn feed_line(&mut self, raw: &str) -> Result<()> {
        if let Some(tee) = self.tee.as_mut() {
            writeln!(tee, "{}", raw).context("failed to write raw trace copy")?;
        }
        if let Some(rec) = self.tokenizer.parse_line(raw) {
            if self.first_record_us.is_none() {
                self.first_record_us = Some(rec.timestamp_us);
            }
            self.last_record_us = self.last_record_us.max(rec.timestamp_us);
            if let Some(episode) = self.correlator.on_record(&rec) {
                self.aggregator.add_episode(&episode);
            }
        } else if let Some(frame) = self.tokenizer.parse_stack_line(raw) {
            self.correlator.on_stack_frame(&frame);
        }
        Ok(())
    }

    /// Trace-clock span covered by the records seen so far, in seconds
    pub fn observed_span_secs(&self) -> f64 {
        match self.first_record_us {
            Some(first) => self.last_record_us.saturating_sub(first) as f64 / 1_000_000.0,
            None => 0.0,
        }
    }

    /// Render the current window's summary
    pub fn render_to(&self, window_secs: f64, out: &mut impl Write) -> Result<()> {
        match self.format {
            OutputFormat::Text => self.aggregator.render_text(window_secs, out)?,
            OutputFormat::Json => self.aggregator.render_json(window_secs, out)?,
        }
        Ok(())
    }

    /// Report the window to stdout and reset every piece of live state, so
    /// no record is ever attributed to two windows.
    pub fn flush_window(&mut self, window_secs: f64) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.render_to(window_secs, &mut out)?;
        out.flush()?;

        let counters = self.correlator.counters();
        debug!(
            in_flight = self.correlator.in_flight(),
            dropped_frames = counters.dropped_frames,
            discarded_episodes = counters.discarded_episodes,
            "window flushed"
        );
        self.correlator.flush();
        self.aggregator.reset();
        self.first_record_us = None;
        self.last_record_us = 0;
        Ok(())
    }
}

/// Replay a saved trace file and report once over the whole span
pub fn replay_file(path: &Path, config: &SessionConfig) -> Result<()> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut session = Session::new(config)?;
    for line in BufReader::new(file).lines() {
        let line = line.context("failed to read trace file")?;
        session.feed_line(&line)?;
    }
    let span = session.observed_span_secs();
    session.flush_window(span)
}

/// Sample the live trace pipe, reporting every window until the exit
/// condition: a fixed run time elapsing, an interrupt, or the profiled
/// child exiting with the pipe drained.
pub fn run_live(
    tracefs: &TraceFs,
    config: &SessionConfig,
    command: Option<Vec<String>>,
) -> Result<()> {
    let stop = interrupt_flag()?;
    let mut session = Session::new(config)?;

    let mut child = match command {
        Some(cmd) => Some(spawn_child(&cmd)?),
        None => None,
    };
    let child_pid = child.as_ref().map(|c| c.id());

    // Facilities stay enabled exactly as long as this guard lives; any
    // early return or interrupt still tears them down.
    let _guard = FacilityGuard::enable(tracefs, config.track_wakeups, child_pid)?;

    let mut pipe = PipeReader::open(&tracefs.trace_pipe_path())?;
    let started = Instant::now();
    let mut window_started = Instant::now();
    let mut child_exited = false;

    loop {
        if stop.load(Ordering::SeqCst) {
            debug!("interrupted, winding down");
            break;
        }
        if let Some(limit) = config.duration {
            if started.elapsed() >= limit {
                break;
            }
        }

        let got_data = pipe.drain(|line| session.feed_line(line))?;

        if let Some(c) = child.as_mut() {
            if !child_exited && c.try_wait().context("failed to poll child")?.is_some() {
                child_exited = true;
                debug!("profiled command exited, draining");
            }
            // The child is gone and the kernel buffer yielded nothing:
            // the stream is done.
            if child_exited && !got_data {
                break;
            }
        }

        if window_started.elapsed() >= config.window {
            session.flush_window(window_started.elapsed().as_secs_f64())?;
            window_started = Instant::now();
        }

        if !got_data {
            pipe.wait_readable(POLL_INTERVAL_MS)?;
        }
    }

    session.flush_window(window_started.elapsed().as_secs_f64())?;

    if let Some(mut c) = child {
        if !child_exited {
            // Session over before the command finished; don't leave it
            // running half-profiled.
            let _ = c.kill();
        }
        let _ = c.wait();
    }
    Ok(())
}

fn spawn_child(cmd: &[String]) -> Result<Child> {
    let (program, args) = cmd
        .split_first()
        .context("command to profile is empty")?;
    Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;
    Ok(stop)
}

/// Enables the trace facilities on construction and disables them all on
/// drop, logging rather than failing if teardown writes bounce.
struct FacilityGuard<'a> {
    tracefs: &'a TraceFs,
    wakeups: bool,
    pid_filtered: bool,
}

impl<'a> FacilityGuard<'a> {
    fn enable(tracefs: &'a TraceFs, wakeups: bool, pid: Option<u32>) -> Result<Self> {
        tracefs.clear_buffer().context("failed to clear trace buffer")?;
        tracefs
            .enable_event(SWITCH_EVENT)
            .context("failed to enable sched_switch")?;
        if wakeups {
            tracefs
                .enable_event(WAKEUP_EVENT)
                .context("failed to enable sched_wakeup")?;
        }
        tracefs
            .enable_stacktrace()
            .context("failed to enable stack traces")?;
        if let Some(pid) = pid {
            tracefs.set_pid_filter(pid);
        }
        tracefs.tracing_on().context("failed to enable tracing")?;
        Ok(Self {
            tracefs,
            wakeups,
            pid_filtered: pid.is_some(),
        })
    }
}

impl Drop for FacilityGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.tracefs.tracing_off() {
            warn!("failed to disable tracing: {}", e);
        }
        if let Err(e) = self.tracefs.disable_event(SWITCH_EVENT) {
            warn!("failed to disable sched_switch: {}", e);
        }
        if self.wakeups {
            if let Err(e) = self.tracefs.disable_event(WAKEUP_EVENT) {
                warn!("failed to disable sched_wakeup: {}", e);
            }
        }
        if let Err(e) = self.tracefs.disable_stacktrace() {
            warn!("failed to disable stack traces: {}", e);
        }
        if self.pid_filtered {
            self.tracefs.clear_pid_filter();
        }
    }
}

/// Non-blocking line reader over the trace pipe. The kernel hands out
/// partial lines at chunk boundaries, so a carry buffer holds the tail
/// until its newline shows up.
struct PipeReader {
    file: File,
    carry: Vec<u8>,
}

impl PipeReader {
    fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        fcntl(&file, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .context("failed to set trace pipe non-blocking")?;
        Ok(Self {
            file,
            carry: Vec::new(),
        })
    }

    /// Read whatever the buffer holds right now, invoking `on_line` for
    /// each complete line. Returns whether any data arrived.
    fn drain(&mut self, mut on_line: impl FnMut(&str) -> Result<()>) -> Result<bool> {
        let mut any = false;
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    any = true;
                    self.carry.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = self.carry.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
                        on_line(&text)?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read trace pipe"),
            }
        }
        Ok(any)
    }

    /// Block up to `timeout_ms` for the pipe to become readable. "No data
    /// yet" is a normal outcome, not end-of-stream.
    fn wait_readable(&self, timeout_ms: u16) -> Result<()> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EINTR) => Ok(()),
            Err(e) => Err(e).context("failed to poll trace pipe"),
        }
    }
}
