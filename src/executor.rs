// (c) Roel Kluin, 2023, GPL v3

use crate::error::{Error, Result};
use serde::Deserialize;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs units of work somewhere else, bounding how many run at once.
pub trait Executor {
    /// Starts `command parameters..`; blocks while all slots are taken.
    fn submit(&mut self, command: &OsStr, parameters: &[OsString]) -> Result<()>;
    /// Blocks until a slot is free, or with `for_all` until nothing runs.
    fn wait(&mut self, for_all: bool) -> Result<()>;
}

/// How many CPUs the local executor may keep busy.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(try_from = "serde_json::Number")]
pub enum CpuLimit {
    /// Leave this many CPUs idle.
    Reserve(usize),
    /// Use at most this fraction of the CPUs, in (0, 1].
    Fraction(f64),
    /// Run at most this many processes.
    MaxProcs(usize),
}

impl CpuLimit {
    /// Concurrent processes allowed on a machine with `cpus` CPUs; at least one.
    pub fn slots(&self, cpus: usize) -> usize {
        let n = match *self {
            CpuLimit::Reserve(n) => cpus.saturating_sub(n),
            CpuLimit::Fraction(f) => (cpus as f64 * f).ceil() as usize,
            CpuLimit::MaxProcs(n) => n,
        };
        n.max(1)
    }
    fn from_int(v: i64) -> std::result::Result<Self, String> {
        match v {
            0 => Err("limit 0 is meaningless".to_string()),
            v if v > 0 => Ok(CpuLimit::Reserve(v as usize)),
            v => Ok(CpuLimit::MaxProcs(v.unsigned_abs() as usize)),
        }
    }
    fn from_fraction(f: f64) -> std::result::Result<Self, String> {
        if f > 0.0 && f <= 1.0 {
            Ok(CpuLimit::Fraction(f))
        } else {
            Err(format!("fraction {} not in (0, 1]", f))
        }
    }
}

impl Default for CpuLimit {
    fn default() -> Self {
        CpuLimit::Fraction(1.0)
    }
}

// Positive integers reserve CPUs, negative ones cap processes, anything
// with a decimal point is a fraction.
impl TryFrom<serde_json::Number> for CpuLimit {
    type Error = String;

    fn try_from(n: serde_json::Number) -> std::result::Result<Self, Self::Error> {
        if let Some(v) = n.as_i64() {
            CpuLimit::from_int(v)
        } else if let Some(v) = n.as_u64() {
            Ok(CpuLimit::Reserve(v as usize))
        } else {
            CpuLimit::from_fraction(n.as_f64().unwrap_or(f64::NAN))
        }
    }
}

impl FromStr for CpuLimit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.contains('.') {
            s.parse::<f64>()
                .map_err(|e| format!("limit {:?}: {}", s, e))
                .and_then(CpuLimit::from_fraction)
        } else {
            s.parse::<i64>()
                .map_err(|e| format!("limit {:?}: {}", s, e))
                .and_then(CpuLimit::from_int)
        }
    }
}

/// Where a child's output goes.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Output {
    #[default]
    Null,
    Inherit,
    File(PathBuf),
}

impl Output {
    fn stdio(&self) -> Result<Stdio> {
        Ok(match self {
            Output::Null => Stdio::null(),
            Output::Inherit => Stdio::inherit(),
            Output::File(path) => Stdio::from(File::create(path)?),
        })
    }
}

/// Runs child processes on this machine.
#[derive(Debug)]
pub struct Local {
    limit: CpuLimit,
    cpus: usize,
    poll: Duration,
    running: Vec<Child>,
    out: Output,
    err: Output,
    failures: usize,
}

impl Local {
    pub fn new(limit: CpuLimit) -> Self {
        Local {
            limit,
            cpus: num_cpus::get(),
            poll: Duration::from_secs(1),
            running: Vec::new(),
            out: Output::Null,
            err: Output::Null,
            failures: 0,
        }
    }
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
    /// Output of the next submitted process only.
    pub fn redirect(&mut self, out: Output, err: Output) {
        self.out = out;
        self.err = err;
    }
    pub fn slots(&self) -> usize {
        self.limit.slots(self.cpus)
    }
    pub fn running(&self) -> usize {
        self.running.len()
    }
    /// Processes that exited unsuccessfully so far.
    pub fn failures(&self) -> usize {
        self.failures
    }

    fn clean_done(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.running.len() {
            match self.running[i].try_wait()? {
                Some(status) => {
                    let child = self.running.swap_remove(i);
                    if status.success() {
                        debug!("Process {} done", child.id());
                    } else {
                        warn!("Process {} failed: {}", child.id(), status);
                        self.failures += 1;
                    }
                }
                None => i += 1,
            }
        }
        Ok(())
    }
}

impl Executor for Local {
    fn submit(&mut self, command: &OsStr, parameters: &[OsString]) -> Result<()> {
        self.wait(false)?;
        let out = std::mem::take(&mut self.out);
        let err = std::mem::take(&mut self.err);
        let child = Command::new(command)
            .args(parameters)
            .stdin(Stdio::null())
            .stdout(out.stdio()?)
            .stderr(err.stdio()?)
            .spawn()
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("cannot start {:?}: {}", command, e),
                ))
            })?;
        debug!("Started process {}: {:?} {:?}", child.id(), command, parameters);
        self.running.push(child);
        Ok(())
    }

    fn wait(&mut self, for_all: bool) -> Result<()> {
        self.clean_done()?;
        let slots = self.slots();
        while self.running.len() >= slots || (for_all && !self.running.is_empty()) {
            sleep(self.poll);
            self.clean_done()?;
        }
        Ok(())
    }
}
