//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted tasks that journal what ran, in order
//! - A fake limit monitor speaking the monitor's command-line protocol
//! - A scheduler harness with an event receiver

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::mpsc;

use phasepool::core::{PhaseContext, PhaseFn, PhasedTask, Task};
use phasepool::orchestration::{Scheduler, SchedulerEvent};
use phasepool::{Error, Result};

/// Shared, ordered record of what the tasks did.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// Position of `entry` in the journal; panics when absent.
pub fn position(entries: &[String], entry: &str) -> usize {
    entries
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{} missing from {:?}", entry, entries))
}

fn note(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

/// Shape of a task tree to build.
pub enum Node {
    /// One phase that sleeps for the given milliseconds.
    Leaf(&'static str, u64),
    /// Two phases: spawn the children, then collect them.
    Fan(&'static str, Vec<Node>),
    /// No phases at all.
    Empty,
    /// Spawns leaves, then fails in phase 0.
    Faulty(&'static str, Fault),
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Error,
    Panic,
}

impl Node {
    pub fn build(self, journal: &Journal) -> Box<dyn Task> {
        match self {
            Node::Leaf(name, ms) => Box::new(Leaf {
                name,
                ms,
                journal: Arc::clone(journal),
            }),
            Node::Fan(name, children) => Box::new(Fan::new(name, children, journal)),
            Node::Empty => Box::new(Hollow),
            Node::Faulty(name, fault) => Box::new(Faulty {
                name,
                fault,
                journal: Arc::clone(journal),
            }),
        }
    }
}

pub struct Leaf {
    name: &'static str,
    ms: u64,
    journal: Journal,
}

impl Leaf {
    fn run<'a>(&'a mut self, _ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(self.ms)).await;
            note(&self.journal, self.name.to_string());
            Ok(())
        })
    }
}

impl PhasedTask for Leaf {
    const PHASES: &'static [PhaseFn<Self>] = &[Leaf::run];

    fn label(&self) -> String {
        self.name.to_string()
    }
}

pub struct Fan {
    name: &'static str,
    journal: Journal,
    pending: Vec<Node>,
    /// Child labels in the order they were collected.
    pub collected: Vec<String>,
    pub failed_children: usize,
}

impl Fan {
    pub fn new(name: &'static str, children: Vec<Node>, journal: &Journal) -> Self {
        Self {
            name,
            journal: Arc::clone(journal),
            pending: children,
            collected: Vec::new(),
            failed_children: 0,
        }
    }

    fn spawn<'a>(&'a mut self, ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            note(&self.journal, format!("{}:0", self.name));
            for child in std::mem::take(&mut self.pending) {
                ctx.spawn_boxed(child.build(&self.journal));
            }
            Ok(())
        })
    }

    fn collect<'a>(&'a mut self, ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            note(&self.journal, format!("{}:1", self.name));
            for result in ctx.results() {
                self.collected.push(result.label.clone());
                if result.is_failed() {
                    self.failed_children += 1;
                }
            }
            Ok(())
        })
    }
}

impl PhasedTask for Fan {
    const PHASES: &'static [PhaseFn<Self>] = &[Fan::spawn, Fan::collect];

    fn label(&self) -> String {
        self.name.to_string()
    }
}

pub struct Hollow;

impl PhasedTask for Hollow {
    const PHASES: &'static [PhaseFn<Self>] = &[];

    fn label(&self) -> String {
        "hollow".to_string()
    }
}

pub struct Faulty {
    name: &'static str,
    fault: Fault,
    journal: Journal,
}

impl Faulty {
    fn explode<'a>(&'a mut self, ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            note(&self.journal, format!("{}:0", self.name));
            ctx.spawn(Leaf {
                name: "orphan",
                ms: 0,
                journal: Arc::clone(&self.journal),
            });
            match self.fault {
                Fault::Error => Err(Error::Config(format!("{} refused", self.name))),
                Fault::Panic => panic!("{} exploded", self.name),
            }
        })
    }

    fn unreachable<'a>(&'a mut self, _ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            note(&self.journal, format!("{}:1", self.name));
            Ok(())
        })
    }
}

impl PhasedTask for Faulty {
    const PHASES: &'static [PhaseFn<Self>] = &[Faulty::explode, Faulty::unreachable];

    fn label(&self) -> String {
        self.name.to_string()
    }
}

/// Three phases that record their own indices.
pub struct Steps {
    pub ran: Vec<usize>,
}

impl Steps {
    fn record<'a>(&'a mut self, ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ran.push(ctx.phase());
            Ok(())
        })
    }
}

impl PhasedTask for Steps {
    const PHASES: &'static [PhaseFn<Self>] = &[Steps::record, Steps::record, Steps::record];

    fn label(&self) -> String {
        "steps".to_string()
    }
}

/// Measures how many gauges run at the same time.
pub struct Gauge {
    pub current: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub ms: u64,
}

impl Gauge {
    fn run<'a>(&'a mut self, _ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl PhasedTask for Gauge {
    const PHASES: &'static [PhaseFn<Self>] = &[Gauge::run];

    fn label(&self) -> String {
        "gauge".to_string()
    }
}

/// Scheduler plus the receiving end of its event channel.
pub struct SchedulerHarness {
    pub scheduler: Scheduler,
    pub event_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl SchedulerHarness {
    pub fn new(pool_size: usize) -> Self {
        let (tx, event_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(pool_size).unwrap().with_events(tx);
        Self {
            scheduler,
            event_rx,
        }
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Stand-in for the limit monitor.
///
/// Understands `-t`, `-m`, `--no-info-on-success` and `--`. A memory limit
/// below 1024 kB kills the command after a moment and reports `MEM`; a
/// time limit kills it after `-t` seconds and reports `TIMEOUT`.
const FAKE_MONITOR: &str = r#"#!/bin/sh
t=""
m=""
while [ $# -gt 0 ]; do
  case "$1" in
    -t) t="$2"; shift 2 ;;
    -m) m="$2"; shift 2 ;;
    --no-info-on-success) shift ;;
    --) shift; break ;;
    *) break ;;
  esac
done
exec 3<&0
"$@" <&3 3<&- &
pid=$!
exec 3<&-
if [ -n "$m" ] && [ "$m" -lt 1024 ]; then
  sleep 0.3
  kill -9 $pid 2>/dev/null
  wait $pid 2>/dev/null
  echo "MEM CPU 0.01 MEM $m MAXMEM $m STALE 0.00" >&2
  exit 1
fi
if [ -n "$t" ]; then
  ( sleep "$t"; kill -9 $pid ) >/dev/null 2>&1 &
  watcher=$!
  wait $pid
  status=$?
  kill $watcher 2>/dev/null
  if [ $status -eq 137 ]; then
    echo "TIMEOUT CPU $t.00 MEM 100 MAXMEM 200 STALE 0.00" >&2
    exit 1
  fi
  exit $status
fi
wait $pid
"#;

/// A monitor that ignores its limits and just runs the command.
const LAX_MONITOR: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "--" ]; then shift; break; fi
  shift
done
exec "$@"
"#;

/// A monitor that ignores its limits and keeps running as the parent of
/// the command.
const FORKING_MONITOR: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "--" ]; then shift; break; fi
  shift
done
"$@"
status=$?
exit $status
"#;

/// Temp directory holding monitor scripts and task temp files.
pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn fake_monitor(&self) -> PathBuf {
        self.script("monitor.sh", FAKE_MONITOR)
    }

    pub fn lax_monitor(&self) -> PathBuf {
        self.script("lax-monitor.sh", LAX_MONITOR)
    }

    pub fn forking_monitor(&self) -> PathBuf {
        self.script("forking-monitor.sh", FORKING_MONITOR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.path().join("temp")
    }

    /// Write an executable script into the sandbox.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join(name);
        std::fs::write(&path, body).expect("Failed to write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod script");
        wait_until_executable(&path);
        path
    }
}

/// A freshly written script can briefly fail with ETXTBSY while another
/// test thread forks; retry until it runs.
fn wait_until_executable(path: &Path) {
    for _ in 0..100 {
        match std::process::Command::new(path).arg("--").arg("true").status() {
            Ok(_) => return,
            Err(e) if e.raw_os_error() == Some(26) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("cannot run {}: {}", path.display(), e),
        }
    }
    panic!("{} stayed busy", path.display());
}
