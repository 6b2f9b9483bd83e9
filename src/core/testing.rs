//! Scripted process launcher used by the unit tests.

use crate::core::launcher::{ChildProcess, CommandSpec, ExitInfo, ProcessLauncher};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Behaviour of one scripted launch.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Exits with `code` once `after` has elapsed.
    Exit { code: i32, after: Duration },
    /// Runs until terminated or killed.
    RunUntilTerminated,
    /// Ignores terminate requests; only a kill ends it.
    IgnoreTerminate,
    /// Runs until terminated, but every write to its stdin fails with a broken pipe.
    BrokenPipe,
    /// The binary cannot be launched.
    FailLaunch,
    /// Polling for the exit status fails until the child is killed.
    WaitError,
}

impl Script {
    pub(crate) fn exit_after(code: i32, after: Duration) -> Self {
        Script::Exit { code, after }
    }
}

pub(crate) struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    default: Script,
    launches: Mutex<Vec<CommandSpec>>,
    stdin: Arc<Mutex<Vec<u8>>>,
    killed: Arc<AtomicU32>,
    reaped: Arc<AtomicU32>,
    next_pid: AtomicU32,
}

impl ScriptedLauncher {
    /// Launches follow `scripts` in order, then run until terminated.
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self::with_default(scripts, Script::RunUntilTerminated)
    }

    pub(crate) fn with_default(scripts: Vec<Script>, default: Script) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            default,
            launches: Mutex::new(Vec::new()),
            stdin: Arc::new(Mutex::new(Vec::new())),
            killed: Arc::new(AtomicU32::new(0)),
            reaped: Arc::new(AtomicU32::new(0)),
            next_pid: AtomicU32::new(1000),
        }
    }

    /// Every launch attempt so far, failed ones included.
    pub(crate) fn launches(&self) -> Vec<CommandSpec> {
        self.launches.lock().unwrap().clone()
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub(crate) fn killed_count(&self) -> u32 {
        self.killed.load(Ordering::Acquire)
    }

    /// Children whose exit status was collected with a blocking `wait`.
    pub(crate) fn reaped_count(&self) -> u32 {
        self.reaped.load(Ordering::Acquire)
    }

    /// Everything written to the stdin of any launched child.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.stdin.lock().unwrap().clone()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, command: &CommandSpec) -> io::Result<Box<dyn ChildProcess>> {
        self.launches.lock().unwrap().push(command.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if let Script::FailLaunch = script {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not found", command.program()),
            ));
        }

        Ok(Box::new(FakeChild {
            pid: self.next_pid.fetch_add(1, Ordering::AcqRel),
            broken_pipe: matches!(script, Script::BrokenPipe),
            script,
            started: Instant::now(),
            terminated: false,
            killed: false,
            exit: None,
            stdin: Some(self.stdin.clone()),
            killed_count: self.killed.clone(),
            reaped_count: self.reaped.clone(),
        }))
    }
}

struct FakeChild {
    pid: u32,
    script: Script,
    broken_pipe: bool,
    started: Instant,
    terminated: bool,
    killed: bool,
    exit: Option<ExitInfo>,
    stdin: Option<Arc<Mutex<Vec<u8>>>>,
    killed_count: Arc<AtomicU32>,
    reaped_count: Arc<AtomicU32>,
}

impl FakeChild {
    fn poll(&mut self) -> Option<ExitInfo> {
        if self.exit.is_some() {
            return self.exit;
        }
        let exit = if self.killed {
            Some(ExitInfo::from_signal(SIGKILL))
        } else {
            match self.script {
                Script::Exit { code, after } if self.started.elapsed() >= after => {
                    Some(ExitInfo::from_code(code))
                }
                Script::Exit { .. } | Script::IgnoreTerminate | Script::WaitError => None,
                Script::RunUntilTerminated | Script::BrokenPipe | Script::FailLaunch => {
                    self.terminated.then(|| ExitInfo::from_signal(SIGTERM))
                }
            }
        };
        self.exit = exit;
        exit
    }
}

impl ChildProcess for FakeChild {
    fn id(&self) -> u32 {
        self.pid
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        let sink = self.stdin.take()?;
        Some(Box::new(FakeStdin {
            sink,
            broken: self.broken_pipe,
        }))
    }

    fn take_output(&mut self) -> Option<Box<dyn Read + Send>> {
        Some(Box::new(io::Cursor::new(
            format!("fake process {} starting\n", self.pid).into_bytes(),
        )))
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        if matches!(self.script, Script::WaitError) && !self.killed {
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        Ok(self.poll())
    }

    fn wait(&mut self) -> io::Result<ExitInfo> {
        loop {
            if let Some(exit) = self.poll() {
                self.reaped_count.fetch_add(1, Ordering::AcqRel);
                return Ok(exit);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.terminated = true;
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        if !self.killed {
            self.killed = true;
            self.killed_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

struct FakeStdin {
    sink: Arc<Mutex<Vec<u8>>>,
    broken: bool,
}

impl Write for FakeStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.sink.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
