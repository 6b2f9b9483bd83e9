use crate::core::environment::Environment;
use log::debug;
use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};

/// Program, arguments and environment overrides of a supervised process.
///
/// Relaunches reuse the same `CommandSpec`, so every attempt runs with
/// identical arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Environment,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Environment::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn set_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A launched child process as seen by its supervisor.
pub trait ChildProcess: Send {
    fn id(&self) -> u32;

    /// Write end of the child's stdin. Yields `Some` at most once.
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Combined stdout + stderr of the child. Yields `Some` at most once.
    fn take_output(&mut self) -> Option<Box<dyn Read + Send>>;

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>>;

    fn wait(&mut self) -> io::Result<ExitInfo>;

    /// Asks the child to exit (SIGTERM where available).
    fn terminate(&mut self) -> io::Result<()>;

    /// Forces the child to exit.
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts processes for a [`ProcessSupervisor`](crate::core::supervisor::ProcessSupervisor).
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, command: &CommandSpec) -> io::Result<Box<dyn ChildProcess>>;
}

/// Launches real OS processes through [`std::process::Command`].
///
/// stdin is piped, stdout and stderr share one pipe so the child's diagnostics
/// arrive in a single ordered stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &CommandSpec) -> io::Result<Box<dyn ChildProcess>> {
        let program = spec.env().resolve_program(spec.program());
        let (output_reader, output_writer) = io::pipe()?;

        let mut command = Command::new(&program);
        command
            .args(spec.get_args())
            .envs(spec.env().resolve(|key| std::env::var_os(key)))
            .stdin(Stdio::piped())
            .stdout(output_writer.try_clone()?)
            .stderr(output_writer);

        debug!("Launching {:?} {:?}", program, spec.get_args());
        let child = command.spawn()?;
        // The command still owns the parent's copies of the output pipe's write end;
        // the reader only sees EOF once they are gone.
        drop(command);

        Ok(Box::new(SystemChild {
            child,
            output: Some(output_reader),
        }))
    }
}

struct SystemChild {
    child: Child,
    output: Option<io::PipeReader>,
}

impl ChildProcess for SystemChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>)
    }

    fn take_output(&mut self) -> Option<Box<dyn Read + Send>> {
        self.output
            .take()
            .map(|output| Box::new(output) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from_status))
    }

    fn wait(&mut self) -> io::Result<ExitInfo> {
        Ok(ExitInfo::from_status(self.child.wait()?))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        // Never signal a reaped pid, it may already belong to someone else.
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let ret = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}
