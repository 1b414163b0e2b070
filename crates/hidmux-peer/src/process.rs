//! Child processes started on behalf of the peer.

use std::collections::BTreeMap;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use hidmux_frame::{lock, Signal};
use tracing::{debug, info, warn};

use crate::channel::{ExitNotifier, ProcessChannel, ProcessChannelConfig};
use crate::error::Result;
use crate::method::MethodContext;

/// Channel IDs bound to a process's stdio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioChannels {
    pub stdin: u32,
    pub stdout: u32,
    pub stderr: u32,
}

/// A child process being tracked until it is reaped.
#[derive(Debug)]
pub struct TrackedProcess {
    pub pid: u32,
    pub program: String,
    child: Child,
    pub channels: Option<StdioChannels>,
    exit: Option<ExitNotifier>,
}

/// All tracked processes, under one lock.
#[derive(Debug)]
pub struct ProcessTable {
    processes: Mutex<BTreeMap<u32, TrackedProcess>>,
    wake: Arc<Signal>,
}

impl ProcessTable {
    /// `wake` is raised when a process with channels reaches EOF on all of
    /// its output.
    pub fn new(wake: Arc<Signal>) -> Self {
        Self {
            processes: Mutex::new(BTreeMap::new()),
            wake,
        }
    }

    /// Start `program` with whitespace-separated `args`.
    ///
    /// With `use_channels`, stdin/stdout/stderr are piped into process
    /// channels which are registered with the transport and announced.
    pub fn spawn(
        &self,
        ctx: &MethodContext<'_>,
        program: &str,
        args: &str,
        use_channels: bool,
    ) -> Result<(u32, Option<StdioChannels>)> {
        let mut command = Command::new(program);
        command.args(args.split_whitespace());
        if use_channels {
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        } else {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        let (channels, exit) = if use_channels {
            match self.attach_channels(ctx, &mut child, &ctx.config.process) {
                Ok((channels, exit)) => (Some(channels), Some(exit)),
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err);
                }
            }
        } else {
            (None, None)
        };

        info!(pid, program, ?channels, "process started");
        lock(&self.processes).insert(
            pid,
            TrackedProcess {
                pid,
                program: program.to_string(),
                child,
                channels,
                exit,
            },
        );
        Ok((pid, channels))
    }

    fn attach_channels(
        &self,
        ctx: &MethodContext<'_>,
        child: &mut Child,
        config: &ProcessChannelConfig,
    ) -> Result<(StdioChannels, ExitNotifier)> {
        let missing = || std::io::Error::other("child stdio was not piped");
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        let context = ctx.transport.channel_context();
        let exit = ExitNotifier::new(Arc::clone(&self.wake), 2);

        let stdin = ProcessChannel::stdin(context, stdin, exit.clone());
        let stdout = ProcessChannel::output(context, stdout, exit.clone(), config.clone())?;
        let stderr = ProcessChannel::output(context, stderr, exit.clone(), config.clone())?;

        let channels = StdioChannels {
            stdin: ctx.open_channel(Arc::new(stdin)),
            stdout: ctx.open_channel(Arc::new(stdout)),
            stderr: ctx.open_channel(Arc::new(stderr)),
        };
        Ok((channels, exit))
    }

    /// Kill a tracked process. Returns false if `pid` is not tracked.
    ///
    /// The process stays tracked until [`ProcessTable::reap`] sees it exit.
    pub fn kill(&self, pid: u32) -> Result<bool> {
        let mut processes = lock(&self.processes);
        let Some(process) = processes.get_mut(&pid) else {
            return Ok(false);
        };
        match process.child.kill() {
            Ok(()) => {}
            // Already exited but not reaped yet.
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(err) => return Err(err.into()),
        }
        info!(pid, "process killed");
        Ok(true)
    }

    /// Remove every process that has exited and return `(pid, exit code)`
    /// pairs; the code is -1 when the process was ended by a signal.
    pub fn reap(&self) -> Vec<(u32, i32)> {
        let mut processes = lock(&self.processes);
        let mut exited = Vec::new();
        for (pid, process) in processes.iter_mut() {
            match process.child.try_wait() {
                Ok(Some(status)) => exited.push((*pid, status.code().unwrap_or(-1))),
                Ok(None) => {}
                Err(err) => {
                    warn!(pid, error = %err, "failed to poll process");
                    exited.push((*pid, -1));
                }
            }
        }
        for (pid, code) in &exited {
            if let Some(process) = processes.remove(pid) {
                if let Some(exit) = &process.exit {
                    exit.notify();
                }
            }
            info!(pid, code, "process exited");
        }
        exited
    }

    /// Kill and reap everything still tracked.
    pub fn kill_all(&self) {
        let mut processes = std::mem::take(&mut *lock(&self.processes));
        for (pid, process) in processes.iter_mut() {
            if let Ok(None) = process.child.try_wait() {
                debug!(pid, "killing process on shutdown");
                let _ = process.child.kill();
            }
            let _ = process.child.wait();
        }
    }

    pub fn contains(&self, pid: u32) -> bool {
        lock(&self.processes).contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        lock(&self.processes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
