use std::io::{ErrorKind, Read, Write};
use std::process::ChildStdin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use hidmux_frame::{lock, Signal};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Channel, ChannelContext, ChannelCore, Direction, Encoding};
use crate::error::Result;

/// Process stdio channel tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessChannelConfig {
    /// Bytes read from the pipe per read call.
    pub read_size: usize,
    /// Size of every outbound chunk except the last.
    pub chunk_size: usize,
    /// Buffered output above which the reader throttles.
    pub high_water: usize,
    #[serde(with = "hidmux_frame::millis")]
    pub throttle_sleep: Duration,
}

impl Default for ProcessChannelConfig {
    fn default() -> Self {
        Self {
            read_size: 1024,
            chunk_size: 3096,
            high_water: 60_000,
            throttle_sleep: Duration::from_millis(50),
        }
    }
}

/// One-shot exit notification shared by the stdio channels of a process.
///
/// Fires once every output stream has reached EOF, or directly through
/// [`ExitNotifier::notify`] when the process is reaped.
#[derive(Debug, Clone)]
pub struct ExitNotifier {
    open_outputs: Arc<AtomicUsize>,
    fired: Arc<AtomicBool>,
    wake: Arc<Signal>,
}

impl ExitNotifier {
    /// `outputs` is the number of output streams that must finish.
    /// `wake` is raised when the notification fires.
    pub fn new(wake: Arc<Signal>, outputs: usize) -> Self {
        Self {
            open_outputs: Arc::new(AtomicUsize::new(outputs)),
            fired: Arc::new(AtomicBool::new(false)),
            wake,
        }
    }

    /// Record that one output stream reached EOF. Returns true if this
    /// fired the notification.
    pub fn output_finished(&self) -> bool {
        let previous = self
            .open_outputs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| open.checked_sub(1))
            .unwrap_or(0);
        previous == 1 && self.notify()
    }

    /// Returns true only for the first call.
    pub fn notify(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.wake.set();
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

enum Pipe {
    Stdin(Mutex<Option<ChildStdin>>),
    Output {
        stop: Arc<AtomicBool>,
        reader: Mutex<Option<JoinHandle<()>>>,
    },
}

/// One stdio stream of a child process.
pub struct ProcessChannel {
    core: Arc<ChannelCore>,
    pipe: Pipe,
    exit: ExitNotifier,
}

impl ProcessChannel {
    /// An `In` channel feeding the child's stdin.
    pub fn stdin(context: &ChannelContext, stdin: ChildStdin, exit: ExitNotifier) -> Self {
        Self {
            core: Arc::new(ChannelCore::new(context, Direction::In, Encoding::Utf8)),
            pipe: Pipe::Stdin(Mutex::new(Some(stdin))),
            exit,
        }
    }

    /// An `Out` channel draining `source` (the child's stdout or stderr).
    pub fn output<R>(
        context: &ChannelContext,
        source: R,
        exit: ExitNotifier,
        config: ProcessChannelConfig,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let core = Arc::new(ChannelCore::new(context, Direction::Out, Encoding::Utf8));
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let core = Arc::clone(&core);
            let exit = exit.clone();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("hidmux-proc-{}", core.id()))
                .spawn(move || drain(core, source, exit, stop, config))?
        };
        Ok(Self {
            core,
            pipe: Pipe::Output {
                stop,
                reader: Mutex::new(Some(reader)),
            },
            exit,
        })
    }
}

impl Channel for ProcessChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn enqueue_input(&self, data: Bytes) {
        let Pipe::Stdin(stdin) = &self.pipe else {
            return;
        };
        if self.exit.has_fired() {
            debug!(channel = self.core.id(), "process exited, dropping stdin data");
            return;
        }
        if let Some(stdin) = lock(stdin).as_mut() {
            if let Err(err) = stdin.write_all(&data).and_then(|()| stdin.flush()) {
                warn!(channel = self.core.id(), error = %err, "stdin write failed");
            }
        }
    }

    /// Stdin follows the process: it closes once exit has been reported.
    fn should_close(&self) -> bool {
        self.core.should_close()
            || (matches!(self.pipe, Pipe::Stdin(_)) && self.exit.has_fired())
    }

    fn on_close(&self) {
        match &self.pipe {
            Pipe::Stdin(stdin) => {
                lock(stdin).take();
            }
            Pipe::Output { stop, reader } => {
                stop.store(true, Ordering::SeqCst);
                if let Some(handle) = lock(reader).take() {
                    if handle.is_finished() {
                        let _ = handle.join();
                    }
                }
            }
        }
        debug!(channel = self.core.id(), "process channel closed");
    }
}

fn drain<R: Read>(
    core: Arc<ChannelCore>,
    mut source: R,
    exit: ExitNotifier,
    stop: Arc<AtomicBool>,
    config: ProcessChannelConfig,
) {
    let mut buf = vec![0u8; config.read_size.max(1)];
    loop {
        if stop.load(Ordering::SeqCst) {
            debug!(channel = core.id(), "process output reader stopped");
            return;
        }
        if core.output_bytes() > config.high_water {
            thread::sleep(config.throttle_sleep);
            continue;
        }
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => core.push_output_rechunked(&buf[..n], config.chunk_size),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(channel = core.id(), error = %err, "process output read failed");
                break;
            }
        }
    }
    debug!(channel = core.id(), "process output reached EOF");
    exit.output_finished();
    core.request_close();
}
