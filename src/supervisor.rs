use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{error::SupervisorError, job::DownloadSpec};

/// Lines kept for the failure message.
pub const LAST_LINES_WINDOW: usize = 5;

const LINE_CHANNEL_CAPACITY: usize = 256;

/// How to start the external downloader: an executable plus arguments that
/// go before the per-task ones (`sh stub.sh` in tests, plain `yt-dlp` in
/// production).
#[derive(Debug, Clone)]
pub struct DownloaderCommand {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl DownloaderCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);
        command
    }

    pub fn display_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// `code` is `None` when the child was ended by a signal.
    Exited {
        code: Option<i32>,
        last_lines: Vec<String>,
    },
    TimedOut {
        after: Duration,
        last_lines: Vec<String>,
    },
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0), .. })
    }

    pub fn last_lines(&self) -> &[String] {
        match self {
            Self::Exited { last_lines, .. } | Self::TimedOut { last_lines, .. } => last_lines,
        }
    }
}

#[derive(Debug)]
struct LineWindow {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineWindow {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Runs one downloader child per call and guarantees it is gone on return.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    command: DownloaderCommand,
}

impl ProcessSupervisor {
    pub fn new(command: DownloaderCommand) -> Self {
        Self { command }
    }

    /// Spawns the downloader for `spec`, feeds every output line to
    /// `on_line` in arrival order, and waits for exit or `spec.max_duration`.
    ///
    /// stdout and stderr are merged into one stream; lines from the same
    /// pipe keep their order. The child leads its own process group, and the
    /// whole group is killed once the child exits, on timeout, and when the
    /// returned future is dropped early, so helpers it started (ffmpeg) never
    /// outlive it.
    pub async fn run(
        &self,
        spec: &DownloadSpec,
        mut on_line: impl FnMut(&str),
    ) -> Result<ProcessOutcome, SupervisorError> {
        let mut command = self.command.command();
        command
            .args(spec.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.command.display_name(),
            source,
        })?;
        let group = ProcessGroup::new(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::MissingPipe("stderr"))?;

        let (sender, mut receiver) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let readers = [
            spawn_line_reader(stdout, sender.clone()),
            spawn_line_reader(stderr, sender),
        ];
        let mut window = LineWindow::new(LAST_LINES_WINDOW);

        let streamed = timeout(spec.max_duration, async {
            let mut exit = None;
            loop {
                tokio::select! {
                    line = receiver.recv() => match line {
                        Some(line) => {
                            on_line(&line);
                            window.push(line);
                        }
                        None => break,
                    },
                    status = child.wait(), if exit.is_none() => {
                        // Leftover group members would keep the pipes open.
                        group.kill();
                        exit = Some(status);
                    }
                }
            }
            match exit {
                Some(status) => status,
                None => child.wait().await,
            }
        })
        .await;

        match streamed {
            Ok(Ok(status)) => Ok(ProcessOutcome::Exited {
                code: status.code(),
                last_lines: window.into_lines(),
            }),
            Ok(Err(error)) => {
                group.kill();
                abort_readers(&readers);
                if let Err(kill_error) = child.kill().await {
                    debug!("downloader already gone after wait failure: {kill_error}");
                }
                Err(SupervisorError::Wait(error))
            }
            Err(_) => {
                warn!(
                    "Downloader exceeded {:?}, killing process group {:?}",
                    spec.max_duration,
                    child.id()
                );
                group.kill();
                if let Err(error) = child.kill().await {
                    warn!("Could not kill timed out downloader: {error}");
                }
                abort_readers(&readers);
                Ok(ProcessOutcome::TimedOut {
                    after: spec.max_duration,
                    last_lines: window.into_lines(),
                })
            }
        }
    }
}

/// Process group led by a spawned downloader. Signalled at most once, on
/// the first `kill` or on drop.
#[derive(Debug)]
struct ProcessGroup {
    // 0 once signalled or when the leader id was unavailable.
    id: AtomicU32,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self {
            id: AtomicU32::new(leader.unwrap_or(0)),
        }
    }

    fn take(&self) -> Option<u32> {
        Some(self.id.swap(0, Ordering::SeqCst)).filter(|id| *id != 0)
    }

    #[cfg(unix)]
    fn kill(&self) {
        use nix::{
            errno::Errno,
            sys::signal::{Signal, killpg},
            unistd::Pid,
        };

        let Some(id) = self.take().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(id), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => warn!("Could not kill downloader process group {id}: {error}"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) {
        self.take();
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn abort_readers(readers: &[JoinHandle<()>]) {
    for reader in readers {
        reader.abort();
    }
}

/// Forwards lines from one pipe. Bytes are decoded lossily and `\r` counts
/// as a line break, so odd encodings or carriage-return progress never end
/// the stream early.
fn spawn_line_reader<R>(stream: R, sender: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buffer);
                    for segment in text
                        .split(['\r', '\n'])
                        .map(str::trim_end)
                        .filter(|segment| !segment.trim().is_empty())
                    {
                        if sender.send(segment.to_string()).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) => {
                    debug!("downloader output stream ended: {error}");
                    break;
                }
            }
        }
    })
}
