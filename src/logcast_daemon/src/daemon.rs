use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::runtime::Runtime;

use logcast_lib::{
    AttachmentScanner, CastError, CastResult, ChunkedUploader, HttpBucketStore, IndexedStore,
    LocalDirStore, ObjectStorage, UploaderConfig,
};

pub const DEFAULT_STREAM_NAME: &str = "output.txt";
/// The child finds the shared attachments directory under this name.
pub const ATTACH_DIR_ENV: &str = "LOGCAST_ATTACH_DIR";

const TICK: Duration = Duration::from_secs(1);
/// Matches the pipe capacity: when the child has exited a single read
/// this large fully drains whatever it left behind.
const READ_BUF_SIZE: usize = 1024 * 1024;
#[cfg(target_os = "linux")]
const PIPE_BUF_SIZE: libc::c_int = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageTarget {
    Local(PathBuf),
    Remote(String),
}

impl Default for StorageTarget {
    fn default() -> Self {
        StorageTarget::Local(PathBuf::from("bucket"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonRunOptions {
    pub target: StorageTarget,
    pub stream_name: String,
    pub session_token: Option<String>,
    pub encoding: String,
    pub command: Vec<String>,
}

impl Default for DaemonRunOptions {
    fn default() -> Self {
        Self {
            target: StorageTarget::default(),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            session_token: None,
            encoding: "utf-8".to_string(),
            command: Vec::new(),
        }
    }
}

pub fn run_daemon(options: DaemonRunOptions) -> CastResult<i32> {
    let runtime = Runtime::new()
        .map_err(|e| CastError::Internal(format!("create runtime failed: {}", e)))?;
    runtime.block_on(run(options))
}

async fn run(options: DaemonRunOptions) -> CastResult<i32> {
    let store: Arc<dyn ObjectStorage> = match &options.target {
        StorageTarget::Local(dir) => Arc::new(LocalDirStore::open(dir).await?),
        StorageTarget::Remote(url) => {
            Arc::new(HttpBucketStore::new(url, options.session_token.clone())?)
        }
    };
    run_with_store(&options, store).await
}

pub(crate) async fn run_with_store(
    options: &DaemonRunOptions,
    store: Arc<dyn ObjectStorage>,
) -> CastResult<i32> {
    if options.command.is_empty() {
        return Err(CastError::InvalidParam("empty command".to_string()));
    }

    let index = IndexedStore::new(store);
    let attach_dir = tempfile::Builder::new()
        .prefix("logcast-attach-")
        .tempdir()
        .map_err(|e| CastError::IoError(format!("create attachments dir failed: {}", e)))?;
    let scanner = AttachmentScanner::new(attach_dir.path(), index.clone());

    let config = UploaderConfig {
        filename: options.stream_name.clone(),
        encoding: options.encoding.clone(),
        ..Default::default()
    };
    let mut uploader = ChunkedUploader::new(config, index.clone()).await?;

    let (pipe, child_stdout, child_stderr) = OutputPipe::new()?;
    let mut child = spawn_child(&options.command, child_stdout, child_stderr, attach_dir.path())?;
    info!("spawned {} (pid {:?})", options.command[0], child.id());

    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut pipe_dead = false;
    let exit_status;
    loop {
        tokio::time::sleep(TICK).await;

        // Poll before reading, so the tick that sees the exit still
        // drains the pipe and runs the final pass.
        let status = child
            .try_wait()
            .map_err(|e| CastError::IoError(format!("poll child failed: {}", e)))?;

        let n = if pipe_dead {
            0
        } else {
            match pipe.read_available(&mut buf) {
                Ok(Some(n)) => n,
                Ok(None) => 0,
                Err(e) => {
                    // The output stream is over; the child may still be
                    // running and producing attachments.
                    warn!("pipe read failed, treating as end of stream: {}", e);
                    pipe_dead = true;
                    0
                }
            }
        };

        // Attachments before log data: a line mentioning a file must
        // never be visible before the file itself.
        let attachments = scanner.scan().await?;
        uploader.write(&buf[..n], status.is_some()).await?;
        index.sync().await?;
        debug!(
            "tick: read {} bytes, {} attachments, {} pending, exited={}",
            n,
            attachments,
            uploader.pending_len(),
            status.is_some()
        );

        if let Some(status) = status {
            exit_status = status;
            break;
        }
    }

    info!("child exited with {}", exit_status);
    Ok(exit_status.code().unwrap_or(1))
}

fn spawn_child(
    command: &[String],
    stdout: Stdio,
    stderr: Stdio,
    attach_dir: &Path,
) -> CastResult<Child> {
    // The Command (and with it our copies of the pipe write end) is
    // dropped on return; only the child holds the write end afterwards.
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .env(ATTACH_DIR_ENV, attach_dir);
    cmd.spawn()
        .map_err(|e| CastError::IoError(format!("spawn {} failed: {}", command[0], e)))
}

/// The single pipe carrying the child's merged stdout and stderr. The
/// read end is non-blocking; the loop above must never stall on a quiet
/// child.
struct OutputPipe {
    read_fd: OwnedFd,
}

impl OutputPipe {
    fn new() -> CastResult<(Self, Stdio, Stdio)> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(last_os_error("pipe"));
        }
        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let flags = unsafe { libc::fcntl(read_fd.as_raw_fd(), libc::F_GETFL) };
        if flags == -1
            || unsafe { libc::fcntl(read_fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) }
                == -1
        {
            return Err(last_os_error("fcntl(O_NONBLOCK)"));
        }

        #[cfg(target_os = "linux")]
        if unsafe { libc::fcntl(read_fd.as_raw_fd(), libc::F_SETPIPE_SZ, PIPE_BUF_SIZE) } == -1 {
            warn!("could not grow pipe buffer to {} bytes", PIPE_BUF_SIZE);
        }

        let stderr_fd = write_fd
            .try_clone()
            .map_err(|e| CastError::IoError(format!("dup pipe write end failed: {}", e)))?;
        Ok((Self { read_fd }, Stdio::from(write_fd), Stdio::from(stderr_fd)))
    }

    /// One non-blocking read. `Ok(Some(0))` is end-of-file, `Ok(None)`
    /// is "nothing available right now".
    fn read_available(&self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        let n = unsafe {
            libc::read(
                self.read_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::EINTR => {
                Ok(None)
            }
            _ => Err(err),
        }
    }
}

fn last_os_error(op: &str) -> CastError {
    CastError::IoError(format!("{} failed: {}", op, std::io::Error::last_os_error()))
}
