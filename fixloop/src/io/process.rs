//! Helpers for running child processes with timeouts and bounded output.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Destination that receives stdout lines while the child is still running.
pub type LiveSink = Box<dyn Write + Send>;

/// How long pipe readers get to hit EOF once the process group is killed.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

enum Stream {
    Stdout,
    Stderr,
}

type Captured = Result<(Vec<u8>, usize)>;

/// Run a command with a timeout, capturing stdout/stderr and optionally
/// streaming stdout lines to `live` as they arrive.
///
/// On unix the child leads its own process group, so a terminal Ctrl-C only
/// reaches this process and a timeout kills every descendant at once.
///
/// Output is read concurrently while the child runs so large outputs cannot
/// deadlock the pipes. `output_limit_bytes` bounds what is kept in memory: the
/// most recent bytes are kept and older ones are counted as truncated, since
/// agents print their summary last. If descendants keep the pipes open after
/// the child exits, the group is killed once the timeout budget runs out.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, streaming = live.is_some()))]
pub fn run_command_with_stream(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    live: Option<LiveSink>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pid = child.id();

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // A child that exits without reading stdin closes the pipe; that is not our failure.
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel::<(Stream, Captured)>();
    let stdout_tx = tx.clone();
    thread::spawn(move || {
        let captured = read_stream_limited_with_tee(stdout, output_limit_bytes, live);
        if stdout_tx.send((Stream::Stdout, captured)).is_err() {
            debug!("stdout collector already gone");
        }
    });
    thread::spawn(move || {
        let captured = read_stream_limited(stderr, output_limit_bytes);
        if tx.send((Stream::Stderr, captured)).is_err() {
            debug!("stderr collector already gone");
        }
    });

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            if !kill_process_group(pid) {
                child.kill().context("kill command")?;
            }
            child.wait().context("wait command after kill")?
        }
    };

    let mut killed = timed_out;
    let mut drain_until = if killed {
        Instant::now() + DRAIN_AFTER_KILL
    } else {
        (started + timeout).max(Instant::now())
    };
    let mut stdout = None;
    let mut stderr = None;
    while stdout.is_none() || stderr.is_none() {
        let wait = drain_until.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok((Stream::Stdout, captured)) => stdout = Some(captured.context("read stdout")?),
            Ok((Stream::Stderr, captured)) => stderr = Some(captured.context("read stderr")?),
            Err(RecvTimeoutError::Timeout) if !killed => {
                warn!(pid, "descendants still hold the output pipes, killing process group");
                kill_process_group(pid);
                killed = true;
                drain_until = Instant::now() + DRAIN_AFTER_KILL;
            }
            Err(e) => {
                warn!(err = %e, "giving up on output readers");
                break;
            }
        }
    }
    let (stdout, stdout_truncated) = stdout.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr.unwrap_or_default();

    if let Some(handle) = stdin_handle {
        if !handle.is_finished() {
            debug!("stdin writer still blocked; detaching it");
        } else if handle.join().is_err() {
            warn!("stdin writer thread panicked");
        }
    }

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated, kept the tail");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// SIGKILL the process group led by `pgid`. Returns whether the signal was delivered.
#[cfg(unix)]
fn kill_process_group(pgid: u32) -> bool {
    let target = format!("-{pgid}");
    match Command::new("kill")
        .args(["-KILL", "--", &target])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(pgid, err = %e, "cannot signal process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) -> bool {
    false
}

/// Keeps the last `limit` bytes written to it and counts the rest.
struct TailBuffer {
    buf: VecDeque<u8>,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.limit {
            self.dropped += self.buf.len() + bytes.len() - self.limit;
            self.buf.clear();
            self.buf.extend(&bytes[bytes.len() - self.limit..]);
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.limit);
        self.buf.drain(..overflow);
        self.dropped += overflow;
        self.buf.extend(bytes);
    }

    fn finish(self) -> (Vec<u8>, usize) {
        (self.buf.into(), self.dropped)
    }
}

/// Read a stream line by line with a size limit, tee-ing each line to `live`.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    mut live: Option<LiveSink>,
) -> Captured {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = TailBuffer::new(limit);

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(sink) = live.as_mut() {
            if let Err(e) = sink.write_all(&line) {
                warn!(err = %e, "failed to stream output line");
                live = None;
            } else if let Err(e) = sink.flush() {
                warn!(err = %e, "failed to flush streamed output");
            }
        }

        collected.push(&line);
    }

    Ok(collected.finish())
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Captured {
    let mut collected = TailBuffer::new(limit);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        collected.push(&chunk[..n]);
    }

    Ok(collected.finish())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("sink lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_stdout_and_streams_it_live() {
        let sink = SharedSink::default();
        let out = run_command_with_stream(
            sh("cat; echo done"),
            Some(b"hello\n"),
            Duration::from_secs(10),
            1_000,
            Some(Box::new(sink.clone())),
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy(), "hello\ndone\n");
        assert_eq!(&*sink.0.lock().expect("lock"), b"hello\ndone\n");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_stream(sh("sleep 5"), None, Duration::from_millis(100), 1_000, None)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    /// A subshell still holding stdout must not outlive the timeout.
    #[test]
    fn timeout_kills_descendants_holding_the_pipes() {
        let started = Instant::now();
        let out = run_command_with_stream(
            sh("(sleep 4; echo late); echo done"),
            None,
            Duration::from_millis(200),
            1_000,
            None,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
        assert!(!out.stdout_lossy().contains("late"));
    }

    /// A backgrounded grandchild is reaped once the timeout budget is spent.
    #[test]
    fn lingering_background_child_is_killed_after_exit() {
        let started = Instant::now();
        let out = run_command_with_stream(
            sh("sleep 4 & echo done"),
            None,
            Duration::from_millis(300),
            1_000,
            None,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy(), "done\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    /// The child leads its own process group, away from the terminal's.
    #[cfg(target_os = "linux")]
    #[test]
    fn child_runs_in_its_own_process_group() {
        let out = run_command_with_stream(
            sh("echo $$ $(cut -d' ' -f5 /proc/$$/stat)"),
            None,
            Duration::from_secs(10),
            1_000,
            None,
        )
        .expect("run");
        let text = out.stdout_lossy();
        let ids: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(ids.len(), 2, "unexpected output {text:?}");
        assert_eq!(ids[0], ids[1], "pid and process group differ");
        assert_ne!(ids[1], std::process::id().to_string());
    }

    #[test]
    fn truncation_keeps_the_tail() {
        let out = run_command_with_stream(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
            None,
        )
        .expect("run");
        assert_eq!(out.stdout, b"ghij");
        assert_eq!(out.stdout_truncated, 6);
    }

    /// Verifies a summary printed after a long preamble survives the limit.
    #[test]
    fn final_line_survives_output_limit() {
        let sink = SharedSink::default();
        let script = format!("printf '%s\\n' '{}'; echo '{{\"fixes\":[]}}'", "x".repeat(100));
        let out = run_command_with_stream(
            sh(&script),
            None,
            Duration::from_secs(10),
            32,
            Some(Box::new(sink.clone())),
        )
        .expect("run");
        assert!(out.stdout_lossy().ends_with("{\"fixes\":[]}\n"));
        assert_eq!(out.stdout.len(), 32);
        assert_eq!(out.stdout_truncated, 101 + 13 - 32);
        assert_eq!(sink.0.lock().expect("lock").len(), 101 + 13);
    }

    #[test]
    fn tail_buffer_counts_dropped_bytes() {
        let mut buf = TailBuffer::new(5);
        buf.push(b"abc");
        buf.push(b"def");
        assert_eq!(buf.finish(), (b"bcdef".to_vec(), 1));

        let mut empty = TailBuffer::new(0);
        empty.push(b"abc");
        assert_eq!(empty.finish(), (Vec::new(), 3));
    }
}
