use std::io;
use std::path::Path;
use std::pin::{Pin, pin};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::future::join_all;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{mpsc::Sender, watch},
    task::{AbortHandle, JoinHandle},
    time::timeout,
};

use crate::{
    config::RunnerConfig,
    core::{
        domain::{CapturedLine, Invocation, LaunchPlan, StreamKind},
        errors::LaunchError,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited { code: i32 },
    Stopped,
}

/// A spawned child together with the tasks draining its pipes.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
    grace_period: Duration,
    drain_timeout: Duration,
}

/// Spawns `plan` and starts one reader per output stream, both feeding `sink`.
///
/// A `PermissionDenied` spawn error on the primary invocation is retried once
/// with the plan's fallback; any other error is returned as is.
#[tracing::instrument(skip(sink, config))]
pub fn launch(
    plan: &LaunchPlan,
    sink: Sender<CapturedLine>,
    config: &RunnerConfig,
) -> Result<SupervisedProcess, LaunchError> {
    let mut child = match spawn(&plan.primary, &plan.working_dir) {
        Ok(child) => child,
        Err(e) => match (&plan.fallback, e.kind()) {
            (Some(fallback), io::ErrorKind::PermissionDenied) => {
                tracing::warn!(
                    "Permission denied for {}, retrying via {}",
                    plan.primary.program.display(),
                    fallback.program.display()
                );
                spawn(fallback, &plan.working_dir).map_err(|source| LaunchError::Spawn {
                    program: fallback.program.clone(),
                    source,
                })?
            }
            _ => {
                return Err(LaunchError::Spawn {
                    program: plan.primary.program.clone(),
                    source: e,
                });
            }
        },
    };

    let pid = child.id();
    tracing::debug!("Spawned process: pid={:?}", pid);

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, StreamKind::Stdout, sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, StreamKind::Stderr, sink));
    }

    Ok(SupervisedProcess {
        child,
        pid,
        readers,
        grace_period: config.grace_period,
        drain_timeout: config.drain_timeout,
    })
}

fn spawn(invocation: &Invocation, working_dir: &Path) -> io::Result<Child> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group, so cancellation reaches everything the script starts.
    #[cfg(unix)]
    command.process_group(0);

    command.spawn()
}

fn spawn_reader<R>(stream: R, kind: StreamKind, sink: Sender<CapturedLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = CapturedLine {
                        stream: kind,
                        text: decode_line(&buf),
                    };
                    if sink.send(line).await.is_err() {
                        tracing::debug!("Output sink closed, stopping {} reader", kind);
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", kind, e);
                    break;
                }
            }
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

impl SupervisedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Runs until the process exits or `cancel` turns true, then joins both
    /// readers. A dropped cancel sender counts as a cancel request.
    ///
    /// After a natural exit the readers are drained completely and whatever is
    /// left in the process group is killed; a cancel that arrives during that
    /// drain kills the group early and the outcome stays `Exited`.
    pub async fn supervise(mut self, mut cancel: watch::Receiver<bool>) -> ProcessOutcome {
        let aborts: Vec<AbortHandle> = self.readers.iter().map(|r| r.abort_handle()).collect();
        let mut drained = pin!(join_all(std::mem::take(&mut self.readers)));

        // Biased: an exit that already happened wins over a late cancel.
        let waited = tokio::select! {
            biased;
            status = self.child.wait() => Some(status),
            _ = cancel_requested(&mut cancel) => None,
        };

        match waited {
            Some(status) => {
                let code = match status {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        tracing::warn!("Failed to wait for process: {}", e);
                        -1
                    }
                };
                tracing::debug!("Process exited: code={}", code);

                let cancelled = tokio::select! {
                    biased;
                    _ = &mut drained => false,
                    _ = cancel_requested(&mut cancel) => true,
                };
                if cancelled {
                    tracing::debug!("Cancel requested while draining output");
                    self.kill_group();
                    bounded_drain(drained.as_mut(), &aborts, self.drain_timeout).await;
                } else {
                    // Detached members that closed their pipes die with the run.
                    self.kill_group();
                }

                ProcessOutcome::Exited { code }
            }
            None => {
                tracing::info!("Cancel requested, terminating pid={:?}", self.pid);
                self.terminate().await;
                bounded_drain(drained.as_mut(), &aborts, self.drain_timeout).await;
                ProcessOutcome::Stopped
            }
        }
    }

    /// SIGTERM, then SIGKILL once the grace period runs out. Always reaps the child.
    async fn terminate(&mut self) {
        self.request_terminate();

        match timeout(self.grace_period, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Process terminated: {}", status),
            Ok(Err(e)) => tracing::warn!("Failed to wait for terminated process: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Process did not exit within {:?}, killing pid={:?}",
                    self.grace_period,
                    self.pid
                );
                if let Err(e) = self.child.start_kill() {
                    tracing::debug!("Failed to kill process: {}", e);
                }
                if let Err(e) = self.child.wait().await {
                    tracing::warn!("Failed to reap killed process: {}", e);
                }
            }
        }

        // Leader is gone; clear anything else left in its group.
        self.kill_group();
    }

    #[cfg(unix)]
    fn request_terminate(&mut self) {
        signal_group(self.pid, nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(not(unix))]
    fn request_terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("Failed to kill process: {}", e);
        }
    }

    #[cfg(unix)]
    fn kill_group(&mut self) {
        signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {}
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    use nix::{sys::signal::killpg, unistd::Pid};

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        // ESRCH just means the group is already empty.
        tracing::debug!("Failed to send {:?} to process group {}: {}", signal, pid, e);
    }
}

async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|requested| *requested).await;
}

/// Waits up to `limit` for the readers, aborting the ones still blocked on a
/// pipe that a detached process keeps open.
async fn bounded_drain<F>(mut drained: Pin<&mut F>, aborts: &[AbortHandle], limit: Duration)
where
    F: Future,
{
    if timeout(limit, drained.as_mut()).await.is_err() {
        tracing::warn!("Output readers still busy after {:?}, aborting them", limit);
        aborts.iter().for_each(AbortHandle::abort);
        drained.await;
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Instant;

    use itertools::Itertools;
    use nix::{sys::signal::kill, unistd::Pid};
    use tokio::sync::mpsc;

    use super::*;

    fn sh(script: &str) -> LaunchPlan {
        LaunchPlan {
            primary: Invocation {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), script.to_string()],
            },
            fallback: None,
            working_dir: std::env::temp_dir(),
        }
    }

    fn config(grace_ms: u64) -> RunnerConfig {
        RunnerConfig {
            grace_period: Duration::from_millis(grace_ms),
            drain_timeout: Duration::from_millis(500),
            ..RunnerConfig::default()
        }
    }

    /// Launches `plan`, supervises it with the given cancel channel and
    /// returns every captured line plus the outcome.
    async fn run(
        plan: LaunchPlan,
        config: RunnerConfig,
        cancel: watch::Receiver<bool>,
    ) -> (Vec<CapturedLine>, ProcessOutcome, Option<u32>) {
        let (tx, mut rx) = mpsc::channel(16);
        let process = launch(&plan, tx, &config).expect("launch should succeed");
        let pid = process.pid();

        let collector = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            lines
        });

        let outcome = process.supervise(cancel).await;
        let lines = collector.await.unwrap();
        (lines, outcome, pid)
    }

    fn texts(lines: &[CapturedLine], stream: StreamKind) -> Vec<String> {
        lines
            .iter()
            .filter(|l| l.stream == stream)
            .map(|l| l.text.clone())
            .collect()
    }

    fn process_gone(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_err()
    }

    /// Gone or a zombie waiting for an init that may never reap it.
    fn process_dead(pid: u32) -> bool {
        if process_gone(pid) {
            return true;
        }
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap_or_default();
        stat.rsplit(')')
            .next()
            .is_some_and(|state| state.trim_start().starts_with('Z'))
    }

    #[tokio::test]
    async fn test_exit_codes() {
        for (script, expected) in [("exit 0", 0), ("exit 1", 1), ("exit 42", 42)] {
            let (_cancel_tx, cancel_rx) = watch::channel(false);
            let (lines, outcome, _) = run(sh(script), config(1000), cancel_rx).await;

            assert!(lines.is_empty());
            assert_eq!(outcome, ProcessOutcome::Exited { code: expected });
        }
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (_, outcome, _) = run(sh("kill -9 $$"), config(1000), cancel_rx).await;

        assert_eq!(outcome, ProcessOutcome::Exited { code: 137 });
    }

    #[tokio::test]
    async fn test_both_streams_fully_drained_in_order() {
        let script = "i=1; while [ $i -le 50 ]; do echo out$i; echo err$i >&2; i=$((i+1)); done";
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (lines, outcome, _) = run(sh(script), config(1000), cancel_rx).await;

        assert_eq!(outcome, ProcessOutcome::Exited { code: 0 });
        assert_eq!(lines.len(), 100);
        assert_eq!(
            texts(&lines, StreamKind::Stdout),
            (1..=50).map(|i| format!("out{}", i)).collect_vec()
        );
        assert_eq!(
            texts(&lines, StreamKind::Stderr),
            (1..=50).map(|i| format!("err{}", i)).collect_vec()
        );
    }

    #[tokio::test]
    async fn test_line_endings_and_invalid_utf8() {
        let script = r"printf 'crlf\r\n'; printf 'bad \377 byte\n'; printf 'no newline'";
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (lines, _, _) = run(sh(script), config(1000), cancel_rx).await;

        assert_eq!(
            texts(&lines, StreamKind::Stdout),
            vec!["crlf", "bad \u{FFFD} byte", "no newline"]
        );
    }

    #[tokio::test]
    async fn test_output_after_exit_of_leader_is_not_missed() {
        // The backgrounded writer outlives the shell and still holds stdout.
        let script = "(sleep 0.3; echo late) & echo early";
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (lines, outcome, _) = run(sh(script), config(1000), cancel_rx).await;

        assert_eq!(outcome, ProcessOutcome::Exited { code: 0 });
        assert_eq!(texts(&lines, StreamKind::Stdout), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_natural_exit_clears_detached_group_members() {
        let script = "sleep 30 >/dev/null 2>&1 & echo $!";
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (lines, outcome, _) = run(sh(script), config(1000), cancel_rx).await;

        assert_eq!(outcome, ProcessOutcome::Exited { code: 0 });
        let background: u32 = lines[0].text.parse().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_dead(background) {
            assert!(Instant::now() < deadline, "background pid {} still alive", background);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_long_running_process() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(16);
        let process = launch(&sh("echo started; sleep 30"), tx, &config(1000)).unwrap();
        let pid = process.pid().unwrap();
        let supervisor = tokio::spawn(process.supervise(cancel_rx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "started");
        cancel_tx.send_replace(true);

        let started = Instant::now();
        let outcome = supervisor.await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(rx.recv().await.is_none());
        assert!(process_gone(pid));
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(16);
        let plan = sh("trap '' TERM; echo ready; sleep 30");
        let process = launch(&plan, tx, &config(300)).unwrap();
        let pid = process.pid().unwrap();
        let supervisor = tokio::spawn(process.supervise(cancel_rx));

        assert_eq!(rx.recv().await.unwrap().text, "ready");
        let started = Instant::now();
        cancel_tx.send_replace(true);
        let outcome = supervisor.await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(process_gone(pid));
    }

    #[tokio::test]
    async fn test_dropped_cancel_sender_stops_process() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        drop(cancel_tx);

        let (_, outcome, pid) = run(sh("sleep 30"), config(1000), cancel_rx).await;

        assert_eq!(outcome, ProcessOutcome::Stopped);
        assert!(process_gone(pid.unwrap()));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let plan = LaunchPlan {
            primary: Invocation {
                program: PathBuf::from("/nonexistent/toolchain"),
                args: vec![],
            },
            fallback: None,
            working_dir: std::env::temp_dir(),
        };
        let (tx, mut rx) = mpsc::channel(16);

        let result = launch(&plan, tx, &config(1000));

        assert!(matches!(
            result,
            Err(LaunchError::Spawn { ref program, .. }) if program == Path::new("/nonexistent/toolchain")
        ));
        assert!(rx.recv().await.is_none());
    }

    fn not_executable() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kotlinc");
        std::fs::write(&path, "#!/bin/sh\necho direct\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_permission_denied_retries_fallback_once() {
        let (_dir, program) = not_executable();
        let mut plan = sh("echo via fallback");
        plan.fallback = Some(plan.primary.clone());
        plan.primary = Invocation {
            program,
            args: vec![],
        };

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (lines, outcome, _) = run(plan, config(1000), cancel_rx).await;

        assert_eq!(outcome, ProcessOutcome::Exited { code: 0 });
        assert_eq!(texts(&lines, StreamKind::Stdout), vec!["via fallback"]);
    }

    #[tokio::test]
    async fn test_permission_denied_without_fallback() {
        let (_dir, program) = not_executable();
        let plan = LaunchPlan {
            primary: Invocation {
                program,
                args: vec![],
            },
            fallback: None,
            working_dir: std::env::temp_dir(),
        };
        let (tx, _rx) = mpsc::channel(16);

        let result = launch(&plan, tx, &config(1000));

        assert!(matches!(
            result,
            Err(LaunchError::Spawn { ref source, .. }) if source.kind() == io::ErrorKind::PermissionDenied
        ));
    }

    #[tokio::test]
    async fn test_fallback_failure_is_terminal() {
        let (_dir, program) = not_executable();
        let plan = LaunchPlan {
            primary: Invocation {
                program,
                args: vec![],
            },
            fallback: Some(Invocation {
                program: PathBuf::from("/nonexistent/env"),
                args: vec![],
            }),
            working_dir: std::env::temp_dir(),
        };
        let (tx, _rx) = mpsc::channel(16);

        let result = launch(&plan, tx, &config(1000));

        assert!(matches!(
            result,
            Err(LaunchError::Spawn { ref program, .. }) if program == Path::new("/nonexistent/env")
        ));
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"windows\r\n"), "windows");
        assert_eq!(decode_line(b"last"), "last");
        assert_eq!(decode_line(b"\n"), "");
    }
}
