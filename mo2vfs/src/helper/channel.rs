//! Manager-side control channel to the sandbox helper.
//!
//! The helper owns the mount when the manager runs in a container that
//! cannot mount filesystems itself. Control is line-oriented over the
//! helper's stdin/stdout: one command per line, exactly one response line
//! per command (`ok`, or `error: <message>`). Every wait is bounded; an
//! expired deadline escalates to killing the helper.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::vfs::{MountError, MountResult};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const REBUILD_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const QUIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A running helper process and its line-oriented control protocol.
#[derive(Debug)]
pub struct HelperChannel {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
}

impl HelperChannel {
    /// Spawn `helper_bin <config_path>` and wait for its `mounted` line.
    ///
    /// On any startup failure the helper is killed and its captured stderr
    /// is included in the error.
    pub fn spawn(helper_bin: &Path, config_path: &Path) -> MountResult<Self> {
        let mut child = Command::new(helper_bin)
            .arg(config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                MountError::HelperStartFailed(format!("{}: {}", helper_bin.display(), e))
            })?;

        let stdin = child.stdin.take().expect("helper stdin is piped");
        let stdout = child.stdout.take().expect("helper stdout is piped");

        // Stdout is drained on a dedicated thread so waits can be bounded
        // with recv_timeout; the thread ends when the helper closes its pipe.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let mut channel = HelperChannel {
            child,
            stdin,
            lines: rx,
        };

        if let Err(err) = channel.wait_for_line("mounted", STARTUP_TIMEOUT) {
            let stderr = channel.kill_and_collect_stderr();
            return Err(MountError::HelperStartFailed(format!("{}; {}", err, stderr)));
        }

        debug!("VFS helper mounted");
        Ok(channel)
    }

    /// Ask the helper to re-read its config file and swap in a new tree.
    pub fn rebuild(&mut self) -> MountResult<()> {
        self.send_command("rebuild", REBUILD_TIMEOUT)
    }

    /// Ask the helper to promote staging and refresh its tree.
    pub fn flush(&mut self) -> MountResult<()> {
        self.send_command("flush", FLUSH_TIMEOUT)
    }

    /// Ask the helper to unmount and exit, then reap it.
    pub fn quit(mut self) -> MountResult<()> {
        let result = self.send_command("quit", QUIT_TIMEOUT);

        if !self.wait_with_deadline(Duration::from_secs(5)) {
            warn!("helper did not exit after quit, killing it");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        result
    }

    fn send_command(&mut self, command: &str, timeout: Duration) -> MountResult<()> {
        debug!(command, "sending helper command");
        writeln!(self.stdin, "{}", command).map_err(|e| {
            MountError::HelperProtocolError(format!("failed to write '{}': {}", command, e))
        })?;
        self.stdin.flush().ok();

        match self.wait_for_line("ok", timeout) {
            Ok(()) => Ok(()),
            Err(err @ MountError::HelperTimeout { .. }) => {
                // Deadline expired: the helper is wedged, take it down.
                error!("helper '{}' timed out, killing helper", command);
                let _ = self.child.kill();
                let _ = self.child.wait();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn wait_for_line(&mut self, expected: &str, timeout: Duration) -> MountResult<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MountError::HelperTimeout {
                    command: expected.to_string(),
                });
            }

            match self.lines.recv_timeout(remaining) {
                Ok(line) => {
                    let line = line.trim();
                    if line == expected {
                        return Ok(());
                    }
                    if let Some(message) = line.strip_prefix("error:") {
                        return Err(MountError::HelperProtocolError(
                            message.trim().to_string(),
                        ));
                    }
                    // Unrelated output (helper logging); keep waiting.
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(MountError::HelperTimeout {
                        command: expected.to_string(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MountError::HelperProtocolError(
                        "helper exited unexpectedly".to_string(),
                    ));
                }
            }
        }
    }

    fn wait_with_deadline(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return false,
            }
        }
    }

    fn kill_and_collect_stderr(&mut self) -> String {
        let _ = self.child.kill();
        let _ = self.child.wait();

        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let stderr = stderr.trim();
        if stderr.is_empty() {
            "no stderr output".to_string()
        } else {
            format!("stderr: {}", stderr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write a tiny shell script standing in for the helper binary.
    fn fake_helper(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("fake-helper");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_spawn_and_quit_happy_path() {
        let dir = TempDir::new().unwrap();
        let helper = fake_helper(
            dir.path(),
            r#"echo mounted
while read cmd; do
  case "$cmd" in
    quit) echo ok; exit 0 ;;
    *) echo ok ;;
  esac
done"#,
        );

        let mut channel = HelperChannel::spawn(&helper, Path::new("/dev/null")).unwrap();
        channel.rebuild().unwrap();
        channel.flush().unwrap();
        channel.quit().unwrap();
    }

    #[test]
    fn test_error_line_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let helper = fake_helper(
            dir.path(),
            r#"echo mounted
while read cmd; do echo "error: staging busted"; done"#,
        );

        let mut channel = HelperChannel::spawn(&helper, Path::new("/dev/null")).unwrap();
        let err = channel.rebuild().unwrap_err();
        match err {
            MountError::HelperProtocolError(msg) => assert_eq!(msg, "staging busted"),
            other => panic!("unexpected error: {other}"),
        }
        // Dropping the channel closes the helper's stdin; the script exits
        // on read failure.
        drop(channel);
    }

    #[test]
    fn test_startup_error_includes_stderr() {
        let dir = TempDir::new().unwrap();
        let helper = fake_helper(
            dir.path(),
            r#"echo "error: config unreadable"
echo "details on stderr" >&2
exit 1"#,
        );

        let err = HelperChannel::spawn(&helper, Path::new("/dev/null")).unwrap_err();
        match err {
            MountError::HelperStartFailed(msg) => {
                assert!(msg.contains("config unreadable"), "got: {msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unrelated_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let helper = fake_helper(
            dir.path(),
            r#"echo "helper starting up"
echo mounted
while read cmd; do
  case "$cmd" in
    quit) echo ok; exit 0 ;;
    *) echo ok ;;
  esac
done"#,
        );

        let channel = HelperChannel::spawn(&helper, Path::new("/dev/null"));
        assert!(channel.is_ok());
        channel.unwrap().quit().unwrap();
    }
}
