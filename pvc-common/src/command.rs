//! External command execution.
//!
//! The daemon drives a number of system tools (`ipmitool`, `ip`, `nft`,
//! `rbd`, `dig`, ...) as one-shot commands, and supervises long-running
//! children (`dnsmasq`, `pdns_server`) across primary transitions.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Captured result of a one-shot command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code; 128 if the command timed out and was killed.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Exit code reported when a one-shot command exceeds its timeout.
pub const TIMEOUT_STATUS: i32 = 128;

fn split_command(command_line: &str) -> Result<(String, Vec<String>), Error> {
    let mut parts = command_line.split_whitespace().map(str::to_owned);
    let program = match parts.next() {
        Some(program) => program,
        None => bail!("empty command line"),
    };
    Ok((program, parts.collect()))
}

/// Run a one-shot command and capture its output.
///
/// The command line is split on whitespace; none of the tools we drive need
/// shell quoting. With a timeout, the child is killed once it elapses and
/// the returned status is [`TIMEOUT_STATUS`].
pub fn run_command(command_line: &str, timeout: Option<Duration>) -> Result<CommandOutput, Error> {
    let (program, args) = split_command(command_line)?;

    let child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn '{program}'"))?;

    collect_child(child, timeout)
}

fn collect_child(mut child: Child, timeout: Option<Duration>) -> Result<CommandOutput, Error> {
    if let Some(timeout) = timeout {
        let deadline = Instant::now() + timeout;
        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(CommandOutput {
                    status: TIMEOUT_STATUS,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    let output = child.wait_with_output()?;
    Ok(CommandOutput {
        status: output.status.code().unwrap_or(TIMEOUT_STATUS),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// A supervised long-running child process.
///
/// Used for the per-network dnsmasq instances and the PowerDNS aggregator,
/// which live for as long as this node stays primary.
pub struct OsDaemon {
    program: String,
    child: Child,
}

impl OsDaemon {
    /// Spawn a child, appending stdout and stderr to `logfile` if given.
    pub fn spawn(program: &str, args: &[String], logfile: Option<&Path>) -> Result<Self, Error> {
        let (stdout, stderr) = match logfile {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open logfile {}", path.display()))?;
                let clone = file.try_clone()?;
                (Stdio::from(file), Stdio::from(clone))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("failed to spawn '{program}'"))?;

        Ok(OsDaemon {
            program: program.to_owned(),
            child,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Send a signal to the child.
    pub fn signal(&self, signal: Signal) -> Result<(), Error> {
        kill(Pid::from_raw(self.child.id() as i32), signal)
            .with_context(|| format!("failed to signal '{}'", self.program))
    }

    /// Terminate the child: SIGTERM, a short grace period, then SIGKILL.
    pub fn stop(mut self) {
        let _ = self.signal(Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(200));
        let _ = self.signal(Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_run_command_captures_output() {
        let output = run_command("echo hello world", None).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello world");
    }

    #[test]
    fn test_run_command_nonzero_status() {
        let output = run_command("false", None).unwrap();
        assert!(!output.success());
    }

    #[test]
    fn test_run_command_timeout_kills() {
        let output = run_command("sleep 10", Some(Duration::from_millis(100))).unwrap();
        assert_eq!(output.status, TIMEOUT_STATUS);
    }

    #[test]
    fn test_empty_command_line_fails() {
        assert!(run_command("   ", None).is_err());
    }
}
