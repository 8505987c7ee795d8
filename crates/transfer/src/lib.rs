#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `vmfetch_transfer` owns every subprocess this tool runs: the `ssh`
//! listing command, the first-time `scp` mirror, and the incremental
//! `rsync`. Reimplementing any of those protocols is an explicit non-goal;
//! this crate only builds the command lines, feeds the remote password to
//! the child, and turns exit statuses into errors the run can forward.
//!
//! # Design
//!
//! - [`RemoteEndpoint`] and [`Programs`] describe where to connect and which
//!   binaries to run; both are plain data so command construction is
//!   testable without spawning anything.
//! - The password travels in a [`Secret`] (zeroized on drop) and is written
//!   exactly once to the child's standard input, after which the pipe is
//!   closed. It never appears in argv or the environment, so `ps` and crash
//!   dumps cannot leak it.
//! - Children are held in a guard that kills and reaps the process if the
//!   caller unwinds before the child finishes.
//!
//! # Errors
//!
//! [`TransferError`] distinguishes launch failures from non-zero exits. A
//! non-zero child exit carries the child's code and
//! [`TransferError::exit_code`] forwards it verbatim, which is how transfer
//! failures become the run's own exit code.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;

use tracing::debug;
use zeroize::Zeroizing;

/// Remote password held in memory that is wiped on drop.
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wraps a password read from the terminal, stdin, or a file.
    #[must_use]
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    /// Exposes the password for the single write to a child's stdin.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(…)")
    }
}

/// Transfer protocol used to populate the staging area.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    /// Incremental synchronisation; only changed blocks travel.
    Rsync,
    /// Full first-time mirror of the remote build directory.
    Scp,
}

impl Protocol {
    /// Returns the protocol's command-line name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::Scp => "scp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "rsync" => Ok(Self::Rsync),
            "scp" => Ok(Self::Scp),
            other => Err(ProtocolParseError {
                value: other.to_string(),
            }),
        }
    }
}

/// Error returned when a protocol name is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown transfer protocol '{value}', expected 'rsync' or 'scp'")]
pub struct ProtocolParseError {
    value: String,
}

/// Remote account and host the transfers connect to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteEndpoint {
    user: String,
    host: String,
}

impl RemoteEndpoint {
    /// Creates an endpoint for `user@host`.
    #[must_use]
    pub const fn new(user: String, host: String) -> Self {
        Self { user, host }
    }

    /// Returns the remote user name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the remote host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Renders `user@host:path` for scp/rsync operands.
    #[must_use]
    pub fn location(&self, path: &str) -> String {
        format!("{self}:{path}")
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Names of the external binaries the run invokes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Programs {
    ssh: String,
    rsync: String,
    scp: String,
}

impl Programs {
    /// Returns the conventional `ssh`/`rsync`/`scp` program set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ssh: "ssh".to_string(),
            rsync: "rsync".to_string(),
            scp: "scp".to_string(),
        }
    }

    /// Overrides the remote-shell program.
    #[must_use]
    pub fn with_ssh<S: Into<String>>(mut self, program: S) -> Self {
        self.ssh = program.into();
        self
    }

    /// Overrides the incremental-transfer program.
    #[must_use]
    pub fn with_rsync<S: Into<String>>(mut self, program: S) -> Self {
        self.rsync = program.into();
        self
    }

    /// Overrides the mirroring program.
    #[must_use]
    pub fn with_scp<S: Into<String>>(mut self, program: S) -> Self {
        self.scp = program.into();
        self
    }

    /// Returns the remote-shell program.
    #[must_use]
    pub fn ssh(&self) -> &str {
        &self.ssh
    }
}

impl Default for Programs {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the remote listing command.
///
/// The remote `find` prints one `<epoch-seconds> <path>` record per build
/// directory, which is the structured format `vmfetch_listing` parses.
#[must_use]
pub fn listing_command(
    programs: &Programs,
    endpoint: &RemoteEndpoint,
    source_root: &str,
) -> Command {
    let mut command = Command::new(&programs.ssh);
    command.arg(endpoint.to_string()).arg(format!(
        "find {} -mindepth 1 -maxdepth 1 -type d -printf '%T@ %p\\n'",
        shell_quote(source_root)
    ));
    command
}

/// Builds the transfer command that fills the staging area.
#[must_use]
pub fn fetch_command(
    protocol: Protocol,
    programs: &Programs,
    endpoint: &RemoteEndpoint,
    remote_build: &str,
    staging: &Path,
) -> Command {
    match protocol {
        Protocol::Rsync => {
            let mut command = Command::new(&programs.rsync);
            command
                .args(["-az", "--delete", "--partial", "-e"])
                .arg(&programs.ssh)
                .arg(endpoint.location(&format!("{remote_build}/")))
                .arg(staging);
            command
        }
        Protocol::Scp => {
            let mut command = Command::new(&programs.scp);
            command
                .arg("-rpq")
                .arg(endpoint.location(&format!("{remote_build}/.")))
                .arg(staging);
            command
        }
    }
}

/// Wraps `value` in single quotes for the remote shell.
fn shell_quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\\''");
    format!("'{escaped}'")
}

/// Runs a transfer command to completion, feeding the password once.
///
/// Standard output and error stay attached to the parent so transfer
/// progress lands in the scheduler's log file. A non-zero exit is an error
/// carrying the child's code.
pub fn run(mut command: Command, secret: Option<&Secret>) -> Result<(), TransferError> {
    let program = program_name(&command);
    debug!(%program, "spawning transfer subprocess");
    if secret.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    let child = command
        .spawn()
        .map_err(|source| TransferError::Spawn {
            program: program.clone(),
            source,
        })?;
    let mut guard = ChildGuard::new(child);
    guard.feed_secret(&program, secret)?;

    let status = guard.wait(&program)?;
    exit_ok(&program, status)
}

/// Runs the listing command and captures its standard output.
pub fn capture(mut command: Command, secret: Option<&Secret>) -> Result<String, TransferError> {
    let program = program_name(&command);
    debug!(%program, "spawning listing subprocess");
    if secret.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }
    command.stdout(Stdio::piped());

    let child = command
        .spawn()
        .map_err(|source| TransferError::Spawn {
            program: program.clone(),
            source,
        })?;
    let mut guard = ChildGuard::new(child);
    guard.feed_secret(&program, secret)?;

    let mut output = Vec::new();
    if let Some(stdout) = guard.child.stdout.as_mut() {
        stdout
            .read_to_end(&mut output)
            .map_err(|source| TransferError::Wait {
                program: program.clone(),
                source,
            })?;
    }

    let status = guard.wait(&program)?;
    exit_ok(&program, status)?;
    String::from_utf8(output).map_err(|_| TransferError::NonUtf8Output { program })
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

fn exit_ok(program: &str, status: ExitStatus) -> Result<(), TransferError> {
    if status.success() {
        Ok(())
    } else {
        Err(TransferError::Failed {
            program: program.to_string(),
            status,
        })
    }
}

/// Owns a spawned child, killing and reaping it if the run unwinds early.
struct ChildGuard {
    child: Child,
}

impl ChildGuard {
    const fn new(child: Child) -> Self {
        Self { child }
    }

    /// Writes the password and a newline to the child's stdin, then closes
    /// the pipe so the child sees EOF instead of a second prompt.
    fn feed_secret(&mut self, program: &str, secret: Option<&Secret>) -> Result<(), TransferError> {
        let Some(secret) = secret else {
            return Ok(());
        };
        let Some(mut stdin) = self.child.stdin.take() else {
            return Ok(());
        };
        let write = stdin
            .write_all(secret.expose().as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush());
        match write {
            Ok(()) => Ok(()),
            // The child exited without reading the password; its exit
            // status is the authoritative outcome.
            Err(error) if error.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            Err(source) => Err(TransferError::SecretWrite {
                program: program.to_string(),
                source,
            }),
        }
    }

    fn wait(&mut self, program: &str) -> Result<ExitStatus, TransferError> {
        self.child.wait().map_err(|source| TransferError::Wait {
            program: program.to_string(),
            source,
        })
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Error raised by a transfer or listing subprocess.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The program could not be launched.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// The password could not be written to the child.
    #[error("failed to write the password to {program}: {source}")]
    SecretWrite {
        /// Program whose stdin write failed.
        program: String,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// Waiting on the child failed.
    #[error("failed to wait for {program}: {source}")]
    Wait {
        /// Program that could not be reaped.
        program: String,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// The child exited with a non-zero status.
    #[error("{program} exited with {status}")]
    Failed {
        /// Program that failed.
        program: String,
        /// The child's exit status.
        status: ExitStatus,
    },
    /// The listing output was not valid UTF-8.
    #[error("{program} produced non-UTF-8 output")]
    NonUtf8Output {
        /// Program whose output could not be decoded.
        program: String,
    },
}

impl TransferError {
    /// Returns the process exit code the run should report.
    ///
    /// A failed child forwards its own code; every other failure is the
    /// generic error code `1`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Failed { status, .. } => status.code().unwrap_or(1),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn args_of(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    fn endpoint() -> RemoteEndpoint {
        RemoteEndpoint::new("builder".into(), "build-host".into())
    }

    #[test]
    fn protocol_parses_known_names() {
        assert_eq!("rsync".parse::<Protocol>().unwrap(), Protocol::Rsync);
        assert_eq!("scp".parse::<Protocol>().unwrap(), Protocol::Scp);
        assert!("ftp".parse::<Protocol>().is_err());
    }

    #[test]
    fn endpoint_renders_user_host_and_location() {
        let endpoint = endpoint();
        assert_eq!(endpoint.to_string(), "builder@build-host");
        assert_eq!(
            endpoint.location("/srv/builds/x"),
            "builder@build-host:/srv/builds/x"
        );
    }

    #[test]
    fn listing_command_uses_the_structured_find_format() {
        let command = listing_command(&Programs::new(), &endpoint(), "/srv/builds");
        assert_eq!(command.get_program(), OsStr::new("ssh"));
        let args = args_of(&command);
        assert_eq!(args[0], "builder@build-host");
        assert!(args[1].contains("find '/srv/builds'"));
        assert!(args[1].contains("-printf '%T@ %p\\n'"));
    }

    #[test]
    fn listing_command_quotes_awkward_source_roots() {
        let command = listing_command(&Programs::new(), &endpoint(), "/srv/my builds");
        let args = args_of(&command);
        assert!(args[1].contains("'/srv/my builds'"));
    }

    #[test]
    fn rsync_command_syncs_into_staging() {
        let command = fetch_command(
            Protocol::Rsync,
            &Programs::new(),
            &endpoint(),
            "/srv/builds/master-kvm-1",
            Path::new("/var/images/.staging"),
        );
        assert_eq!(command.get_program(), OsStr::new("rsync"));
        assert_eq!(
            args_of(&command),
            vec![
                "-az",
                "--delete",
                "--partial",
                "-e",
                "ssh",
                "builder@build-host:/srv/builds/master-kvm-1/",
                "/var/images/.staging",
            ]
        );
    }

    #[test]
    fn scp_command_mirrors_the_build_directory() {
        let command = fetch_command(
            Protocol::Scp,
            &Programs::new(),
            &endpoint(),
            "/srv/builds/master-kvm-1",
            Path::new("/var/images/.staging"),
        );
        assert_eq!(command.get_program(), OsStr::new("scp"));
        assert_eq!(
            args_of(&command),
            vec![
                "-rpq",
                "builder@build-host:/srv/builds/master-kvm-1/.",
                "/var/images/.staging",
            ]
        );
    }

    #[test]
    fn program_overrides_are_honoured() {
        let programs = Programs::new().with_rsync("/opt/rsync").with_ssh("ssh-wrapper");
        let command = fetch_command(
            Protocol::Rsync,
            &programs,
            &endpoint(),
            "/srv/b",
            Path::new("/tmp/s"),
        );
        assert_eq!(command.get_program(), OsStr::new("/opt/rsync"));
        assert!(args_of(&command).contains(&"ssh-wrapper".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn capture_feeds_the_secret_once_over_stdin() {
        let mut command = Command::new("sh");
        command.args(["-c", "read password; printf 'got:%s' \"$password\""]);
        let secret = Secret::new("sekret".to_string());
        let output = capture(command, Some(&secret)).expect("capture");
        assert_eq!(output, "got:sekret");
    }

    #[cfg(unix)]
    #[test]
    fn capture_without_secret_closes_stdin() {
        let mut command = Command::new("sh");
        command.args(["-c", "cat; printf 'done'"]);
        let output = capture(command, None).expect("capture");
        assert_eq!(output, "done");
    }

    #[cfg(unix)]
    #[test]
    fn failed_child_forwards_its_exit_code() {
        let mut command = Command::new("sh");
        command.args(["-c", "exit 23"]);
        let error = run(command, None).expect_err("non-zero exit");
        assert_eq!(error.exit_code(), 23);
        assert!(matches!(error, TransferError::Failed { .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let command = Command::new("/nonexistent/vmfetch-test-binary");
        let error = run(command, None).expect_err("spawn failure");
        assert!(matches!(error, TransferError::Spawn { .. }));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn secret_debug_never_prints_the_password() {
        let secret = Secret::new("hunter2".to_string());
        assert_eq!(format!("{secret:?}"), "Secret(…)");
    }
}
