#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `vmfetch_cli` implements the thin command-line front-end for the
//! `vmfetch` binary. It recognises the option surface documented in
//! [`HELP_TEXT`], folds the parsed options into a
//! [`vmfetch_core::Config`], acquires the remote password, and delegates
//! the actual work to [`vmfetch_core::run`].
//!
//! # Design
//!
//! The crate exposes [`run`] as the primary entry point. The function
//! accepts an iterator of arguments together with handles for standard
//! output and error, so the whole surface is testable without spawning the
//! binary. Internally a [`clap`](https://docs.rs/clap/) command definition
//! with the builtin help and version handling disabled performs the parse;
//! help and version output come from deterministic constants instead.
//!
//! # Invariants
//!
//! - `run` never panics; failures surface as non-zero exit codes with one
//!   human-readable line on the error stream.
//! - Usage errors are reported before any filesystem or network activity.
//! - The password is read at most once, after option validation, and is
//!   handed to the core as a zeroizing [`Secret`].
//!
//! # Examples
//!
//! ```
//! use vmfetch_cli::run;
//!
//! let mut stdout = Vec::new();
//! let mut stderr = Vec::new();
//! let code = run(["vmfetch", "--version"], &mut stdout, &mut stderr);
//!
//! assert_eq!(code, 0);
//! assert!(!stdout.is_empty());
//! assert!(stderr.is_empty());
//! ```

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use is_terminal::IsTerminal;

use vmfetch_core::{Config, ImageType, RunSummary};
use vmfetch_transfer::{Programs, Protocol, RemoteEndpoint, Secret};

/// Maximum exit code representable by a Unix process.
const MAX_EXIT_CODE: i32 = u8::MAX as i32;

/// Deterministic help text describing the CLI surface.
const HELP_TEXT: &str = concat!(
    "vmfetch ",
    env!("CARGO_PKG_VERSION"),
    "\n",
    "\n",
    "Usage: vmfetch [OPTIONS] <kvm|vmware|vhd>\n",
    "\n",
    "Fetches the newest matching virtual-machine build image from the\n",
    "build server into a daily snapshot directory, keeping a rolling\n",
    "window of recent snapshots. The first download mirrors the whole\n",
    "build with scp; later downloads synchronise incrementally with\n",
    "rsync. The remote password is read from the terminal, from piped\n",
    "standard input, or from --password-file.\n",
    "\n",
    "  -h, --help             Show this help message and exit.\n",
    "  -V, --version          Output version information and exit.\n",
    "  -n, --dry-run          Locate the remote build, then stop without\n",
    "                         transferring anything.\n",
    "  -v, --verbose          Raise log verbosity (repeatable).\n",
    "      --branch=NAME      Build fork or version to fetch (default: master).\n",
    "      --build-dir=DIR    Sub-directory of the build holding the images\n",
    "                         (default: images).\n",
    "      --dest=DIR         Destination root for snapshots; must exist\n",
    "                         (default: current directory).\n",
    "      --source=DIR       Remote directory holding the build directories\n",
    "                         (default: /srv/builds).\n",
    "      --keep=N           Snapshots to retain, N >= 1 (default: 7).\n",
    "      --user=NAME        Remote user (default: the invoking user).\n",
    "      --host=HOST        Build server host (required).\n",
    "      --protocol=P       Force 'rsync' or 'scp' instead of automatic\n",
    "                         selection.\n",
    "      --password-file=F  Read the password from the first line of F.\n",
    "      --rsh=CMD          Remote-shell program for the listing and as\n",
    "                         rsync's transport (default: ssh).\n",
    "      --rsync-program=CMD  Incremental transfer program (default: rsync).\n",
    "      --scp-program=CMD    First-time mirror program (default: scp).\n",
);

/// Parsed command produced by [`parse_args`].
#[derive(Debug, Default)]
struct ParsedArgs {
    show_help: bool,
    show_version: bool,
    dry_run: bool,
    verbose: u8,
    image: Option<String>,
    branch: Option<String>,
    build_dir: Option<String>,
    dest: Option<OsString>,
    source: Option<String>,
    keep: Option<String>,
    user: Option<String>,
    host: Option<String>,
    protocol: Option<String>,
    password_file: Option<OsString>,
    rsh: Option<String>,
    rsync_program: Option<String>,
    scp_program: Option<String>,
}

/// Builds the `clap` command used for parsing.
fn clap_command() -> Command {
    Command::new("vmfetch")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg_required_else_help(false)
        .arg(
            Arg::new("help")
                .long("help")
                .short('h')
                .help("Show this help message and exit.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .short('V')
                .help("Output version information and exit.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .short('n')
                .help("Locate the remote build, then stop without transferring.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Raise log verbosity (repeatable).")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("branch")
                .long("branch")
                .value_name("NAME")
                .help("Build fork or version to fetch."),
        )
        .arg(
            Arg::new("build-dir")
                .long("build-dir")
                .value_name("DIR")
                .help("Sub-directory of the build holding the images."),
        )
        .arg(
            Arg::new("dest")
                .long("dest")
                .value_name("DIR")
                .value_parser(clap::builder::OsStringValueParser::new())
                .help("Destination root for snapshots."),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .value_name("DIR")
                .help("Remote directory holding the build directories."),
        )
        .arg(
            Arg::new("keep")
                .long("keep")
                .value_name("N")
                .help("Snapshots to retain."),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .value_name("NAME")
                .help("Remote user."),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Build server host."),
        )
        .arg(
            Arg::new("protocol")
                .long("protocol")
                .value_name("P")
                .help("Force 'rsync' or 'scp'."),
        )
        .arg(
            Arg::new("password-file")
                .long("password-file")
                .value_name("FILE")
                .value_parser(clap::builder::OsStringValueParser::new())
                .help("Read the password from the first line of FILE."),
        )
        .arg(
            Arg::new("rsh")
                .long("rsh")
                .value_name("CMD")
                .help("Remote-shell program."),
        )
        .arg(
            Arg::new("rsync-program")
                .long("rsync-program")
                .value_name("CMD")
                .help("Incremental transfer program."),
        )
        .arg(
            Arg::new("scp-program")
                .long("scp-program")
                .value_name("CMD")
                .help("First-time mirror program."),
        )
        .arg(
            Arg::new("image")
                .value_name("IMAGE_TYPE")
                .help("Image format to fetch: kvm, vmware, or vhd."),
        )
}

/// Parses the provided arguments into a [`ParsedArgs`] value.
fn parse_args<I, S>(arguments: I) -> Result<ParsedArgs, String>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let arguments: Vec<OsString> = arguments.into_iter().map(Into::into).collect();
    let matches = clap_command()
        .try_get_matches_from(arguments)
        .map_err(|error| error.to_string().trim_end().to_string())?;

    Ok(ParsedArgs {
        show_help: matches.get_flag("help"),
        show_version: matches.get_flag("version"),
        dry_run: matches.get_flag("dry-run"),
        verbose: matches.get_count("verbose"),
        image: matches.get_one::<String>("image").cloned(),
        branch: matches.get_one::<String>("branch").cloned(),
        build_dir: matches.get_one::<String>("build-dir").cloned(),
        dest: matches.get_one::<OsString>("dest").cloned(),
        source: matches.get_one::<String>("source").cloned(),
        keep: matches.get_one::<String>("keep").cloned(),
        user: matches.get_one::<String>("user").cloned(),
        host: matches.get_one::<String>("host").cloned(),
        protocol: matches.get_one::<String>("protocol").cloned(),
        password_file: matches.get_one::<OsString>("password-file").cloned(),
        rsh: matches.get_one::<String>("rsh").cloned(),
        rsync_program: matches.get_one::<String>("rsync-program").cloned(),
        scp_program: matches.get_one::<String>("scp-program").cloned(),
    })
}

/// Resolves the invoking user's identity for the `--user` default.
fn default_user() -> Option<String> {
    #[cfg(unix)]
    if let Some(name) = uzers::get_current_username() {
        return Some(name.to_string_lossy().into_owned());
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
}

/// Converts parsed options into the immutable run configuration.
fn build_config(parsed: &ParsedArgs) -> Result<Config, String> {
    let image_text = parsed
        .image
        .as_deref()
        .ok_or_else(|| "missing image type; expected 'kvm', 'vmware', or 'vhd'".to_string())?;
    let image: ImageType = image_text
        .parse()
        .map_err(|error: vmfetch_core::ImageTypeParseError| error.to_string())?;

    let host = parsed
        .host
        .as_deref()
        .ok_or_else(|| "missing --host; the build server must be named".to_string())?;

    // Validate the remaining option values before consulting the
    // environment for the user default, so usage errors always win.
    let keep = parsed
        .keep
        .as_deref()
        .map(|keep| {
            keep.parse::<NonZeroUsize>()
                .map_err(|_| format!("--keep={keep} is invalid; expected a count of at least 1"))
        })
        .transpose()?;
    let protocol = parsed
        .protocol
        .as_deref()
        .map(|protocol| protocol.parse::<Protocol>().map_err(|error| error.to_string()))
        .transpose()?;

    let user = match parsed.user.as_deref() {
        Some(user) => user.to_string(),
        None => default_user()
            .ok_or_else(|| "cannot determine the invoking user; pass --user".to_string())?,
    };

    let mut builder = Config::builder(
        image,
        RemoteEndpoint::new(user, host.to_string()),
    )
    .dry_run(parsed.dry_run);

    if let Some(branch) = &parsed.branch {
        builder = builder.branch(branch.clone());
    }
    if let Some(build_dir) = &parsed.build_dir {
        builder = builder.build_dir(build_dir.clone());
    }
    if let Some(dest) = &parsed.dest {
        builder = builder.dest_root(PathBuf::from(dest));
    }
    if let Some(source) = &parsed.source {
        builder = builder.source_root(source.clone());
    }
    if let Some(keep) = keep {
        builder = builder.keep(keep);
    }
    if let Some(protocol) = protocol {
        builder = builder.protocol(protocol);
    }

    let mut programs = Programs::new();
    if let Some(rsh) = &parsed.rsh {
        programs = programs.with_ssh(rsh.clone());
    }
    if let Some(rsync) = &parsed.rsync_program {
        programs = programs.with_rsync(rsync.clone());
    }
    if let Some(scp) = &parsed.scp_program {
        programs = programs.with_scp(scp.clone());
    }
    builder = builder.programs(programs);

    Ok(builder.build())
}

/// Reads the remote password.
///
/// `--password-file` wins; otherwise a terminal prompts without echo and a
/// pipe supplies its first line. An empty line means no password, which is
/// how key-based setups opt out.
fn acquire_secret(parsed: &ParsedArgs) -> io::Result<Option<Secret>> {
    if let Some(path) = &parsed.password_file {
        let file = File::open(path)?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line)?;
        return Ok(non_empty_secret(line));
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        let line = rpassword::prompt_password("Password: ")?;
        return Ok(non_empty_secret(line));
    }

    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(non_empty_secret(line))
}

fn non_empty_secret(mut line: String) -> Option<Secret> {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    if line.is_empty() {
        None
    } else {
        Some(Secret::new(line))
    }
}

/// Installs the tracing subscriber for this process.
///
/// Repeated initialisation (as happens across in-process tests) is not an
/// error; later calls keep the first subscriber.
fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn summarize<Out: Write>(summary: &RunSummary, stdout: &mut Out) -> io::Result<()> {
    if summary.dry_run() {
        writeln!(
            stdout,
            "would fetch {} via {} into {}",
            summary.build(),
            summary.protocol(),
            summary.snapshot_dir().display()
        )
    } else {
        writeln!(
            stdout,
            "fetched {} via {} into {} ({} copied, {} unchanged, {} evicted)",
            summary.build(),
            summary.protocol(),
            summary.snapshot_dir().display(),
            summary.copied(),
            summary.skipped(),
            summary.evicted()
        )
    }
}

/// Runs the CLI against the provided arguments and stream handles.
///
/// Returns the process exit code: `0` on success, `1` for usage and
/// environment errors, and the transfer subprocess's own code when a
/// transfer fails.
pub fn run<I, S, Out, Err>(arguments: I, stdout: &mut Out, stderr: &mut Err) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
    Out: Write,
    Err: Write,
{
    let parsed = match parse_args(arguments) {
        Ok(parsed) => parsed,
        Err(error) => {
            let _ = writeln!(stderr, "vmfetch: {error}");
            return 1;
        }
    };

    if parsed.show_help {
        let _ = stdout.write_all(HELP_TEXT.as_bytes());
        return 0;
    }
    if parsed.show_version {
        let _ = writeln!(stdout, "vmfetch {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let config = match build_config(&parsed) {
        Ok(config) => config,
        Err(error) => {
            let _ = writeln!(stderr, "vmfetch: {error}");
            return 1;
        }
    };

    init_tracing(parsed.verbose);

    let secret = match acquire_secret(&parsed) {
        Ok(secret) => secret,
        Err(error) => {
            let _ = writeln!(stderr, "vmfetch: failed to read the password: {error}");
            return 1;
        }
    };

    match vmfetch_core::run(&config, secret.as_ref()) {
        Ok(summary) => {
            let _ = summarize(&summary, stdout);
            0
        }
        Err(error) => {
            let _ = writeln!(stderr, "vmfetch: {error}");
            error.exit_code()
        }
    }
}

/// Converts a numeric exit code into an [`std::process::ExitCode`].
#[must_use]
pub fn exit_code_from(status: i32) -> std::process::ExitCode {
    let clamped = status.clamp(0, MAX_EXIT_CODE);
    std::process::ExitCode::from(clamped as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_cli(arguments: &[&str]) -> (i32, String, String) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = run(arguments.iter().copied(), &mut stdout, &mut stderr);
        (
            code,
            String::from_utf8(stdout).expect("stdout utf8"),
            String::from_utf8(stderr).expect("stderr utf8"),
        )
    }

    #[test]
    fn help_prints_the_static_text() {
        let (code, stdout, stderr) = run_cli(&["vmfetch", "--help"]);
        assert_eq!(code, 0);
        assert!(stdout.contains("Usage: vmfetch"));
        assert!(stdout.contains("--keep=N"));
        assert!(stderr.is_empty());
    }

    #[test]
    fn version_prints_the_package_version() {
        let (code, stdout, _) = run_cli(&["vmfetch", "-V"]);
        assert_eq!(code, 0);
        assert!(stdout.starts_with("vmfetch "));
        assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn unknown_image_type_is_a_usage_error() {
        let (code, stdout, stderr) = run_cli(&["vmfetch", "docker", "--host", "build-host"]);
        assert_eq!(code, 1);
        assert!(stdout.is_empty());
        assert!(stderr.contains("unknown image type 'docker'"));
    }

    #[test]
    fn missing_image_type_is_a_usage_error() {
        let (code, _, stderr) = run_cli(&["vmfetch", "--host", "build-host"]);
        assert_eq!(code, 1);
        assert!(stderr.contains("missing image type"));
    }

    #[test]
    fn missing_host_is_a_usage_error() {
        let (code, _, stderr) = run_cli(&["vmfetch", "kvm"]);
        assert_eq!(code, 1);
        assert!(stderr.contains("--host"));
    }

    #[test]
    fn unknown_option_is_a_usage_error() {
        let (code, _, stderr) = run_cli(&["vmfetch", "kvm", "--frobnicate"]);
        assert_eq!(code, 1);
        assert!(stderr.contains("vmfetch:"));
    }

    #[test]
    fn zero_keep_is_a_usage_error() {
        let (code, _, stderr) =
            run_cli(&["vmfetch", "kvm", "--host", "build-host", "--keep", "0"]);
        assert_eq!(code, 1);
        assert!(stderr.contains("--keep=0 is invalid"));
    }

    #[test]
    fn bad_protocol_is_a_usage_error() {
        let (code, _, stderr) = run_cli(&[
            "vmfetch",
            "kvm",
            "--host",
            "build-host",
            "--protocol",
            "ftp",
        ]);
        assert_eq!(code, 1);
        assert!(stderr.contains("unknown transfer protocol 'ftp'"));
    }

    #[test]
    fn parse_collects_every_option() {
        let parsed = parse_args([
            "vmfetch",
            "-n",
            "-vv",
            "--branch",
            "sle15",
            "--build-dir",
            "images",
            "--dest",
            "/var/images",
            "--source",
            "/srv/builds",
            "--keep",
            "5",
            "--user",
            "builder",
            "--host",
            "build-host",
            "--protocol",
            "rsync",
            "--rsh",
            "ssh-wrapper",
            "vmware",
        ])
        .expect("parse");

        assert!(parsed.dry_run);
        assert_eq!(parsed.verbose, 2);
        assert_eq!(parsed.image.as_deref(), Some("vmware"));
        assert_eq!(parsed.branch.as_deref(), Some("sle15"));
        assert_eq!(parsed.keep.as_deref(), Some("5"));
        assert_eq!(parsed.protocol.as_deref(), Some("rsync"));
        assert_eq!(parsed.rsh.as_deref(), Some("ssh-wrapper"));
    }

    #[test]
    fn build_config_applies_defaults_and_overrides() {
        let parsed = parse_args([
            "vmfetch",
            "kvm",
            "--host",
            "build-host",
            "--user",
            "builder",
            "--dest",
            "/var/images",
        ])
        .expect("parse");
        let config = build_config(&parsed).expect("config");

        assert_eq!(config.image(), ImageType::Kvm);
        assert_eq!(config.endpoint().to_string(), "builder@build-host");
        assert_eq!(config.branch(), "master");
        assert_eq!(config.keep().get(), 7);
        assert_eq!(config.dest_root(), std::path::Path::new("/var/images"));
    }

    #[test]
    fn secret_lines_are_trimmed_of_line_endings() {
        assert!(non_empty_secret(String::new()).is_none());
        assert!(non_empty_secret("\n".to_string()).is_none());
        let secret = non_empty_secret("hunter2\r\n".to_string()).expect("secret");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn exit_codes_are_clamped_to_u8_range() {
        let rendered = |status: i32| format!("{:?}", exit_code_from(status));
        assert_eq!(rendered(0), format!("{:?}", std::process::ExitCode::from(0)));
        assert_eq!(rendered(23), format!("{:?}", std::process::ExitCode::from(23)));
        assert_eq!(rendered(-1), format!("{:?}", std::process::ExitCode::from(0)));
        assert_eq!(rendered(400), format!("{:?}", std::process::ExitCode::from(255)));
    }
}
