//! Exit-code integration tests driving the real `vmfetch` binary.
//!
//! | Code | Condition                                         |
//! |------|---------------------------------------------------|
//! |  0   | Success, `--help`, `--version`, dry run           |
//! |  1   | Usage error, missing destination, no build match  |
//! |  N   | Transfer subprocess exited with code N            |
//!
//! Remote activity is faked with small shell scripts injected through the
//! `--rsh`/`--scp-program`/`--rsync-program` overrides, so the tests need
//! neither a network nor the real transfer tools.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

fn vmfetch() -> Command {
    Command::cargo_bin("vmfetch").expect("vmfetch binary must be available")
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[test]
fn help_and_version_exit_zero() {
    vmfetch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: vmfetch"));

    vmfetch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("vmfetch "));
}

#[test]
fn unsupported_image_type_is_a_usage_error_without_side_effects() {
    let temp = tempfile::tempdir().expect("tempdir");

    vmfetch()
        .args(["docker", "--host", "build-host"])
        .args(["--dest".as_ref(), temp.path().as_os_str()])
        .write_stdin("")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown image type 'docker'"));

    assert!(is_empty_dir(temp.path()));
}

#[test]
fn zero_keep_is_a_usage_error() {
    vmfetch()
        .args(["kvm", "--host", "build-host", "--keep", "0"])
        .write_stdin("")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--keep=0 is invalid"));
}

#[test]
fn missing_destination_fails_before_any_transfer() {
    let temp = tempfile::tempdir().expect("tempdir");
    let absent = temp.path().join("no-such-dir");

    vmfetch()
        .args(["kvm", "--host", "build-host", "--user", "builder"])
        .args(["--dest".as_ref(), absent.as_os_str()])
        .write_stdin("")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

#[cfg(unix)]
mod with_fake_remote {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        _temp: tempfile::TempDir,
        dest: PathBuf,
        bin: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let dest = temp.path().join("images");
            let bin = temp.path().join("bin");
            fs::create_dir(&dest).expect("dest");
            fs::create_dir(&bin).expect("bin");
            Self {
                _temp: temp,
                dest,
                bin,
            }
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            let path = self.bin.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
            path
        }

        fn listing(&self) -> PathBuf {
            self.script(
                "fake-ssh",
                "printf '1754300000 /srv/builds/master-kvm-0807\\n'",
            )
        }

        fn mirror(&self) -> PathBuf {
            self.script(
                "fake-scp",
                "for staging; do :; done\n\
                 mkdir -p \"$staging\"\n\
                 printf 'image-data' > \"$staging/disk.img\"",
            )
        }
    }

    #[test]
    fn dry_run_reports_the_build_and_touches_nothing() {
        let fixture = Fixture::new();

        vmfetch()
            .args(["kvm", "--host", "build-host", "--user", "builder", "-n"])
            .args(["--dest".as_ref(), fixture.dest.as_os_str()])
            .args(["--rsh".as_ref(), fixture.listing().as_os_str()])
            .write_stdin("")
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "would fetch /srv/builds/master-kvm-0807/images via scp",
            ));

        assert!(is_empty_dir(&fixture.dest));
    }

    #[test]
    fn first_fetch_creates_a_daily_snapshot() {
        let fixture = Fixture::new();

        vmfetch()
            .args(["kvm", "--host", "build-host", "--user", "builder"])
            .args(["--build-dir", ""])
            .args(["--dest".as_ref(), fixture.dest.as_os_str()])
            .args(["--rsh".as_ref(), fixture.listing().as_os_str()])
            .args(["--scp-program".as_ref(), fixture.mirror().as_os_str()])
            .write_stdin("")
            .assert()
            .success()
            .stdout(predicate::str::contains("via scp"));

        let snapshots: Vec<_> = fs::read_dir(&fixture.dest)
            .expect("read dest")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        assert_eq!(snapshots.len(), 1);
        let image = fixture.dest.join(&snapshots[0]).join("disk.img");
        assert_eq!(fs::read(image).expect("image"), b"image-data");
    }

    #[test]
    fn no_matching_build_exits_one() {
        let fixture = Fixture::new();
        let listing = fixture.script(
            "fake-ssh",
            "printf '1754300000 /srv/builds/master-vhd-0807\\n'",
        );

        vmfetch()
            .args(["kvm", "--host", "build-host", "--user", "builder"])
            .args(["--dest".as_ref(), fixture.dest.as_os_str()])
            .args(["--rsh".as_ref(), listing.as_os_str()])
            .write_stdin("")
            .assert()
            .code(1)
            .stderr(predicate::str::contains("no build matching"));

        assert!(is_empty_dir(&fixture.dest));
    }

    #[test]
    fn transfer_failure_forwards_the_subprocess_exit_code() {
        let fixture = Fixture::new();
        let failing = fixture.script("fake-scp", "exit 7");

        vmfetch()
            .args(["kvm", "--host", "build-host", "--user", "builder"])
            .args(["--build-dir", ""])
            .args(["--dest".as_ref(), fixture.dest.as_os_str()])
            .args(["--rsh".as_ref(), fixture.listing().as_os_str()])
            .args(["--scp-program".as_ref(), failing.as_os_str()])
            .write_stdin("")
            .assert()
            .code(7)
            .stderr(predicate::str::contains("transfer failed"));
    }

    #[test]
    fn forced_rsync_protocol_is_used_on_a_first_fetch() {
        let fixture = Fixture::new();
        let incremental = fixture.script(
            "fake-rsync",
            "for staging; do :; done\n\
             mkdir -p \"$staging\"\n\
             printf 'image-data' > \"$staging/disk.img\"",
        );

        vmfetch()
            .args(["kvm", "--host", "build-host", "--user", "builder"])
            .args(["--build-dir", "", "--protocol", "rsync"])
            .args(["--dest".as_ref(), fixture.dest.as_os_str()])
            .args(["--rsh".as_ref(), fixture.listing().as_os_str()])
            .args(["--rsync-program".as_ref(), incremental.as_os_str()])
            .write_stdin("")
            .assert()
            .success()
            .stdout(predicate::str::contains("via rsync"));
    }
}
