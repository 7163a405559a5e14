//! Chroot backend: a rootfs tarball unpacked on the host, entered with
//! `sudo chroot`, with the usual virtual filesystems mounted on top.

use crate::backend::{ensure_no_path_escape, Backend, BuildSpec, RunOptions};
use crate::process::{run_command, to_argv};
use crate::{BackendError, ImageType};
use buildpen_util::{escape_args, set_personality, shell_escape};
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Virtual filesystems mounted inside the chroot after unpacking:
/// (fstype, options, source, target relative to the chroot).
const CHROOT_MOUNTS: &[(&str, Option<&str>, Option<&str>, &str)] = &[
    ("proc", None, None, "proc"),
    ("devpts", Some("gid=5,mode=620"), None, "dev/pts"),
    ("sysfs", None, None, "sys"),
    ("tmpfs", None, None, "dev/shm"),
];

/// Host files copied in so name resolution works inside the chroot.
const NETWORK_FILES: &[&str] = &["/etc/hosts", "/etc/hostname", "/etc/resolv.conf"];

const UNMOUNT_PASSES: usize = 20;

pub struct ChrootBackend {
    spec: BuildSpec,
    chroot_path: PathBuf,
}

impl ChrootBackend {
    pub fn new(spec: BuildSpec) -> Self {
        let chroot_path = spec.build_path().join("chroot-autobuild");
        Self { spec, chroot_path }
    }

    pub fn chroot_path(&self) -> &Path {
        &self.chroot_path
    }

    fn chroot_path_string(&self) -> String {
        self.chroot_path.to_string_lossy().into_owned()
    }

    /// The full host argv for running `args` inside the chroot.
    fn build_run_argv(
        &self,
        args: &[String],
        options: &RunOptions,
    ) -> Result<Vec<String>, BackendError> {
        let mut args = args.to_vec();
        if !options.env.is_empty() {
            let mut wrapped = vec!["env".to_owned()];
            for (key, value) in &options.env {
                wrapped.push(format!("{key}={value}"));
            }
            wrapped.extend(args);
            args = wrapped;
        }
        if let Some(arch) = self.spec.arch.as_deref() {
            args = set_personality(&args, arch, self.spec.series.as_deref())?;
        }
        if let Some(cwd) = options.cwd.as_deref() {
            // chroot(8) has no way to set the working directory, so run
            // through a shell that changes it first.
            args = vec![
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                format!("cd {} && {}", shell_escape(cwd), escape_args(&args)),
            ];
        }
        let mut argv = to_argv(&["sudo", "/usr/sbin/chroot"]);
        argv.push(self.chroot_path_string());
        argv.extend(args);
        Ok(argv)
    }

    fn mounts(&self) -> Result<Vec<String>, BackendError> {
        let table = std::fs::read_to_string("/proc/mounts")?;
        Ok(mounts_under(&table, &self.chroot_path_string()))
    }
}

impl Backend for ChrootBackend {
    fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    fn create(&self, image_path: &Path, image_type: ImageType) -> Result<(), BackendError> {
        if image_type != ImageType::Chroot {
            return Err(BackendError::UnhandledImageType(image_type.to_string()));
        }
        let build_path = self.build_path();
        std::fs::create_dir_all(&build_path)?;
        let mut argv = to_argv(&["sudo", "tar", "-C"]);
        argv.push(build_path.to_string_lossy().into_owned());
        argv.push("-xf".to_owned());
        argv.push(image_path.to_string_lossy().into_owned());
        run_command(&argv, None, false)?;
        Ok(())
    }

    fn start(&self) -> Result<(), BackendError> {
        for (fstype, mount_options, source, target) in CHROOT_MOUNTS {
            let mut argv = to_argv(&["sudo", "mount", "-t", fstype]);
            if let Some(mount_options) = mount_options {
                argv.push("-o".to_owned());
                argv.push((*mount_options).to_owned());
            }
            argv.push(source.unwrap_or("none").to_owned());
            argv.push(self.chroot_path.join(target).to_string_lossy().into_owned());
            run_command(&argv, None, false)?;
        }
        for file in NETWORK_FILES {
            let source = Path::new(file);
            if source.exists() {
                self.copy_in(source, file)?;
            }
        }
        Ok(())
    }

    fn run(&self, args: &[String], options: &RunOptions) -> Result<Vec<u8>, BackendError> {
        let argv = self.build_run_argv(args, options)?;
        if options.echo {
            eprintln!("Running in chroot: {}", escape_args(&argv));
        }
        let output = run_command(&argv, options.input.as_deref(), options.get_output)?;
        if options.echo && options.get_output {
            eprintln!("Output:");
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(&output);
            let _ = stderr.flush();
        }
        Ok(output)
    }

    fn copy_in(&self, source_path: &Path, target_path: &str) -> Result<(), BackendError> {
        let mode = std::fs::metadata(source_path)?.permissions().mode() & 0o7777;
        let full_target = ensure_no_path_escape(&self.chroot_path, target_path)?;
        let mut argv = to_argv(&["sudo", "install", "-o", "root", "-g", "root", "-m"]);
        argv.push(format!("{mode:o}"));
        argv.push(source_path.to_string_lossy().into_owned());
        argv.push(full_target.to_string_lossy().into_owned());
        run_command(&argv, None, false)?;
        Ok(())
    }

    fn copy_out(&self, source_path: &str, target_path: &Path) -> Result<(), BackendError> {
        let full_source = ensure_no_path_escape(&self.chroot_path, source_path)?;
        let mut argv = to_argv(&["sudo", "cp", "--preserve=timestamps"]);
        argv.push(full_source.to_string_lossy().into_owned());
        argv.push(target_path.to_string_lossy().into_owned());
        run_command(&argv, None, false)?;

        let mut argv = to_argv(&["sudo", "chown"]);
        argv.push(format!("{}:{}", current_uid(), current_gid()));
        argv.push(target_path.to_string_lossy().into_owned());
        run_command(&argv, None, false)?;
        Ok(())
    }

    /// Kill everything whose root directory is inside the chroot, repeating
    /// until a full scan of /proc finds nothing (killed processes may have
    /// been holding children alive).
    fn kill_processes(&self) -> Result<(), BackendError> {
        let prefix = self
            .chroot_path
            .canonicalize()
            .unwrap_or_else(|_| self.chroot_path.clone());
        let prefix = prefix.to_string_lossy().into_owned();
        loop {
            let mut found = false;
            for entry in std::fs::read_dir("/proc")? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
                    continue;
                };
                // The process may exit between listing and readlink.
                let Ok(root) = std::fs::read_link(format!("/proc/{pid}/root")) else {
                    continue;
                };
                let root = root.to_string_lossy();
                if root == prefix || root.starts_with(&format!("{prefix}/")) {
                    debug!("killing left-over process {pid} rooted in {prefix}");
                    kill_process(pid);
                    found = true;
                }
            }
            if !found {
                break;
            }
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), BackendError> {
        let chroot_path = self.chroot_path_string();
        let clean = unmount_all(
            &mut || self.mounts(),
            &mut |mount_path| {
                let argv = to_argv(&["sudo", "umount", mount_path]);
                match run_command(&argv, None, false) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("umount {mount_path} failed: {e}");
                        false
                    }
                }
            },
            Duration::from_secs(1),
        )?;
        if !clean {
            // Show who is holding the mounts before giving up.
            let mut argv = to_argv(&["lsof"]);
            argv.push(chroot_path.clone());
            if let Err(e) = run_command(&argv, None, false) {
                debug!("lsof {chroot_path} failed: {e}");
            }
            return Err(BackendError::Failed(format!(
                "Failed to unmount {chroot_path}"
            )));
        }
        Ok(())
    }
}

/// Mount points from a /proc/mounts table that sit under `chroot_path`.
fn mounts_under(table: &str, chroot_path: &str) -> Vec<String> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|mount_path| mount_path.starts_with(chroot_path))
        .map(std::borrow::ToOwned::to_owned)
        .collect()
}

/// Unmount everything `list_mounts` reports, innermost first, retrying for
/// up to [`UNMOUNT_PASSES`] passes with `backoff` between failed passes.
///
/// Returns whether the tree ended up fully unmounted.
fn unmount_all(
    list_mounts: &mut dyn FnMut() -> Result<Vec<String>, BackendError>,
    unmount: &mut dyn FnMut(&str) -> bool,
    backoff: Duration,
) -> Result<bool, BackendError> {
    for _ in 0..UNMOUNT_PASSES {
        let mut mounts = list_mounts()?;
        if mounts.is_empty() {
            return Ok(true);
        }
        mounts.reverse();
        let mut failed = false;
        for mount_path in &mounts {
            if !unmount(mount_path) {
                failed = true;
            }
        }
        if failed {
            std::thread::sleep(backoff);
        }
    }
    Ok(list_mounts()?.is_empty())
}

/// Safe wrapper around libc::getuid().
#[allow(unsafe_code)]
fn current_uid() -> u32 {
    // SAFETY: getuid() is always safe — no arguments, no side effects, cannot fail.
    unsafe { libc::getuid() }
}

/// Safe wrapper around libc::getgid().
#[allow(unsafe_code)]
fn current_gid() -> u32 {
    // SAFETY: getgid() is always safe — no arguments, no side effects, cannot fail.
    unsafe { libc::getgid() }
}

/// Send SIGKILL, ignoring failure: the process may already be gone.
#[allow(unsafe_code)]
fn kill_process(pid: i32) {
    // SAFETY: kill() with a specific positive pid touches no memory; an
    // invalid pid just returns an error.
    let _ = unsafe { libc::kill(pid, libc::SIGKILL) };
}
