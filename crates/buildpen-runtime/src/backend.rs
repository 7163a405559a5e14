//! The capability contract every build environment implements.
//!
//! A `Backend` owns one disposable environment for one build: it is created
//! from an image, started, used to run commands and move files, and torn
//! down. Callers only ever see this trait; which isolation mechanism sits
//! behind it is chosen by name through [`make_backend`].

use crate::chroot::ChrootBackend;
use crate::fake::FakeBackend;
use crate::lxd::LxdBackend;
use crate::process::{run_command, to_argv};
use crate::{BackendError, ImageType, RuntimeConfig};
use std::fs::{File, OpenOptions};
use std::path::{Component, Path, PathBuf};

/// Identity of one build and the host paths derived from it.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub build_id: String,
    /// OS series the environment is based on, e.g. `jammy`.
    pub series: Option<String>,
    /// Target architecture tag, e.g. `amd64`.
    pub arch: Option<String>,
    /// Resource constraints requested for this build, e.g. `gpu-nvidia`.
    pub constraints: Vec<String>,
    home: PathBuf,
}

impl BuildSpec {
    pub fn new(build_id: impl Into<String>) -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
        Self {
            build_id: build_id.into(),
            series: None,
            arch: None,
            constraints: Vec::new(),
            home: PathBuf::from(home),
        }
    }

    pub fn with_series(mut self, series: impl Into<String>) -> Self {
        self.series = Some(series.into());
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_constraints(mut self, constraints: &[&str]) -> Self {
        self.constraints = constraints.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    /// Override the home directory that build state hangs off (tests).
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    /// Host directory holding everything belonging to this build.
    pub fn build_path(&self) -> PathBuf {
        self.home.join(format!("build-{}", self.build_id))
    }
}

/// Per-call options for [`Backend::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Working directory inside the environment.
    pub cwd: Option<String>,
    /// Extra environment variables, applied in order.
    pub env: Vec<(String, String)>,
    /// Bytes to feed to the command's stdin.
    pub input: Option<Vec<u8>>,
    /// Capture and return stdout instead of letting it pass through.
    pub get_output: bool,
    /// Echo the command (and captured output) to our own stdout.
    pub echo: bool,
}

impl RunOptions {
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn get_output(mut self) -> Self {
        self.get_output = true;
        self
    }

    pub fn echo(mut self) -> Self {
        self.echo = true;
        self
    }
}

/// How [`Backend::open`] should open the scoped local copy of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Truncate (or create) and write; copied back on close.
    Write,
    /// Append to the existing content; copied back on close.
    Append,
}

impl OpenMode {
    fn writes_back(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// One disposable build environment.
///
/// Methods returning `bool` are probes: any failure, including the
/// environment being unreachable, reads as `false`.
pub trait Backend: Send + Sync {
    fn spec(&self) -> &BuildSpec;

    fn build_path(&self) -> PathBuf {
        self.spec().build_path()
    }

    /// Unpack `image_path` so the environment can be started.
    fn create(&self, image_path: &Path, image_type: ImageType) -> Result<(), BackendError>;

    /// Bring the environment to the point where commands can run in it.
    fn start(&self) -> Result<(), BackendError>;

    /// Run a command inside the environment.
    ///
    /// Returns captured stdout when `options.get_output` is set, an empty
    /// buffer otherwise.
    fn run(&self, args: &[String], options: &RunOptions) -> Result<Vec<u8>, BackendError>;

    /// Copy a host file into the environment, owned by root with the source
    /// file's permission bits.
    fn copy_in(&self, source_path: &Path, target_path: &str) -> Result<(), BackendError>;

    /// Copy a file out of the environment, owned by the invoking user.
    fn copy_out(&self, source_path: &str, target_path: &Path) -> Result<(), BackendError>;

    fn path_exists(&self, path: &str) -> bool {
        let argv = to_argv(&["test", "-e", path]);
        self.run(&argv, &RunOptions::default()).is_ok()
    }

    fn isdir(&self, path: &str) -> bool {
        let argv = to_argv(&["test", "-d", path]);
        self.run(&argv, &RunOptions::default()).is_ok()
    }

    fn islink(&self, path: &str) -> bool {
        let argv = to_argv(&["test", "-h", path]);
        self.run(&argv, &RunOptions::default()).is_ok()
    }

    /// List paths under `path`, relative to it, in no promised order.
    fn find(
        &self,
        path: &str,
        max_depth: Option<u32>,
        include_directories: bool,
        name: Option<&str>,
    ) -> Result<Vec<String>, BackendError> {
        let mut argv = to_argv(&["find", path, "-mindepth", "1"]);
        if let Some(max_depth) = max_depth {
            argv.push("-maxdepth".to_owned());
            argv.push(max_depth.to_string());
        }
        if !include_directories {
            argv.extend(to_argv(&["!", "-type", "d"]));
        }
        if let Some(name) = name {
            argv.push("-name".to_owned());
            argv.push(name.to_owned());
        }
        // NUL-separated relative paths; file names may contain newlines.
        argv.push("-printf".to_owned());
        argv.push("%P\\0".to_owned());

        let options = RunOptions::default().get_output();
        let output = self.run(&argv, &options)?;
        Ok(output
            .split(|b| *b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect())
    }

    /// Names of the direct children of `path`.
    fn listdir(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.find(path, Some(1), true, None)
    }

    /// Whether `package` is known to the environment's apt cache.
    fn is_package_available(&self, package: &str) -> bool {
        let argv = to_argv(&["apt-cache", "show", package]);
        let options = RunOptions::default().get_output();
        match self.run(&argv, &options) {
            Ok(output) => {
                let wanted = format!("Package: {package}");
                String::from_utf8_lossy(&output)
                    .lines()
                    .any(|line| line == wanted)
            }
            // A virtual or unknown package makes apt-cache fail; either way
            // it is not installable by name.
            Err(_) => false,
        }
    }

    /// Kill any processes still running inside the environment.
    fn kill_processes(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Undo `start`, releasing host resources the environment held.
    fn stop(&self) -> Result<(), BackendError>;

    /// Undo `create`, removing all host state belonging to the build.
    fn remove(&self) -> Result<(), BackendError> {
        remove_build_path(self.spec())
    }

    /// Open a file inside the environment through a scoped local copy.
    ///
    /// The file is staged in a private temporary directory, handed to `body`,
    /// and for writable modes copied back afterwards whether or not `body`
    /// succeeded. The temporary copy is always cleaned up.
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        body: &mut dyn FnMut(&mut File) -> Result<(), BackendError>,
    ) -> Result<(), BackendError> {
        let tmp_dir = tempfile::tempdir()?;
        let base_name = Path::new(path)
            .file_name()
            .ok_or_else(|| BackendError::InvalidBuildFilePath(path.to_owned()))?;
        let local_path = tmp_dir.path().join(base_name);

        if self.path_exists(path) {
            self.copy_out(path, &local_path)?;
        }

        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.read(true).write(true).create(true).truncate(true),
            OpenMode::Append => options.read(true).append(true).create(true),
        };
        let mut file = options.open(&local_path)?;

        let result = body(&mut file);
        drop(file);

        if mode.writes_back() {
            // Copy back even if the body failed part way; a partial config
            // file is more debuggable than a silently missing one. The
            // copy-back error wins over the body's.
            self.copy_in(&local_path, path)?;
        }
        result
    }
}

/// Remove the build directory; privileged because backends leave
/// root-owned files in it.
pub(crate) fn remove_build_path(spec: &BuildSpec) -> Result<(), BackendError> {
    let mut argv = to_argv(&["sudo", "rm", "-rf"]);
    argv.push(spec.build_path().to_string_lossy().into_owned());
    run_command(&argv, None, false)?;
    Ok(())
}

/// Join a caller-supplied environment path onto `base`, refusing any path
/// that would resolve outside it.
///
/// Components are resolved lexically, so `a/../b` is fine while `../x` or
/// enough `..` to climb out of `base` is rejected.
pub(crate) fn ensure_no_path_escape(base: &Path, path: &str) -> Result<PathBuf, BackendError> {
    let mut resolved = base.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() || !resolved.starts_with(base) {
                    return Err(BackendError::InvalidBuildFilePath(path.to_owned()));
                }
            }
            Component::Normal(name) => resolved.push(name),
            Component::RootDir | Component::Prefix(_) => {
                return Err(BackendError::InvalidBuildFilePath(path.to_owned()));
            }
        }
    }
    if resolved.starts_with(base) {
        Ok(resolved)
    } else {
        Err(BackendError::InvalidBuildFilePath(path.to_owned()))
    }
}

/// Construct a backend by name: `chroot`, `lxd`, or `fake`.
pub fn make_backend(name: &str, spec: BuildSpec) -> Result<Box<dyn Backend>, BackendError> {
    match name {
        "chroot" => Ok(Box::new(ChrootBackend::new(spec))),
        "lxd" => Ok(Box::new(LxdBackend::new(spec, RuntimeConfig::load_default()?)?)),
        "fake" => Ok(Box::new(FakeBackend::new(spec))),
        other => Err(BackendError::UnknownBackend(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_path_hangs_off_home() {
        let spec = BuildSpec::new("123").with_home("/home/buildd");
        assert_eq!(spec.build_path(), PathBuf::from("/home/buildd/build-123"));
    }

    #[test]
    fn path_escape_guard_accepts_interior_paths() {
        let base = Path::new("/home/buildd/build-1/chroot-autobuild");
        let resolved = ensure_no_path_escape(base, "/etc/hosts").unwrap();
        assert_eq!(resolved, base.join("etc/hosts"));
        let resolved = ensure_no_path_escape(base, "etc/../var/./log").unwrap();
        assert_eq!(resolved, base.join("var/log"));
    }

    #[test]
    fn path_escape_guard_rejects_climbing_out() {
        let base = Path::new("/home/buildd/build-1/chroot-autobuild");
        for path in ["../secret", "/../secret", "a/../../secret", "a/../.."] {
            assert!(
                matches!(
                    ensure_no_path_escape(base, path),
                    Err(BackendError::InvalidBuildFilePath(_))
                ),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn unknown_backend_name_is_an_error() {
        let spec = BuildSpec::new("1");
        assert!(matches!(
            make_backend("docker", spec),
            Err(BackendError::UnknownBackend(_))
        ));
    }
}
