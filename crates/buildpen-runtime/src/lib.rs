//! Build-environment backends for buildpen.
//!
//! This crate implements the isolation layer of the build farm: a pluggable
//! `Backend` trait covering lifecycle, command execution, and file transfer
//! for one build in one disposable environment, with two real implementations
//! (direct chroot with privileged helpers, and an LXD container driven over
//! the daemon API) plus a recording fake for tests.

pub mod backend;
pub mod chroot;
pub mod client;
pub mod config;
pub mod fake;
pub mod image;
pub mod lxd;
pub mod network;
mod process;

pub use backend::{make_backend, Backend, BuildSpec, OpenMode, RunOptions};
pub use config::RuntimeConfig;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("unhandled image type: {0}")]
    UnhandledImageType(String),
    #[error("invalid build file path: {0}")]
    InvalidBuildFilePath(String),
    #[error("command `{command}` failed with exit code {code}")]
    CommandFailed { command: String, code: i32 },
    /// A daemon API call failed; `action` says what we were trying to do.
    #[error("{action}: {message}")]
    Daemon { action: String, message: String },
    /// The backend could not complete a requested state transition.
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Personality(#[from] buildpen_util::PersonalityError),
    #[error("runtime config error: {0}")]
    Config(String),
}

/// On-disk image formats a backend can be created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// POSIX tarball containing a top-level `chroot-autobuild/` tree.
    Chroot,
    /// Combined metadata + rootfs tarball understood natively by LXD.
    Lxd,
}

impl std::str::FromStr for ImageType {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chroot" => Ok(Self::Chroot),
            "lxd" => Ok(Self::Lxd),
            other => Err(BackendError::UnhandledImageType(other.to_owned())),
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chroot => f.write_str("chroot"),
            Self::Lxd => f.write_str("lxd"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn image_type_parses_known_names() {
        assert_eq!(ImageType::from_str("chroot").unwrap(), ImageType::Chroot);
        assert_eq!(ImageType::from_str("lxd").unwrap(), ImageType::Lxd);
        assert!(ImageType::from_str("docker").is_err());
    }

    #[test]
    fn image_type_display_round_trips() {
        for ty in [ImageType::Chroot, ImageType::Lxd] {
            assert_eq!(ImageType::from_str(&ty.to_string()).unwrap(), ty);
        }
    }
}
