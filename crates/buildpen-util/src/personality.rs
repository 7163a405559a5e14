use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersonalityError {
    #[error("don't know how to deal with architecture {0}")]
    UnknownArchitecture(String),
}

/// Word size of the userspace for each architecture we build for.
///
/// x32 is an exception: the userspace is 32-bit, but it expects to be
/// running on a 64-bit kernel.
fn arch_bits(arch: &str) -> Result<u32, PersonalityError> {
    match arch {
        "armhf" | "i386" | "powerpc" => Ok(32),
        "amd64" | "arm64" | "ppc64el" | "riscv64" | "s390x" | "x32" => Ok(64),
        other => Err(PersonalityError::UnknownArchitecture(other.to_owned())),
    }
}

/// OS releases old enough that their toolchains refuse to run unless the
/// kernel claims to be 2.6.
const LEGACY_SERIES: &[&str] = &["hardy", "lucid", "maverick", "natty", "oneiric", "precise"];

/// Prefix a command vector with the personality wrapper for `arch`.
///
/// Commands run under `linux32` or `linux64` so that the build sees the
/// right machine architecture, plus `--uname-2.6` for legacy releases.
pub fn set_personality(
    args: &[String],
    arch: &str,
    series: Option<&str>,
) -> Result<Vec<String>, PersonalityError> {
    let mut cmd = match arch_bits(arch)? {
        32 => vec!["linux32".to_owned()],
        _ => vec!["linux64".to_owned()],
    };
    if let Some(series) = series {
        if LEGACY_SERIES.contains(&series) {
            cmd.push("--uname-2.6".to_owned());
        }
    }
    cmd.extend(args.iter().cloned());
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Vec<String> {
        vec!["true".to_owned()]
    }

    #[test]
    fn every_known_arch_gets_exactly_one_prefix() {
        for (arch, prefix) in [
            ("amd64", "linux64"),
            ("arm64", "linux64"),
            ("armhf", "linux32"),
            ("i386", "linux32"),
            ("powerpc", "linux32"),
            ("ppc64el", "linux64"),
            ("riscv64", "linux64"),
            ("s390x", "linux64"),
            ("x32", "linux64"),
        ] {
            let cmd = set_personality(&args(), arch, Some("jammy")).unwrap();
            assert_eq!(cmd, vec![prefix.to_owned(), "true".to_owned()], "{arch}");
        }
    }

    #[test]
    fn legacy_series_adds_uname_flag() {
        for series in ["hardy", "lucid", "maverick", "natty", "oneiric", "precise"] {
            let cmd = set_personality(&args(), "i386", Some(series)).unwrap();
            assert_eq!(cmd, vec!["linux32", "--uname-2.6", "true"]);
        }
    }

    #[test]
    fn modern_series_has_no_uname_flag() {
        let cmd = set_personality(&args(), "amd64", Some("xenial")).unwrap();
        assert_eq!(cmd, vec!["linux64", "true"]);
        let cmd = set_personality(&args(), "amd64", None).unwrap();
        assert_eq!(cmd, vec!["linux64", "true"]);
    }

    #[test]
    fn unknown_architecture_is_an_error() {
        assert!(set_personality(&args(), "m68k", None).is_err());
    }
}
