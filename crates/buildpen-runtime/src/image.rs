//! Conversion of plain chroot tarballs into LXD-importable images.
//!
//! A chroot image is a tarball with everything under a top-level
//! `chroot-autobuild/` directory. LXD wants a `metadata.yaml` entry followed
//! by the filesystem under `rootfs/`. The conversion streams entry by entry;
//! the source tree is never unpacked on disk.

use crate::BackendError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::Path;
use tar::{Builder, EntryType, Header};

const CHROOT_PREFIX: &str = "chroot-autobuild";
const ROOTFS_PREFIX: &str = "rootfs";

#[derive(Debug, Serialize)]
struct ImageMetadata<'a> {
    architecture: &'a str,
    creation_date: u64,
    properties: ImageProperties<'a>,
}

#[derive(Debug, Serialize)]
struct ImageProperties<'a> {
    architecture: &'a str,
    description: String,
    os: &'a str,
    series: &'a str,
}

/// Convert the chroot tarball at `source` into an LXD image tarball at
/// `target`.
///
/// `arch` is the archive architecture tag and `lxc_arch` the kernel-style
/// name LXD expects. The image creation date is taken from the source's
/// root directory entry.
pub fn convert_chroot_tarball(
    source: &Path,
    target: &Path,
    series: &str,
    arch: &str,
    lxc_arch: &str,
) -> Result<(), BackendError> {
    let creation_date = root_entry_mtime(source)?;
    let metadata = ImageMetadata {
        architecture: lxc_arch,
        creation_date,
        properties: ImageProperties {
            architecture: arch,
            description: format!("Build farm chroot for Ubuntu {series} ({arch})"),
            os: "Ubuntu",
            series,
        },
    };
    // JSON is a subset of YAML, so this doubles as metadata.yaml.
    let mut metadata_yaml = serde_json::to_string_pretty(&metadata)
        .map_err(|e| BackendError::Failed(format!("cannot serialize image metadata: {e}")))?;
    metadata_yaml.push('\n');

    let output = File::create(target)?;
    let encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    let mut builder = Builder::new(encoder);

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(metadata_yaml.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(creation_date);
    builder.append_data(&mut header, "metadata.yaml", metadata_yaml.as_bytes())?;

    let mut archive = open_tarball(source)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let new_name = reroot(&name);
        let mut header = entry.header().clone();
        match header.entry_type() {
            EntryType::Link => {
                // Hard link targets are archive paths and need re-rooting too.
                let link = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                builder.append_link(&mut header, new_name, reroot(&link))?;
            }
            EntryType::Symlink => {
                // Symlink targets are interpreted inside the container and
                // are left alone.
                let link = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                builder.append_link(&mut header, new_name, link)?;
            }
            _ => {
                builder.append_data(&mut header, new_name, &mut entry)?;
            }
        }
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

/// Replace the `chroot-autobuild` path prefix with `rootfs`.
fn reroot(name: &str) -> String {
    match name.split_once(CHROOT_PREFIX) {
        Some((_, suffix)) => format!("{ROOTFS_PREFIX}{suffix}"),
        None => format!("{ROOTFS_PREFIX}{name}"),
    }
}

/// Modification time of the tarball's top-level `chroot-autobuild` entry.
fn root_entry_mtime(source: &Path) -> Result<u64, BackendError> {
    let mut archive = open_tarball(source)?;
    for entry in archive.entries()? {
        let entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if name == CHROOT_PREFIX || name == format!("{CHROOT_PREFIX}/") {
            return Ok(entry.header().mtime()?);
        }
    }
    Err(BackendError::Failed(format!(
        "{} has no top-level {CHROOT_PREFIX} entry",
        source.display()
    )))
}

/// Open a tarball for reading, transparently handling gzip compression.
fn open_tarball(path: &Path) -> Result<tar::Archive<Box<dyn Read>>, BackendError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    let reader: Box<dyn Read> = if n == 2 && magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(tar::Archive::new(reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tar::Archive;

    fn make_source(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("chroot.tar.gz");
        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);

        let mut dir_header = Header::new_gnu();
        dir_header.set_entry_type(EntryType::Directory);
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        dir_header.set_mtime(1_468_800_000);
        builder
            .append_data(&mut dir_header, "chroot-autobuild/", &b""[..])
            .unwrap();

        let content = b"nameserver 1.2.3.4\n";
        let mut file_header = Header::new_gnu();
        file_header.set_entry_type(EntryType::Regular);
        file_header.set_size(content.len() as u64);
        file_header.set_mode(0o644);
        file_header.set_mtime(1_468_800_100);
        builder
            .append_data(
                &mut file_header,
                "chroot-autobuild/etc/resolv.conf",
                &content[..],
            )
            .unwrap();

        let mut link_header = Header::new_gnu();
        link_header.set_entry_type(EntryType::Link);
        link_header.set_size(0);
        builder
            .append_link(
                &mut link_header,
                "chroot-autobuild/etc/resolv2.conf",
                "chroot-autobuild/etc/resolv.conf",
            )
            .unwrap();

        let mut sym_header = Header::new_gnu();
        sym_header.set_entry_type(EntryType::Symlink);
        sym_header.set_size(0);
        builder
            .append_link(&mut sym_header, "chroot-autobuild/etc/mtab", "/proc/mounts")
            .unwrap();

        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        path
    }

    fn read_image(path: &Path) -> Vec<(String, EntryType, Option<String>, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let mut archive = Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
                let link = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned());
                let entry_type = entry.header().entry_type();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                (name, entry_type, link, content)
            })
            .collect()
    }

    #[test]
    fn conversion_reroots_and_prepends_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let source = make_source(dir.path());
        let target = dir.path().join("lxd.tar.gz");

        convert_chroot_tarball(&source, &target, "xenial", "amd64", "x86_64").unwrap();

        let entries = read_image(&target);
        assert_eq!(entries[0].0, "metadata.yaml");
        assert_eq!(entries[1].0, "rootfs/");
        assert_eq!(entries[2].0, "rootfs/etc/resolv.conf");
        assert_eq!(entries[2].3, b"nameserver 1.2.3.4\n");

        // Hard link target re-rooted, symlink target untouched.
        assert_eq!(entries[3].1, EntryType::Link);
        assert_eq!(entries[3].2.as_deref(), Some("rootfs/etc/resolv.conf"));
        assert_eq!(entries[4].1, EntryType::Symlink);
        assert_eq!(entries[4].2.as_deref(), Some("/proc/mounts"));
    }

    #[test]
    fn metadata_carries_arch_series_and_root_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let source = make_source(dir.path());
        let target = dir.path().join("lxd.tar.gz");

        convert_chroot_tarball(&source, &target, "xenial", "amd64", "x86_64").unwrap();

        let entries = read_image(&target);
        let metadata: serde_json::Value = serde_json::from_slice(&entries[0].3).unwrap();
        assert_eq!(metadata["architecture"], "x86_64");
        assert_eq!(metadata["creation_date"], 1_468_800_000);
        assert_eq!(metadata["properties"]["os"], "Ubuntu");
        assert_eq!(metadata["properties"]["series"], "xenial");
        assert_eq!(metadata["properties"]["architecture"], "amd64");
        assert!(metadata["properties"]["description"]
            .as_str()
            .unwrap()
            .contains("xenial (amd64)"));
    }

    #[test]
    fn missing_root_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tar");
        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(file);
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(0);
        builder.append_data(&mut header, "unrelated", &b""[..]).unwrap();
        builder.finish().unwrap();

        let target = dir.path().join("out.tar.gz");
        assert!(convert_chroot_tarball(&path, &target, "xenial", "amd64", "x86_64").is_err());
    }

    #[test]
    fn uncompressed_source_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.tar");
        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(file);
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mtime(42);
        builder
            .append_data(&mut header, "chroot-autobuild/", &b""[..])
            .unwrap();
        builder.finish().unwrap();

        let target = dir.path().join("out.tar.gz");
        convert_chroot_tarball(&path, &target, "bionic", "arm64", "aarch64").unwrap();
        let entries = read_image(&target);
        assert_eq!(entries.len(), 2);
    }
}
