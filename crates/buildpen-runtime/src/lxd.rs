//! LXD backend: each build runs in a privileged container created from an
//! image carrying the build environment, on a dedicated bridge.

use crate::backend::{remove_build_path, Backend, BuildSpec, OpenMode, RunOptions};
use crate::client::{LxdClient, LXD_RUNNING};
use crate::config::RuntimeConfig;
use crate::image::convert_chroot_tarball;
use crate::network::{device_mapper_major, Bridge, BridgeLock, Ipv4Network};
use crate::process::{run_command, run_command_with, to_argv};
use crate::{BackendError, ImageType};
use buildpen_util::{escape_args, set_personality};
use std::fs::File;
use std::io::Write as _;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Hosts entries for containers whose /etc/hosts is missing or empty.
const FALLBACK_HOSTS: &str = "\
127.0.0.1\tlocalhost
::1\tlocalhost ip6-localhost ip6-loopback
fe00::0\tip6-localnet
ff00::0\tip6-mcastprefix
ff02::1\tip6-allnodes
ff02::2\tip6-allrouters
";

/// Refuse to start services inside the container, except the few that
/// builds rely on.
const POLICY_RC_D: &str = r#"#! /bin/sh
while :; do
    case "$1" in
        -*) shift ;;
        systemd-udevd|systemd-udevd.service|udev|udev.service)
            exit 0 ;;
        snapd|snapd.*)
            exit 0 ;;
        *)
            echo "Not running services in chroot."
            exit 101
            ;;
    esac
done
"#;

const START_TIMEOUT: Duration = Duration::from_secs(60);

/// Kernel-style architecture name LXD expects for each archive tag.
fn lxc_arch(arch: &str) -> Result<&'static str, BackendError> {
    match arch {
        "amd64" => Ok("x86_64"),
        "arm64" => Ok("aarch64"),
        "armhf" => Ok("armv7l"),
        "i386" => Ok("i686"),
        "powerpc" => Ok("ppc"),
        "ppc64el" => Ok("ppc64le"),
        "riscv64" => Ok("riscv64"),
        "s390x" => Ok("s390x"),
        other => Err(BackendError::Failed(format!(
            "don't know the LXD name for architecture {other}"
        ))),
    }
}

pub struct LxdBackend {
    spec: BuildSpec,
    config: RuntimeConfig,
    client: LxdClient,
    bridge: Bridge,
    // Held between start() and stop(); makes the host-wide bridge an
    // explicit single-owner resource.
    bridge_lock: Mutex<Option<BridgeLock>>,
}

impl LxdBackend {
    pub fn new(spec: BuildSpec, config: RuntimeConfig) -> Result<Self, BackendError> {
        let network: Ipv4Network = config.ipv4_network.parse()?;
        let client = LxdClient::new(&config.lxd_socket);
        let bridge = Bridge::new(&config.bridge_name, network, &config.run_dir);
        Ok(Self {
            spec,
            config,
            client,
            bridge,
            bridge_lock: Mutex::new(None),
        })
    }

    fn series(&self) -> &str {
        self.spec.series.as_deref().unwrap_or("unknown")
    }

    fn arch(&self) -> &str {
        self.spec.arch.as_deref().unwrap_or("unknown")
    }

    /// Image alias; doubles as the container name.
    pub fn alias(&self) -> String {
        format!("lp-{}-{}", self.series(), self.arch())
    }

    fn name(&self) -> String {
        self.alias()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.client.get_container(&self.name()),
            Ok(Some(container)) if container["status_code"].as_i64() == Some(LXD_RUNNING)
        )
    }

    /// Run `lxd init` once per host; the server key's existence is the
    /// marker that it already happened.
    fn init_daemon(&self) -> Result<(), BackendError> {
        if !self.config.lxd_server_key.exists() {
            run_command(&to_argv(&["sudo", "lxd", "init", "--auto"]), None, false)?;
            // Force generation of a client certificate for this user.
            let mut command = Command::new("lxc");
            command.arg("list").stdout(std::process::Stdio::null());
            if let Err(e) = run_command_with(&mut command, &to_argv(&["lxc", "list"]), None, false)
            {
                debug!("lxc list failed (ignored): {e}");
            }
        }
        Ok(())
    }

    fn remove_image(&self) -> Result<(), BackendError> {
        let alias = self.alias();
        for image in self.client.list_images()? {
            let matches = image["aliases"]
                .as_array()
                .is_some_and(|aliases| aliases.iter().any(|a| a["name"] == alias.as_str()));
            if matches {
                if let Some(fingerprint) = image["fingerprint"].as_str() {
                    self.client.delete_image(fingerprint)?;
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Paths that must be bind-mounted into the container for NVIDIA CUDA
    /// support.
    ///
    /// LXD's security.privileged=true and nvidia.runtime=true options are
    /// incompatible, so the important parts of the latter are emulated with
    /// bind mounts of whatever the container CLI reports.
    fn nvidia_container_paths(&self) -> Result<Vec<String>, BackendError> {
        let argv = to_argv(&["/snap/lxd/current/bin/nvidia-container-cli.real", "list"]);
        let mut command = Command::new(&argv[0]);
        command
            .arg(&argv[1])
            .env("LD_LIBRARY_PATH", "/snap/lxd/current/lib");
        let output = run_command_with(&mut command, &argv, None, true)?;
        Ok(String::from_utf8_lossy(&output)
            .lines()
            .map(std::borrow::ToOwned::to_owned)
            .collect())
    }

    fn create_profile(&self, nvidia_paths: &[String]) -> Result<(), BackendError> {
        let address = self.bridge.network.first_usable_host().ok_or_else(|| {
            BackendError::Failed(format!(
                "{} has no usable IP addresses",
                self.bridge.network
            ))
        })?;
        let container_network = self.bridge.network.with_address(address);

        if self.client.get_profile(&self.config.profile_name)?.is_some() {
            self.client.delete_profile(&self.config.profile_name)?;
        }

        let info = self.client.server_info()?;
        let driver_version = info["environment"]["driver_version"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let major = driver_major(&driver_version);

        let raw_lxc = render_raw_lxc(&raw_lxc_config(
            self.arch(),
            &container_network.to_string(),
            &self.bridge.network.gateway().to_string(),
            major,
        ));
        let config = serde_json::json!({
            "security.privileged": "true",
            "security.nesting": "true",
            "raw.lxc": raw_lxc,
        });

        let mut devices = serde_json::json!({
            "eth0": {
                "name": "eth0",
                "nictype": "bridged",
                "parent": self.bridge.name.as_str(),
                "type": "nic",
            },
        });
        if major >= 3 {
            devices["root"] = serde_json::json!({
                "path": "/",
                "pool": "default",
                "type": "disk",
            });
        }
        // Device nodes are skipped here: bind-mounted devices aren't
        // propagated into snaps installed inside the container, which makes
        // LXC's nvidia hook fail. They are created after the container
        // starts instead.
        for (i, path) in nvidia_paths.iter().enumerate() {
            if path.starts_with("/dev/") {
                continue;
            }
            devices[format!("nvidia-{i}")] = serde_json::json!({
                "path": path,
                "source": path,
                "type": "disk",
            });
        }

        self.client
            .create_profile(&self.config.profile_name, &config, &devices)
    }

    fn wants_gpu(&self) -> bool {
        self.spec.constraints.iter().any(|c| c == "gpu-nvidia")
    }

    /// Create block device nodes for dm-0..dm-7; some partitioning tools
    /// hang when they look for dm devices and find none.
    fn create_dm_nodes(&self) -> Result<(), BackendError> {
        let major = device_mapper_major()?;
        for minor in 0..8 {
            let argv = to_argv(&[
                "mknod",
                "-m",
                "0660",
                &format!("/dev/dm-{minor}"),
                "b",
                &major.to_string(),
                &minor.to_string(),
            ]);
            self.run(&argv, &RunOptions::default())?;
        }
        Ok(())
    }

    /// Character-device nodes for the GPU paths skipped during profile
    /// creation.
    fn create_gpu_nodes(&self, nvidia_paths: &[String]) -> Result<(), BackendError> {
        for path in nvidia_paths.iter().filter(|p| p.starts_with("/dev/")) {
            let metadata = std::fs::metadata(path)?;
            let rdev = metadata.rdev();
            let argv = to_argv(&[
                "mknod",
                "-m",
                "0666",
                path,
                "c",
                &dev_major(rdev).to_string(),
                &dev_minor(rdev).to_string(),
            ]);
            self.run(&argv, &RunOptions::default())?;
        }
        Ok(())
    }

    fn wait_for_running(&self) -> Result<(), BackendError> {
        let deadline = Instant::now() + START_TIMEOUT;
        while Instant::now() < deadline {
            match self.client.get_container(&self.name())? {
                None => break,
                Some(container) if container["status_code"].as_i64() == Some(LXD_RUNNING) => {
                    return Ok(());
                }
                Some(_) => std::thread::sleep(Duration::from_secs(1)),
            }
        }
        Err(BackendError::Failed(format!(
            "Container failed to start within {} seconds",
            START_TIMEOUT.as_secs()
        )))
    }

    fn hold_bridge_lock(&self, lock: Option<BridgeLock>) -> Result<(), BackendError> {
        let mut guard = self
            .bridge_lock
            .lock()
            .map_err(|_| BackendError::Failed("bridge lock state poisoned".to_owned()))?;
        *guard = lock;
        Ok(())
    }
}

impl Backend for LxdBackend {
    fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    fn create(&self, image_path: &Path, image_type: ImageType) -> Result<(), BackendError> {
        self.init_daemon()?;
        self.remove_image()?;

        let fingerprint = match image_type {
            ImageType::Chroot => {
                let work_dir = tempfile::tempdir()?;
                let converted = work_dir.path().join("lxd.tar.gz");
                convert_chroot_tarball(
                    image_path,
                    &converted,
                    self.series(),
                    self.arch(),
                    lxc_arch(self.arch())?,
                )?;
                self.client.create_image(&converted)?
            }
            ImageType::Lxd => self.client.create_image(image_path)?,
        };
        self.client.add_image_alias(&fingerprint, &self.alias())
    }

    fn start(&self) -> Result<(), BackendError> {
        // Clear out any stale container and bridge first.
        self.stop()?;

        let nvidia_paths = if self.wants_gpu() {
            self.nvidia_container_paths()?
        } else {
            Vec::new()
        };
        self.create_profile(&nvidia_paths)?;
        let lock = self.bridge.start()?;
        self.hold_bridge_lock(Some(lock))?;

        let name = self.name();
        self.client.create_container(&serde_json::json!({
            "name": name.as_str(),
            "profiles": [self.config.profile_name.as_str()],
            "source": {"type": "image", "alias": self.alias()},
        }))?;

        let hostname = local_hostname(false)?;
        let fqdn = local_hostname(true)?;
        self.open("/etc/hosts", OpenMode::Append, &mut |file| {
            extend_hosts(file, &fqdn, &hostname)?;
            file.set_permissions(std::fs::Permissions::from_mode(0o644))?;
            Ok(())
        })?;
        self.open("/etc/hostname", OpenMode::Write, &mut |file| {
            writeln!(file, "{hostname}")?;
            file.set_permissions(std::fs::Permissions::from_mode(0o644))?;
            Ok(())
        })?;

        self.copy_in(&host_resolv_conf(), "/etc/resolv.conf")?;

        self.open(
            "/usr/local/sbin/policy-rc.d",
            OpenMode::Write,
            &mut |file| {
                file.write_all(POLICY_RC_D.as_bytes())?;
                file.set_permissions(std::fs::Permissions::from_mode(0o755))?;
                Ok(())
            },
        )?;

        // On targets that use Upstart, stop the mounted-dev job from
        // creating devices: most are unnecessary in a container, and its
        // loop devices would race with ours.
        if self.path_exists("/etc/init/mounted-dev.conf") {
            let mut conf = String::new();
            self.open("/etc/init/mounted-dev.conf", OpenMode::Read, &mut |file| {
                use std::io::Read as _;
                file.read_to_string(&mut conf)?;
                Ok(())
            })?;
            if let Some(script) = neutralize_makedev(&conf) {
                self.open(
                    "/etc/init/mounted-dev.override",
                    OpenMode::Write,
                    &mut |file| {
                        file.write_all(script.as_bytes())?;
                        file.set_permissions(std::fs::Permissions::from_mode(0o644))?;
                        Ok(())
                    },
                )?;
            }
        }

        self.client.start_container(&name)?;
        self.wait_for_running()?;

        self.create_dm_nodes()?;

        if self.wants_gpu() {
            // Bind-mounted libraries need the dynamic linker's cache updated.
            self.run(&to_argv(&["/sbin/ldconfig"]), &RunOptions::default())?;
            self.create_gpu_nodes(&nvidia_paths)?;
        }

        self.run(
            &to_argv(&["mkdir", "-p", "/etc/systemd/system/snapd.service.d"]),
            &RunOptions::default(),
        )?;
        self.open(
            "/etc/systemd/system/snapd.service.d/no-cdn.conf",
            OpenMode::Write,
            &mut |file| {
                file.write_all(b"[Service]\nEnvironment=SNAPPY_STORE_NO_CDN=1\n")?;
                file.set_permissions(std::fs::Permissions::from_mode(0o644))?;
                Ok(())
            },
        )?;

        // Refreshing snaps from a timer unit during a build isn't
        // appropriate. Mask it by hand so we don't depend on systemctl
        // existing in the image.
        self.run(
            &to_argv(&[
                "ln",
                "-s",
                "/dev/null",
                "/etc/systemd/system/snapd.refresh.timer",
            ]),
            &RunOptions::default(),
        )?;

        if self.arch() == "armhf" {
            // lxcfs's /proc/cpuinfo emulation is broken on armhf; the
            // unfiltered file may over-report cores, which is harmless.
            let argv = to_argv(&["umount", "/proc/cpuinfo"]);
            match self.run(&argv, &RunOptions::default()) {
                Ok(_) | Err(BackendError::CommandFailed { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn run(&self, args: &[String], options: &RunOptions) -> Result<Vec<u8>, BackendError> {
        let mut args = args.to_vec();
        if let Some(arch) = self.spec.arch.as_deref() {
            args = set_personality(&args, arch, self.spec.series.as_deref())?;
        }
        if let Some(cwd) = options.cwd.as_deref() {
            // No way to set the working directory through lxc exec, so go
            // through a shell.
            args = vec![
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                format!(
                    "cd {} && {}",
                    buildpen_util::shell_escape(cwd),
                    escape_args(&args)
                ),
            ];
        }
        if options.echo {
            eprintln!("Running in container: {}", escape_args(&args));
        }
        let mut argv = to_argv(&["lxc", "exec"]);
        argv.push(self.name());
        for (key, value) in &options.env {
            argv.push("--env".to_owned());
            argv.push(format!("{key}={value}"));
        }
        argv.push("--".to_owned());
        argv.extend(args);

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
        self.client
            .push_file(&self.name(), target_path, source_path, 0, 0, mode)
    }

    fn copy_out(&self, source_path: &str, target_path: &Path) -> Result<(), BackendError> {
        let mut target = File::create(target_path)?;
        self.client
            .pull_file(&self.name(), source_path, &mut target)
    }

    fn stop(&self) -> Result<(), BackendError> {
        let name = self.name();
        if let Some(container) = self.client.get_container(&name)? {
            if container["status_code"].as_i64() == Some(LXD_RUNNING) {
                self.client.stop_container(&name)?;
            }
            self.client.delete_container(&name)?;
        }
        self.bridge.stop()?;
        self.hold_bridge_lock(None)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), BackendError> {
        self.remove_image()?;
        remove_build_path(&self.spec)
    }
}

fn local_hostname(fqdn: bool) -> Result<String, BackendError> {
    let argv = if fqdn {
        to_argv(&["hostname", "--fqdn"])
    } else {
        to_argv(&["hostname"])
    };
    let output = run_command(&argv, None, true)?;
    Ok(String::from_utf8_lossy(&output).trim_end().to_owned())
}

/// The host resolv.conf worth copying: prefer the real resolver config
/// over systemd-resolved's stub, whose 127.0.0.53 is useless in a container.
fn host_resolv_conf() -> std::path::PathBuf {
    let resolv_conf = Path::new("/etc/resolv.conf");
    if resolv_conf.is_symlink() {
        if let Ok(real) = resolv_conf.canonicalize() {
            if real == Path::new("/run/systemd/resolve/stub-resolv.conf")
                && Path::new("/run/systemd/resolve/resolv.conf").is_file()
            {
                return "/run/systemd/resolve/resolv.conf".into();
            }
            return real;
        }
    }
    resolv_conf.to_path_buf()
}

/// Append the host's name to an /etc/hosts file, seeding the standard
/// entries first if the file is missing or empty.
fn extend_hosts(file: &mut File, fqdn: &str, hostname: &str) -> std::io::Result<()> {
    use std::io::Seek as _;
    let len = file.seek(std::io::SeekFrom::End(0))?;
    if len == 0 {
        file.write_all(FALLBACK_HOSTS.as_bytes())?;
    }
    writeln!(file, "\n127.0.1.1\t{fqdn} {hostname}")
}

fn driver_major(driver_version: &str) -> u32 {
    driver_version
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
        .unwrap_or(0)
}

/// The raw.lxc key/value pairs for a build container profile.
fn raw_lxc_config(
    arch: &str,
    container_address: &str,
    gateway: &str,
    driver_major: u32,
) -> Vec<(String, String)> {
    let mut pairs: Vec<(&str, String)> = vec![
        ("lxc.cap.drop", String::new()),
        ("lxc.cap.drop", "sys_time sys_module".to_owned()),
        ("lxc.cgroup.devices.deny", String::new()),
        ("lxc.cgroup.devices.allow", String::new()),
        ("lxc.mount.auto", String::new()),
        ("lxc.mount.auto", "proc:rw sys:rw".to_owned()),
        (
            "lxc.mount.entry",
            "udev /dev devtmpfs rw,nosuid,relatime,mode=755,inode64".to_owned(),
        ),
        ("lxc.autodev", "0".to_owned()),
    ];
    if driver_major >= 3 {
        pairs.push(("lxc.apparmor.profile", "unconfined".to_owned()));
        pairs.push(("lxc.net.0.ipv4.address", container_address.to_owned()));
        pairs.push(("lxc.net.0.ipv4.gateway", gateway.to_owned()));
    } else {
        pairs.push(("lxc.aa_profile", "unconfined".to_owned()));
        pairs.push(("lxc.network.0.ipv4", container_address.to_owned()));
        pairs.push(("lxc.network.0.ipv4.gateway", gateway.to_owned()));
    }
    // Linux 4.4 on powerpc doesn't support all the seccomp bits that LXD
    // needs.
    if arch == "powerpc" {
        pairs.push(("lxc.seccomp", String::new()));
    }
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

/// Serialize raw.lxc pairs sorted by key then value, one `key=value` line
/// per pair.
fn render_raw_lxc(pairs: &[(String, String)]) -> String {
    let mut sorted = pairs.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

/// Comment out MAKEDEV invocations in an Upstart job's script stanzas,
/// returning the override script, or None if the job has no stanzas.
fn neutralize_makedev(conf: &str) -> Option<String> {
    let mut script = String::new();
    let mut in_script = false;
    for line in conf.lines() {
        if in_script {
            let indent_len = line.len() - line.trim_start().len();
            let (indent, rest) = line.split_at(indent_len);
            if rest.contains("MAKEDEV") {
                script.push_str(&format!("{indent}: # {rest}\n"));
            } else {
                script.push_str(line);
                script.push('\n');
            }
            if line.trim() == "end script" {
                in_script = false;
            }
        } else if line.trim() == "script" {
            script.push_str(line);
            script.push('\n');
            in_script = true;
        }
    }
    if script.is_empty() {
        None
    } else {
        Some(script)
    }
}

fn dev_major(rdev: u64) -> u64 {
    ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)
}

fn dev_minor(rdev: u64) -> u64 {
    (rdev & 0xff) | ((rdev >> 12) & !0xff)
}
