use buildpen_runtime::fake::{FakeBackend, FakeCall};
use buildpen_runtime::{make_backend, Backend, BackendError, BuildSpec, OpenMode, RunOptions};
use std::io::Write as _;
use std::path::Path;

fn spec(home: &Path) -> BuildSpec {
    BuildSpec::new("42")
        .with_series("jammy")
        .with_arch("amd64")
        .with_home(home)
}

#[test]
fn factory_builds_the_fake_by_name() {
    let home = tempfile::tempdir().unwrap();
    let backend = make_backend("fake", spec(home.path())).unwrap();
    assert_eq!(
        backend.build_path(),
        home.path().join("build-42"),
        "build path derives from the build spec"
    );
}

#[test]
fn factory_rejects_unknown_names() {
    let home = tempfile::tempdir().unwrap();
    assert!(matches!(
        make_backend("qemu", spec(home.path())),
        Err(BackendError::UnknownBackend(_))
    ));
}

#[test]
fn a_full_build_session_against_the_fake() {
    let home = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(spec(home.path()));

    backend
        .create(Path::new("/images/jammy.tar.gz"), "chroot".parse().unwrap())
        .unwrap();
    backend.start().unwrap();

    // Push a source package in, build it, pull the result out.
    let source = home.path().join("hello.dsc");
    std::fs::write(&source, b"Format: 3.0\n").unwrap();
    backend.copy_in(&source, "/build/hello.dsc").unwrap();

    let args: Vec<String> = ["dpkg-buildpackage", "-us", "-uc"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    let options = RunOptions::default().cwd("/build").env("LANG", "C");
    backend.run(&args, &options).unwrap();

    backend.put_file("/build/hello.deb", b"deb");
    let result = home.path().join("hello.deb");
    backend.copy_out("/build/hello.deb", &result).unwrap();
    assert_eq!(std::fs::read(&result).unwrap(), b"deb");

    backend.kill_processes().unwrap();
    backend.stop().unwrap();
    backend.remove().unwrap();

    let calls = backend.calls();
    assert!(matches!(calls[0], FakeCall::Create { .. }));
    assert!(
        matches!(calls.last(), Some(FakeCall::Remove)),
        "remove is the final lifecycle step"
    );
    assert!(calls.iter().any(|call| matches!(
        call,
        FakeCall::Run { cwd: Some(cwd), env, .. }
            if cwd == "/build" && env == &[("LANG".to_owned(), "C".to_owned())]
    )));
}

#[test]
fn open_round_trips_environment_files() {
    let home = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(spec(home.path()));
    backend.put_file("/etc/hosts", b"127.0.0.1\tlocalhost\n");

    backend
        .open("/etc/hosts", OpenMode::Append, &mut |file| {
            writeln!(file, "10.10.10.2\tbuilder")?;
            Ok(())
        })
        .unwrap();

    let mut seen = Vec::new();
    backend
        .open("/etc/hosts", OpenMode::Read, &mut |file| {
            use std::io::Read as _;
            file.read_to_end(&mut seen)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(seen, b"127.0.0.1\tlocalhost\n10.10.10.2\tbuilder\n");
}
