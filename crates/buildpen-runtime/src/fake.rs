//! Recording fake backend for tests: no isolation, no subprocesses, just a
//! log of every call and scripted responses for `run`.

use crate::backend::{Backend, BuildSpec, RunOptions};
use crate::{BackendError, ImageType};
use buildpen_util::escape_args;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One recorded backend call, in argument order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Create {
        image_path: PathBuf,
        image_type: String,
    },
    Start,
    Run {
        args: Vec<String>,
        cwd: Option<String>,
        env: Vec<(String, String)>,
    },
    CopyIn {
        source_path: PathBuf,
        target_path: String,
    },
    CopyOut {
        source_path: String,
        target_path: PathBuf,
    },
    KillProcesses,
    Stop,
    Remove,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<FakeCall>,
    outputs: HashMap<String, Vec<u8>>,
    failures: HashSet<String>,
    files: HashMap<String, Vec<u8>>,
}

pub struct FakeBackend {
    spec: BuildSpec,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new(spec: BuildSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, FakeState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::Failed("fake backend state poisoned".to_owned()))
    }

    /// Script the stdout of a future `run` of exactly `args`.
    pub fn script_output(&self, args: &[&str], output: &[u8]) {
        if let Ok(mut state) = self.state() {
            state.outputs.insert(args.join(" "), output.to_vec());
        }
    }

    /// Script a nonzero exit for a future `run` of exactly `args`.
    pub fn script_failure(&self, args: &[&str]) {
        if let Ok(mut state) = self.state() {
            state.failures.insert(args.join(" "));
        }
    }

    /// Seed a file inside the fake environment.
    pub fn put_file(&self, path: &str, content: &[u8]) {
        if let Ok(mut state) = self.state() {
            state.files.insert(path.to_owned(), content.to_vec());
        }
    }

    /// Content of a file previously copied or written in.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().ok()?.files.get(path).cloned()
    }

    /// Everything that has been asked of this backend, in order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().map(|state| state.calls.clone()).unwrap_or_default()
    }

    fn record(&self, call: FakeCall) -> Result<(), BackendError> {
        self.state()?.calls.push(call);
        Ok(())
    }
}

impl Backend for FakeBackend {
    fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    fn create(&self, image_path: &Path, image_type: ImageType) -> Result<(), BackendError> {
        self.record(FakeCall::Create {
            image_path: image_path.to_path_buf(),
            image_type: image_type.to_string(),
        })
    }

    fn start(&self) -> Result<(), BackendError> {
        self.record(FakeCall::Start)
    }

    fn run(&self, args: &[String], options: &RunOptions) -> Result<Vec<u8>, BackendError> {
        self.record(FakeCall::Run {
            args: args.to_vec(),
            cwd: options.cwd.clone(),
            env: options.env.clone(),
        })?;
        let key = args.join(" ");
        let state = self.state()?;
        if state.failures.contains(&key) {
            return Err(BackendError::CommandFailed {
                command: escape_args(args),
                code: 1,
            });
        }
        if options.get_output {
            Ok(state.outputs.get(&key).cloned().unwrap_or_default())
        } else {
            Ok(Vec::new())
        }
    }

    fn copy_in(&self, source_path: &Path, target_path: &str) -> Result<(), BackendError> {
        self.record(FakeCall::CopyIn {
            source_path: source_path.to_path_buf(),
            target_path: target_path.to_owned(),
        })?;
        let content = std::fs::read(source_path)?;
        self.state()?.files.insert(target_path.to_owned(), content);
        Ok(())
    }

    fn copy_out(&self, source_path: &str, target_path: &Path) -> Result<(), BackendError> {
        self.record(FakeCall::CopyOut {
            source_path: source_path.to_owned(),
            target_path: target_path.to_path_buf(),
        })?;
        let content = self
            .state()?
            .files
            .get(source_path)
            .cloned()
            .ok_or_else(|| BackendError::Failed(format!("no such file: {source_path}")))?;
        std::fs::write(target_path, content)?;
        Ok(())
    }

    fn path_exists(&self, path: &str) -> bool {
        self.state().is_ok_and(|state| state.files.contains_key(path))
    }

    fn kill_processes(&self) -> Result<(), BackendError> {
        self.record(FakeCall::KillProcesses)
    }

    fn stop(&self) -> Result<(), BackendError> {
        self.record(FakeCall::Stop)
    }

    fn remove(&self) -> Result<(), BackendError> {
        self.record(FakeCall::Remove)
    }
}
