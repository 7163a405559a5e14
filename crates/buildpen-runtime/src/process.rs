use crate::BackendError;
use buildpen_util::escape_args;
use std::io::Read;
use std::io::Write as _;
use std::process::{Command, Stdio};

/// Run an external command, optionally feeding stdin and capturing stdout.
///
/// Stdin writing and stdout reading are interleaved on separate threads so
/// a command that both consumes input and produces output cannot deadlock
/// on full pipe buffers.
pub(crate) fn run_command(
    argv: &[String],
    input: Option<&[u8]>,
    get_output: bool,
) -> Result<Vec<u8>, BackendError> {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    run_command_with(&mut command, argv, input, get_output)
}

/// Like `run_command` but for a pre-built `Command` (extra env vars etc.);
/// `argv` is only used for error reporting.
pub(crate) fn run_command_with(
    command: &mut Command,
    argv: &[String],
    input: Option<&[u8]>,
    get_output: bool,
) -> Result<Vec<u8>, BackendError> {
    if input.is_some() {
        command.stdin(Stdio::piped());
    }
    if get_output {
        command.stdout(Stdio::piped());
    }

    let mut child = command.spawn()?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();

    let output = std::thread::scope(|scope| -> Result<Vec<u8>, BackendError> {
        let writer = match (input, stdin) {
            (Some(data), Some(mut stdin)) => Some(scope.spawn(move || {
                // The child may exit without draining stdin; a broken pipe
                // here is not interesting, the exit status is.
                let _ = stdin.write_all(data);
            })),
            _ => None,
        };

        let mut output = Vec::new();
        if let Some(mut stdout) = stdout {
            stdout.read_to_end(&mut output)?;
        }
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        Ok(output)
    })?;

    let status = child.wait()?;
    if !status.success() {
        return Err(BackendError::CommandFailed {
            command: escape_args(argv),
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(output)
}

/// Run a command, ignoring its exit status (best-effort cleanup steps).
pub(crate) fn call_command(argv: &[String]) {
    if let Err(e) = run_command(argv, None, false) {
        tracing::debug!("ignoring failure of `{}`: {e}", escape_args(argv));
    }
}

pub(crate) fn to_argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let argv = to_argv(&["echo", "hello"]);
        let output = run_command(&argv, None, true).unwrap();
        assert_eq!(output, b"hello\n");
    }

    #[test]
    fn nonzero_exit_carries_command_and_code() {
        let argv = to_argv(&["sh", "-c", "exit 3"]);
        let err = run_command(&argv, None, false).unwrap_err();
        match err {
            BackendError::CommandFailed { command, code } => {
                assert!(command.contains("exit 3"));
                assert_eq!(code, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn input_and_output_do_not_deadlock() {
        // Feed more than a pipe buffer through cat in both directions.
        let data = vec![b'x'; 1 << 20];
        let argv = to_argv(&["cat"]);
        let output = run_command(&argv, Some(&data), true).unwrap();
        assert_eq!(output.len(), data.len());
    }

    #[test]
    fn call_command_swallows_failure() {
        call_command(&to_argv(&["false"]));
    }
}
