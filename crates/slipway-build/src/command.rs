use crate::BuildError;
use slipway_store::{LogKind, Logger};
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, warn};

/// Human-readable form of a command line for logs and errors.
pub fn describe(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().into_owned()];
    parts.extend(command.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

fn forward(stream: impl Read, kind: LogKind, logger: &dyn Logger) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                logger.log(kind, line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                warn!("stopped reading build output: {e}");
                break;
            }
        }
    }
}

/// Run `command` to completion, forwarding every stdout line as a message and
/// every stderr line as a warning while the process is still running.
///
/// Returns the exit code on success. A non-zero exit or death by signal is
/// [`BuildError::ExitCode`].
pub fn run_streaming(mut command: Command, logger: &dyn Logger) -> Result<i32, BuildError> {
    let shown = describe(&command);
    logger.log(LogKind::Message, &format!("Running {shown}"));
    debug!("spawning {shown}");

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| BuildError::Spawn {
            command: shown.clone(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    thread::scope(|s| {
        if let Some(out) = stdout {
            s.spawn(move || forward(out, LogKind::Message, logger));
        }
        if let Some(err) = stderr {
            s.spawn(move || forward(err, LogKind::Warning, logger));
        }
    });

    let status = child.wait()?;
    match status.code() {
        Some(0) => Ok(0),
        code => Err(BuildError::ExitCode {
            command: shown,
            code,
        }),
    }
}
