//! Streamed subprocess execution.
//!
//! External tools can run for minutes, so their output is relayed line by
//! line while it arrives and buffered for error reporting. Reader threads
//! feed a channel; the main thread prints and collects until both streams
//! close and the child exits.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to run command ({command}): {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("error running command ({command}) exit code ({code})")]
    Failed {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

/// Captured output of a completed command.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout.lines().map(str::to_string).collect()
    }
}

enum StreamLine {
    Out(String),
    Err(String),
}

/// Run a prepared command, streaming its output unless `quiet`.
///
/// `description` is the human-readable command line used in error messages.
pub fn stream_command(
    description: &str,
    command: &mut Command,
    quiet: bool,
) -> Result<ProcessOutput, ProcessError> {
    debug!(command = description, "running");

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        command: description.to_string(),
        source,
    })?;

    let (tx, rx) = mpsc::channel();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut readers = Vec::new();
    if let Some(stdout) = stdout {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(StreamLine::Out(line)).is_err() {
                    break;
                }
            }
        }));
    }
    if let Some(stderr) = stderr {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tx.send(StreamLine::Err(line)).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let mut output = ProcessOutput::default();
    for line in rx {
        match line {
            StreamLine::Out(line) => {
                if !quiet {
                    println!("{line}");
                }
                output.stdout.push_str(&line);
                output.stdout.push('\n');
            }
            StreamLine::Err(line) => {
                if !quiet {
                    eprintln!("{line}");
                }
                output.stderr.push_str(&line);
                output.stderr.push('\n');
            }
        }
    }

    for reader in readers {
        let _ = reader.join();
    }

    let status = child.wait().map_err(|source| ProcessError::Spawn {
        command: description.to_string(),
        source,
    })?;

    if !status.success() {
        return Err(ProcessError::Failed {
            command: description.to_string(),
            code: status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }

    Ok(output)
}

/// Run a program with explicit arguments.
pub fn run_command(
    program: &str,
    args: &[&str],
    quiet: bool,
    working_dir: Option<&Path>,
) -> Result<ProcessOutput, ProcessError> {
    let description = format!("{} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    stream_command(&description, &mut command, quiet)
}

/// Run a configuration-supplied command line through the shell.
pub fn run_shell(command_line: &str, quiet: bool) -> Result<ProcessOutput, ProcessError> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);

    stream_command(command_line, &mut command, quiet)
}
