//! Child process supervision for `jobwire run`.

use anyhow::Result;
use jobwire::{ActionFailure, ActionTable, Client, JobContext, JobOutcome};
use serde_json::{json, Value};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Exit code used when the program could not be started at all.
const SPAWN_FAILURE_CODE: u8 = 127;
/// Exit code reported for a program ended by a signal.
const INTERRUPTED_CODE: u8 = 130;

/// How the tracked program ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    pub outcome: JobOutcome,
    pub exit_code: u8,
}

struct Line {
    text: String,
    stderr: bool,
}

fn forward<R>(stream: R, stderr: bool, lines: mpsc::UnboundedSender<Line>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(text)) = reader.next_line().await {
            if lines.send(Line { text, stderr }).is_err() {
                break;
            }
        }
    });
}

/// The `process` controller: lets the service read the pid and stop the program.
fn process_controller(pid: Option<u32>, terminate: mpsc::UnboundedSender<()>) -> ActionTable {
    ActionTable::new()
        .action("pid", 0, move |_| Ok(json!(pid)))
        .action("terminate", 0, move |_| {
            terminate
                .send(())
                .map_err(|_| ActionFailure::from("process already finished"))?;
            Ok(Value::Bool(true))
        })
}

/// Map an exit status to the job outcome and the code this process exits with.
fn finished(status: std::io::Result<ExitStatus>, interrupted: bool) -> Finished {
    match status {
        Err(e) => {
            error!("Lost track of the program: {}", e);
            Finished {
                outcome: JobOutcome::Crashed,
                exit_code: 1,
            }
        }
        Ok(status) if status.success() => Finished {
            outcome: if interrupted {
                JobOutcome::Aborted
            } else {
                JobOutcome::Done
            },
            exit_code: 0,
        },
        Ok(status) => match status.code() {
            Some(code) => Finished {
                outcome: if interrupted {
                    JobOutcome::Aborted
                } else {
                    JobOutcome::Failed
                },
                exit_code: u8::try_from(code & 0xff).unwrap_or(1),
            },
            // Ended by a signal
            None => Finished {
                outcome: JobOutcome::Aborted,
                exit_code: INTERRUPTED_CODE,
            },
        },
    }
}

/// Run `program`, streaming its output into the job log until it exits.
pub async fn run(client: &Client, context: &JobContext, program: &[String]) -> Result<Finished> {
    let Some((executable, arguments)) = program.split_first() else {
        anyhow::bail!("no program given");
    };

    let mut child = match Command::new(executable)
        .args(arguments)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to start {}: {}", executable, e);
            context.log(format!("Failed to start {}: {}\n", executable, e));
            return Ok(Finished {
                outcome: JobOutcome::Crashed,
                exit_code: SPAWN_FAILURE_CODE,
            });
        }
    };
    let pid = child.id();
    info!("Started {} (pid {:?})", executable, pid);

    let (terminate_tx, mut terminate) = mpsc::unbounded_channel();
    let registration = {
        let client = client.clone();
        let controller = process_controller(pid, terminate_tx);
        tokio::spawn(async move { client.register_controller("process", controller).await })
    };

    let (lines_tx, mut lines) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward(stdout, false, lines_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward(stderr, true, lines_tx.clone());
    }
    drop(lines_tx);

    let mut status = None;
    let mut interrupted = false;
    let mut output_open = true;

    while status.is_none() || output_open {
        tokio::select! {
            line = lines.recv(), if output_open => match line {
                Some(Line { text, stderr }) => {
                    if stderr {
                        eprintln!("{}", text);
                    } else {
                        println!("{}", text);
                    }
                    context.log(format!("{}\n", text));
                }
                None => output_open = false,
            },
            result = child.wait(), if status.is_none() => status = Some(result),
            Some(()) = terminate.recv(), if status.is_none() => {
                info!("Termination requested by the service");
                interrupted = true;
                if let Err(e) = child.start_kill() {
                    warn!("Failed to terminate: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c(), if status.is_none() => {
                info!("Interrupted; stopping the program");
                interrupted = true;
                if let Err(e) = child.start_kill() {
                    warn!("Failed to terminate: {}", e);
                }
            }
        }
    }

    // Unregister if the registration went through; otherwise stop waiting for it
    if registration.is_finished() {
        match registration.await {
            Ok(Ok(handle)) => handle.stop(),
            Ok(Err(e)) => warn!("Process controller not available: {}", e),
            Err(e) => debug!("Registration task ended: {}", e),
        }
    } else {
        registration.abort();
    }

    let status = status.unwrap_or_else(|| Err(std::io::Error::other("no exit status")));
    Ok(finished(status, interrupted))
}
