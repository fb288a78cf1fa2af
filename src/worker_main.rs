//! Reference persistent worker, run by `wpool worker`.
//!
//! Echoes each request's arguments back joined by spaces. A few arguments
//! change its behaviour so pools can be exercised against a real process:
//!
//! - `sleep=<ms>` delays the response
//! - `exit=<code>` reports that exit code
//! - `crash` ends the process without answering
//!
//! In multiplex mode every request is answered from its own thread, so
//! responses may come back in a different order than the requests.

use crate::transport::{LineReader, LineWriter, PipeFd, WorkRequest, WorkResponse};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Exit status used when a `crash` argument is received.
pub const CRASH_EXIT_CODE: i32 = 3;

/// How the request loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stdin closed or an exit request arrived.
    Finished,
    /// A `crash` argument asked the worker to die.
    Crashed,
}

struct Job {
    delay: Option<Duration>,
    exit_code: i32,
    output: String,
}

fn plan(arguments: &[String]) -> Job {
    let mut job = Job {
        delay: None,
        exit_code: 0,
        output: arguments.join(" "),
    };
    for arg in arguments {
        if let Some(ms) = arg.strip_prefix("sleep=") {
            job.delay = ms.parse().ok().map(Duration::from_millis);
        } else if let Some(code) = arg.strip_prefix("exit=") {
            job.exit_code = code.parse().unwrap_or(1);
        }
    }
    job
}

fn answer(request_id: u32, arguments: &[String]) -> WorkResponse {
    let job = plan(arguments);
    if let Some(delay) = job.delay {
        thread::sleep(delay);
    }
    WorkResponse::result(request_id, job.exit_code, job.output)
}

fn write_response<W: Write>(writer: &Mutex<LineWriter<W>>, response: &WorkResponse) -> io::Result<()> {
    let line = response.to_line().map_err(io::Error::other)?;
    writer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .write_line(&line)
}

/// Serve requests from `reader` until EOF, an exit request, or a crash.
pub fn serve<R, W>(mut reader: LineReader<R>, writer: LineWriter<W>, multiplex: bool) -> io::Result<Outcome>
where
    R: Read,
    W: Write + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));

    while let Some(line) = reader.read_line()? {
        let request = match WorkRequest::from_line(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request");
                write_response(&writer, &WorkResponse::error(0, format!("Invalid request: {e}")))?;
                continue;
            }
        };

        let (request_id, arguments) = match request {
            WorkRequest::Exit => return Ok(Outcome::Finished),
            WorkRequest::Work {
                request_id,
                arguments,
            } => (request_id, arguments),
        };
        if arguments.iter().any(|a| a == "crash") {
            return Ok(Outcome::Crashed);
        }
        debug!(request_id, args = arguments.len(), "Request received");

        if multiplex {
            let writer = writer.clone();
            thread::spawn(move || {
                if let Err(e) = write_response(&writer, &answer(request_id, &arguments)) {
                    warn!(request_id, error = %e, "Failed to send response");
                }
            });
        } else {
            write_response(&writer, &answer(request_id, &arguments))?;
        }
    }
    Ok(Outcome::Finished)
}

/// Run the worker on stdin/stdout and exit the process.
pub fn run_worker_main(multiplex: bool) -> ! {
    // A pool that went away shows up as EPIPE, not a signal
    // SAFETY: installing SIG_IGN has no handler code to race with
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let outcome = PipeFd::stdio()
        .and_then(|(stdin, stdout)| serve(LineReader::new(stdin), LineWriter::new(stdout), multiplex));
    match outcome {
        Ok(Outcome::Finished) => std::process::exit(0),
        Ok(Outcome::Crashed) => std::process::exit(CRASH_EXIT_CODE),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
