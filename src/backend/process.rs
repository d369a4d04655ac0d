//! Process-backed isolation contexts.
//!
//! The context image is launched as a child process with piped stdio; the
//! pipes are the trust boundary. Each `call` writes exactly one request
//! frame and blocks for exactly one reply frame. Teardown closes the
//! request pipe and waits for the child to exit.

use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use log::{debug, warn};

use crate::backend::wire::{read_frame, write_frame, Frame};
use crate::backend::{BackendError, IsolationBackend, Result};
use crate::protocol::Envelope;

/// Environment variable carrying the debug flag into the context process.
/// Passed out-of-band so arbitrary images need not understand driver argv.
pub const DEBUG_ENV_VAR: &str = "ENCLAVEBOX_DEBUG";

/// One live child-process context.
pub struct ProcessContext {
    child: Child,
    // Buffered separately from `child` so call() can borrow both directions.
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// Backend that instantiates contexts by spawning the image binary.
#[derive(Debug, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

impl IsolationBackend for ProcessBackend {
    type Context = ProcessContext;

    fn instantiate(&mut self, image: &Path, debug: bool) -> Result<ProcessContext> {
        if !image.exists() {
            return Err(BackendError::ImageNotFound(image.to_path_buf()));
        }

        let mut child = Command::new(image)
            .env(DEBUG_ENV_VAR, if debug { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        // Piped stdio is requested above; take() cannot miss.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Transport("context stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Transport("context stdout unavailable".to_string()))?;

        debug!(
            "instantiated context process {} from {}",
            child.id(),
            image.display()
        );

        Ok(ProcessContext {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    fn call(&mut self, ctx: &mut ProcessContext, request: Envelope) -> Result<Envelope> {
        let seq = request.seq;
        write_frame(&mut ctx.stdin, &request)?;

        match read_frame::<_, Frame>(&mut ctx.stdout)? {
            Frame::Envelope(reply) => {
                if reply.seq != seq {
                    return Err(BackendError::Transport(format!(
                        "response out of sequence: sent {seq}, received {}",
                        reply.seq
                    )));
                }
                Ok(reply)
            }
            Frame::Error { message } => Err(BackendError::Context(message)),
        }
    }

    fn teardown(&mut self, ctx: ProcessContext) -> Result<()> {
        let ProcessContext {
            mut child, stdin, ..
        } = ctx;

        // Dropping the pipe signals EOF; a well-behaved context has already
        // seen the finalize request and is on its way out.
        drop(stdin);

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            warn!("context process {} exited with {}", child.id(), status);
            Err(BackendError::Context(format!(
                "context process exited with {status}"
            )))
        }
    }
}
