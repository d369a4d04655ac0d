//! Context host: the serve loop on the far side of the trust boundary.
//!
//! A context image is any binary that reads request frames on stdin and
//! writes reply frames on stdout. This module is the bundled one, reached
//! through the driver's hidden `--internal-role context` flag, which lets
//! the driver binary act as its own context image. The host enforces the
//! same ordering the controller enforces from the outside, because the far
//! side cannot trust the near side either.
//!
//! The evaluator proper is outside this crate's scope; the bundled host
//! installs the script and passes each input datum through unchanged.

use std::io::{BufRead, Write};

use log::{debug, info};

use crate::backend::wire::{read_frame, write_frame, Frame};
use crate::backend::{BackendError, Result};
use crate::protocol::{Envelope, EvaluateResult, Payload, PayloadKind};

struct HostState {
    script: Option<String>,
}

impl HostState {
    fn handle(&mut self, request: Envelope) -> std::result::Result<Envelope, String> {
        match request.kind() {
            PayloadKind::Initialize => {
                if self.script.is_some() {
                    return Err("context already programmed".to_string());
                }
                let reply = request.reply(Payload::Ack);
                let cmd = request.into_initialize().map_err(|e| e.to_string())?;
                info!("context programmed ({} bytes of script)", cmd.script.len());
                self.script = Some(cmd.script);
                Ok(reply)
            }
            PayloadKind::Evaluate => {
                if self.script.is_none() {
                    return Err("evaluate before initialize".to_string());
                }
                let seq = request.seq;
                let cmd = request.into_evaluate().map_err(|e| e.to_string())?;
                debug!("evaluating {} bytes of input", cmd.input.len());
                Ok(Envelope::new(
                    seq,
                    Payload::EvaluateResult(EvaluateResult { output: cmd.input }),
                ))
            }
            PayloadKind::Finalize => Ok(request.reply(Payload::Ack)),
            other => Err(format!("context cannot accept {other} payloads")),
        }
    }
}

/// Serve envelope requests until a finalize arrives or the peer closes the
/// pipe. Context-side misuse is answered as an error frame without tearing
/// the loop down; the near side decides what is fatal.
pub fn serve<R: BufRead, W: Write>(reader: &mut R, writer: &mut W) -> Result<()> {
    let mut state = HostState { script: None };

    loop {
        let request: Envelope = match read_frame(reader) {
            Ok(req) => req,
            // EOF between frames is the peer dropping the pipe; exit clean.
            Err(BackendError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let finalize = request.kind() == PayloadKind::Finalize;
        match state.handle(request) {
            Ok(reply) => write_frame(writer, &Frame::Envelope(reply))?,
            Err(message) => write_frame(writer, &Frame::Error { message })?,
        }

        if finalize {
            info!("context finalized");
            return Ok(());
        }
    }
}
