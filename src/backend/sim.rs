//! Simulated isolation contexts.
//!
//! In-process loopback analogue of a simulator-loaded enclave: no process
//! boundary, same protocol discipline. The simulated context enforces the
//! same ordering rules a real context host does, so integration tests
//! exercise the controller against honest far-side behavior.

use std::path::Path;

use crate::backend::{BackendError, IsolationBackend, Result};
use crate::protocol::{Envelope, EvaluateResult, Payload, PayloadKind};

/// One simulated context: the installed program, if any.
pub struct SimContext {
    script: Option<String>,
    finalized: bool,
}

/// Loopback backend. `require_image` controls whether `instantiate` checks
/// the image path on disk (the CLI wants the check; unit tests rarely do).
pub struct SimBackend {
    require_image: bool,
}

impl SimBackend {
    pub fn new() -> Self {
        Self {
            require_image: false,
        }
    }

    pub fn with_image_check() -> Self {
        Self {
            require_image: true,
        }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationBackend for SimBackend {
    type Context = SimContext;

    fn instantiate(&mut self, image: &Path, _debug: bool) -> Result<SimContext> {
        if self.require_image && !image.exists() {
            return Err(BackendError::ImageNotFound(image.to_path_buf()));
        }
        Ok(SimContext {
            script: None,
            finalized: false,
        })
    }

    fn call(&mut self, ctx: &mut SimContext, request: Envelope) -> Result<Envelope> {
        if ctx.finalized {
            return Err(BackendError::Context(
                "context already finalized".to_string(),
            ));
        }

        match request.kind() {
            PayloadKind::Initialize => {
                if ctx.script.is_some() {
                    return Err(BackendError::Context(
                        "context already programmed".to_string(),
                    ));
                }
                let reply = request.reply(Payload::Ack);
                let cmd = request
                    .into_initialize()
                    .map_err(|e| BackendError::Context(e.to_string()))?;
                ctx.script = Some(cmd.script);
                Ok(reply)
            }
            PayloadKind::Evaluate => {
                if ctx.script.is_none() {
                    return Err(BackendError::Context(
                        "evaluate before initialize".to_string(),
                    ));
                }
                let reply_seq = request.seq;
                let cmd = request
                    .into_evaluate()
                    .map_err(|e| BackendError::Context(e.to_string()))?;
                // The evaluator itself lives outside this crate; the
                // simulated context passes the datum through unchanged.
                Ok(Envelope::new(
                    reply_seq,
                    Payload::EvaluateResult(EvaluateResult { output: cmd.input }),
                ))
            }
            PayloadKind::Finalize => {
                ctx.finalized = true;
                Ok(request.reply(Payload::Ack))
            }
            other => Err(BackendError::Context(format!(
                "context cannot accept {other} payloads"
            ))),
        }
    }

    fn teardown(&mut self, ctx: SimContext) -> Result<()> {
        // A context torn down without finalize is still dropped; mirrors a
        // process backend reaping a child that never acknowledged.
        drop(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EvaluateCommand, FinalizeSignal, InitializeCommand};

    fn initialize(seq: u64, script: &str) -> Envelope {
        Envelope::new(
            seq,
            Payload::Initialize(InitializeCommand {
                script: script.to_string(),
            }),
        )
    }

    #[test]
    fn evaluate_before_initialize_is_a_context_error() {
        let mut backend = SimBackend::new();
        let mut ctx = backend.instantiate(Path::new("unused"), false).unwrap();

        let request = Envelope::new(
            1,
            Payload::Evaluate(EvaluateCommand {
                input: "1+1".to_string(),
            }),
        );
        let err = backend.call(&mut ctx, request).unwrap_err();
        assert!(matches!(err, BackendError::Context(_)));
    }

    #[test]
    fn double_initialize_is_rejected() {
        let mut backend = SimBackend::new();
        let mut ctx = backend.instantiate(Path::new("unused"), false).unwrap();

        backend.call(&mut ctx, initialize(1, "(define x 1)")).unwrap();
        let err = backend
            .call(&mut ctx, initialize(2, "(define x 2)"))
            .unwrap_err();
        assert!(matches!(err, BackendError::Context(_)));
    }

    #[test]
    fn programmed_context_passes_the_datum_through() {
        let mut backend = SimBackend::new();
        let mut ctx = backend.instantiate(Path::new("unused"), false).unwrap();

        backend.call(&mut ctx, initialize(1, "script")).unwrap();
        let reply = backend
            .call(
                &mut ctx,
                Envelope::new(
                    2,
                    Payload::Evaluate(EvaluateCommand {
                        input: "(fib 10)".to_string(),
                    }),
                ),
            )
            .unwrap();
        assert_eq!(reply.seq, 2);
        assert_eq!(reply.into_evaluate_result().unwrap().output, "(fib 10)");
    }

    #[test]
    fn finalized_context_refuses_further_calls() {
        let mut backend = SimBackend::new();
        let mut ctx = backend.instantiate(Path::new("unused"), false).unwrap();

        backend
            .call(&mut ctx, Envelope::new(1, Payload::Finalize(FinalizeSignal)))
            .unwrap();
        let err = backend
            .call(&mut ctx, initialize(2, "late"))
            .unwrap_err();
        assert!(matches!(err, BackendError::Context(_)));
    }

    #[test]
    fn image_check_is_opt_in() {
        let missing = Path::new("/nonexistent/enclave.signed");
        assert!(SimBackend::new().instantiate(missing, true).is_ok());
        assert!(matches!(
            SimBackend::with_image_check().instantiate(missing, true),
            Err(BackendError::ImageNotFound(_))
        ));
    }
}
