//! Enclave lifecycle controller.
//!
//! Owns the live-name registry and the backend contexts, and is the sole
//! component that performs boundary-crossing calls. Legal transitions:
//!
//! ```text
//! Unloaded --load--> Loaded --program--> Programmed --destroy--> Destroyed
//!                      `--------------destroy------------------^
//! ```
//!
//! `Destroyed` is terminal; no operation re-enters an earlier state. Every
//! boundary call is synchronous and exactly-once: there is no retry path,
//! because the context's execution is not guaranteed idempotent and its
//! internal state after a partial failure is unknown.

use std::collections::HashMap;
use std::path::Path;

use log::{info, warn};
use thiserror::Error;

use crate::backend::{BackendError, IsolationBackend};
use crate::protocol::{
    Envelope, EvaluateCommand, FinalizeSignal, InitializeCommand, Payload, ProtocolError,
};

/// Lifecycle phase of a handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnclaveState {
    Loaded,
    Programmed,
    Destroyed,
}

impl EnclaveState {
    /// Live states hold a registered context; `Destroyed` does not.
    fn is_live(self) -> bool {
        matches!(self, Self::Loaded | Self::Programmed)
    }
}

impl std::fmt::Display for EnclaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Loaded => "loaded",
            Self::Programmed => "programmed",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Caller-visible reference to one loaded context. The context itself never
/// leaves the controller; the handle carries only the name, the lifecycle
/// state, and the envelope sequence counter.
#[derive(Debug)]
pub struct EnclaveHandle {
    name: String,
    state: EnclaveState,
    next_seq: u64,
}

impl EnclaveHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EnclaveState {
        self.state
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// State-machine and environmental failures at the controller boundary.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("load of enclave '{name}' failed: {source}")]
    LoadFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("enclave '{name}' is already loaded")]
    AlreadyLoaded { name: String },

    #[error("programming enclave '{name}' failed: {reason}")]
    ProgramFailed { name: String, reason: String },

    #[error("evaluation in enclave '{name}' failed: {source}")]
    EvaluateFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("operation '{operation}' is illegal on enclave '{name}' in state {state}")]
    InvalidState {
        operation: &'static str,
        name: String,
        state: EnclaveState,
    },

    #[error("destroying enclave '{name}' failed: {source}")]
    DestroyFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Owns zero-or-one context per name and drives each through its lifecycle.
pub struct EnclaveController<B: IsolationBackend> {
    backend: B,
    contexts: HashMap<String, B::Context>,
}

impl<B: IsolationBackend> EnclaveController<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            contexts: HashMap::new(),
        }
    }

    /// Instantiate and register a context under `name`.
    ///
    /// The only operation allowed to fail for environmental reasons
    /// (missing image, resource exhaustion). A live handle already holding
    /// the name is refused and left intact.
    pub fn load(&mut self, name: &str, image: &Path, debug: bool) -> Result<EnclaveHandle> {
        if self.contexts.contains_key(name) {
            return Err(LifecycleError::AlreadyLoaded {
                name: name.to_string(),
            });
        }

        let ctx = self
            .backend
            .instantiate(image, debug)
            .map_err(|source| LifecycleError::LoadFailed {
                name: name.to_string(),
                source,
            })?;
        self.contexts.insert(name.to_string(), ctx);
        info!("enclave '{}' loaded from {}", name, image.display());

        Ok(EnclaveHandle {
            name: name.to_string(),
            state: EnclaveState::Loaded,
            next_seq: 0,
        })
    }

    /// Install `script` into a loaded context, transitioning it to
    /// Programmed.
    ///
    /// On any failure the state is left at Loaded and the handle must be
    /// treated as unusable: the context's internal state after a partial
    /// failure is unknown, so the caller's only move is `destroy`.
    pub fn program(&mut self, handle: &mut EnclaveHandle, script: &str) -> Result<()> {
        self.check_state(handle, "program", EnclaveState::Loaded)?;

        let request = Envelope::new(
            handle.take_seq(),
            Payload::Initialize(InitializeCommand {
                script: script.to_string(),
            }),
        );
        let outcome = self
            .call(handle, request)
            .map_err(|e| e.to_string())
            .and_then(|reply| reply.into_ack().map_err(|e| e.to_string()));
        match outcome {
            Ok(()) => {
                handle.state = EnclaveState::Programmed;
                info!("enclave '{}' programmed", handle.name);
                Ok(())
            }
            Err(reason) => Err(LifecycleError::ProgramFailed {
                name: handle.name.clone(),
                reason,
            }),
        }
    }

    /// Evaluate one input datum in a programmed context.
    ///
    /// State is unchanged; this is the one operation meant to be called in
    /// a loop, and each call is independent of the last.
    pub fn evaluate(&mut self, handle: &mut EnclaveHandle, input: &str) -> Result<String> {
        self.check_state(handle, "evaluate", EnclaveState::Programmed)?;

        let request = Envelope::new(
            handle.take_seq(),
            Payload::Evaluate(EvaluateCommand {
                input: input.to_string(),
            }),
        );
        let reply = self
            .call(handle, request)
            .map_err(|source| LifecycleError::EvaluateFailed {
                name: handle.name.clone(),
                source,
            })?;
        // A mismatched reply kind is a boundary/version mismatch, surfaced
        // as-is rather than coerced into a lifecycle variant.
        let result = reply.into_evaluate_result()?;
        Ok(result.output)
    }

    /// Tear the context down.
    ///
    /// The handle is marked Destroyed and the name deregistered regardless
    /// of how the far side behaves: a context that fails to acknowledge
    /// teardown is unusable either way, and keeping it registered would
    /// leak the name and the context. Failures surface as `DestroyFailed`
    /// after local state has advanced.
    pub fn destroy(&mut self, handle: &mut EnclaveHandle) -> Result<()> {
        if !handle.state.is_live() {
            return Err(LifecycleError::InvalidState {
                operation: "destroy",
                name: handle.name.clone(),
                state: handle.state,
            });
        }

        let request = Envelope::new(handle.take_seq(), Payload::Finalize(FinalizeSignal));
        let call_outcome = self
            .call(handle, request)
            .and_then(|reply| reply.into_ack().map_err(|e| BackendError::Context(e.to_string())));

        // Local state always advances, whatever the far side did.
        handle.state = EnclaveState::Destroyed;
        let teardown_outcome = match self.contexts.remove(&handle.name) {
            Some(ctx) => self.backend.teardown(ctx),
            None => Ok(()),
        };
        info!("enclave '{}' destroyed", handle.name);

        let failure = match (call_outcome, teardown_outcome) {
            (Err(e), _) => {
                warn!(
                    "enclave '{}' did not acknowledge finalize: {}",
                    handle.name, e
                );
                Some(e)
            }
            (Ok(()), Err(e)) => Some(e),
            (Ok(()), Ok(())) => None,
        };
        match failure {
            Some(source) => Err(LifecycleError::DestroyFailed {
                name: handle.name.clone(),
                source,
            }),
            None => Ok(()),
        }
    }

    fn check_state(
        &self,
        handle: &EnclaveHandle,
        operation: &'static str,
        required: EnclaveState,
    ) -> Result<()> {
        if handle.state != required {
            return Err(LifecycleError::InvalidState {
                operation,
                name: handle.name.clone(),
                state: handle.state,
            });
        }
        Ok(())
    }

    /// One synchronous boundary crossing against the handle's context.
    fn call(
        &mut self,
        handle: &EnclaveHandle,
        request: Envelope,
    ) -> std::result::Result<Envelope, BackendError> {
        let ctx = self.contexts.get_mut(&handle.name).ok_or_else(|| {
            BackendError::Context(format!("no registered context for '{}'", handle.name))
        })?;
        self.backend.call(ctx, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EvaluateResult, PayloadKind};
    use std::path::PathBuf;

    /// Backend double that records every boundary crossing, so tests can
    /// assert which operations never reached the boundary at all.
    #[derive(Default)]
    struct MockBackend {
        calls: Vec<PayloadKind>,
        teardowns: usize,
        fail_initialize: bool,
        fail_finalize: bool,
        fail_teardown: bool,
    }

    impl IsolationBackend for MockBackend {
        type Context = ();

        fn instantiate(
            &mut self,
            _image: &Path,
            _debug: bool,
        ) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        fn call(
            &mut self,
            _ctx: &mut (),
            request: Envelope,
        ) -> std::result::Result<Envelope, BackendError> {
            self.calls.push(request.kind());
            match request.kind() {
                PayloadKind::Initialize if self.fail_initialize => {
                    Err(BackendError::Context("initialize rejected".to_string()))
                }
                PayloadKind::Initialize => Ok(request.reply(Payload::Ack)),
                PayloadKind::Evaluate => {
                    let seq = request.seq;
                    let cmd = request.into_evaluate().expect("evaluate payload");
                    Ok(Envelope::new(
                        seq,
                        Payload::EvaluateResult(EvaluateResult { output: cmd.input }),
                    ))
                }
                PayloadKind::Finalize if self.fail_finalize => {
                    Err(BackendError::Context("finalize rejected".to_string()))
                }
                PayloadKind::Finalize => Ok(request.reply(Payload::Ack)),
                other => panic!("controller sent a {other} request"),
            }
        }

        fn teardown(&mut self, _ctx: ()) -> std::result::Result<(), BackendError> {
            self.teardowns += 1;
            if self.fail_teardown {
                Err(BackendError::Context("teardown failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn image() -> PathBuf {
        PathBuf::from("/opt/enclaves/test.signed")
    }

    #[test]
    fn evaluate_before_program_is_invalid_state_without_a_boundary_call() {
        let mut controller = EnclaveController::new(MockBackend::default());
        let mut handle = controller.load("x", &image(), true).unwrap();

        let err = controller.evaluate(&mut handle, "1+1").unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
        assert!(controller.backend.calls.is_empty());
        assert_eq!(handle.state(), EnclaveState::Loaded);
    }

    #[test]
    fn duplicate_load_is_refused_and_keeps_the_first_handle() {
        let mut controller = EnclaveController::new(MockBackend::default());
        let mut first = controller.load("x", &image(), false).unwrap();

        let err = controller.load("x", &image(), false).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyLoaded { .. }));

        // The first handle is untouched and still drives its context.
        controller.program(&mut first, "script").unwrap();
        assert_eq!(first.state(), EnclaveState::Programmed);
    }

    #[test]
    fn full_lifecycle_reaches_destroyed() {
        let mut controller = EnclaveController::new(MockBackend::default());
        let mut handle = controller.load("x", &image(), true).unwrap();
        assert_eq!(handle.state(), EnclaveState::Loaded);

        controller.program(&mut handle, "(define fib ...)").unwrap();
        assert_eq!(handle.state(), EnclaveState::Programmed);

        let output = controller.evaluate(&mut handle, "1+1").unwrap();
        assert_eq!(output, "1+1");

        controller.destroy(&mut handle).unwrap();
        assert_eq!(handle.state(), EnclaveState::Destroyed);
        assert_eq!(controller.backend.teardowns, 1);
        assert_eq!(
            controller.backend.calls,
            vec![
                PayloadKind::Initialize,
                PayloadKind::Evaluate,
                PayloadKind::Finalize
            ]
        );
    }

    #[test]
    fn program_failure_leaves_state_loaded_and_destroy_still_works() {
        let mut controller = EnclaveController::new(MockBackend {
            fail_initialize: true,
            ..MockBackend::default()
        });
        let mut handle = controller.load("x", &image(), true).unwrap();

        let err = controller.program(&mut handle, "script").unwrap_err();
        assert!(matches!(err, LifecycleError::ProgramFailed { .. }));
        assert_eq!(handle.state(), EnclaveState::Loaded);

        // State stayed Loaded, so evaluate is still a state error.
        let err = controller.evaluate(&mut handle, "1+1").unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));

        controller.destroy(&mut handle).unwrap();
        assert_eq!(handle.state(), EnclaveState::Destroyed);
    }

    #[test]
    fn destroy_advances_state_even_when_finalize_is_not_acknowledged() {
        let mut controller = EnclaveController::new(MockBackend {
            fail_finalize: true,
            ..MockBackend::default()
        });
        let mut handle = controller.load("x", &image(), true).unwrap();

        let err = controller.destroy(&mut handle).unwrap_err();
        assert!(matches!(err, LifecycleError::DestroyFailed { .. }));
        assert_eq!(handle.state(), EnclaveState::Destroyed);
        // The context was still reclaimed.
        assert_eq!(controller.backend.teardowns, 1);
    }

    #[test]
    fn destroy_advances_state_even_when_teardown_fails() {
        let mut controller = EnclaveController::new(MockBackend {
            fail_teardown: true,
            ..MockBackend::default()
        });
        let mut handle = controller.load("x", &image(), true).unwrap();

        let err = controller.destroy(&mut handle).unwrap_err();
        assert!(matches!(err, LifecycleError::DestroyFailed { .. }));
        assert_eq!(handle.state(), EnclaveState::Destroyed);
    }

    #[test]
    fn second_destroy_is_an_error_without_a_boundary_call() {
        let mut controller = EnclaveController::new(MockBackend::default());
        let mut handle = controller.load("x", &image(), true).unwrap();
        controller.destroy(&mut handle).unwrap();

        let boundary_calls = controller.backend.calls.len();
        let err = controller.destroy(&mut handle).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
        assert_eq!(controller.backend.calls.len(), boundary_calls);
        assert_eq!(handle.state(), EnclaveState::Destroyed);
    }

    #[test]
    fn name_is_free_again_after_destroy() {
        let mut controller = EnclaveController::new(MockBackend::default());
        let mut handle = controller.load("x", &image(), true).unwrap();
        controller.destroy(&mut handle).unwrap();

        let reloaded = controller.load("x", &image(), true).unwrap();
        assert_eq!(reloaded.state(), EnclaveState::Loaded);
    }

    #[test]
    fn envelope_sequence_increases_per_boundary_call() {
        let mut controller = EnclaveController::new(MockBackend::default());
        let mut handle = controller.load("x", &image(), true).unwrap();
        controller.program(&mut handle, "script").unwrap();
        controller.evaluate(&mut handle, "a").unwrap();
        controller.evaluate(&mut handle, "b").unwrap();
        assert_eq!(handle.next_seq, 3);
    }
}

