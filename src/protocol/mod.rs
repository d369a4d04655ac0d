//! Command envelope protocol for the trust boundary.
//!
//! Every logical operation crossing into or out of the isolated context
//! travels inside an [`Envelope`]: one uniform transport shape, one active
//! payload. The payload set is closed; a tagged enum makes zero-or-many
//! active payloads unrepresentable, and the typed unwrappers let each call
//! site assert exactly which payload kind it expects back instead of
//! silently reading the wrong field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discriminant identifying the active payload of an [`Envelope`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadKind {
    Initialize,
    Evaluate,
    EvaluateResult,
    Finalize,
    Ack,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::Evaluate => "evaluate",
            Self::EvaluateResult => "evaluate-result",
            Self::Finalize => "finalize",
            Self::Ack => "ack",
        };
        f.write_str(name)
    }
}

/// Program source to install into a freshly loaded context.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InitializeCommand {
    pub script: String,
}

/// One opaque input datum for the programmed context to evaluate.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EvaluateCommand {
    pub input: String,
}

/// One opaque output datum produced in response to an [`EvaluateCommand`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EvaluateResult {
    pub output: String,
}

/// Teardown instruction. Carries no data.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FinalizeSignal;

/// The closed set of boundary payloads. Exactly one is active per envelope
/// by construction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum Payload {
    Initialize(InitializeCommand),
    Evaluate(EvaluateCommand),
    EvaluateResult(EvaluateResult),
    Finalize(FinalizeSignal),
    /// Empty acknowledgement response. Promoted to an explicit kind so an
    /// ack never crosses the boundary as a payload-less envelope.
    Ack,
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Initialize(_) => PayloadKind::Initialize,
            Self::Evaluate(_) => PayloadKind::Evaluate,
            Self::EvaluateResult(_) => PayloadKind::EvaluateResult,
            Self::Finalize(_) => PayloadKind::Finalize,
            Self::Ack => PayloadKind::Ack,
        }
    }
}

/// Protocol-level failures. Never coerced or recovered; an unexpected
/// payload indicates a boundary or version mismatch.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ProtocolError {
    #[error("unexpected payload: expected {expected}, found {found}")]
    UnexpectedPayload {
        expected: PayloadKind,
        found: PayloadKind,
    },
}

/// Transport container for one boundary crossing.
///
/// `seq` is per-handle transport metadata: assigned monotonically by the
/// sender and echoed by the context in its reply so the transport can
/// reject out-of-sequence responses.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    payload: Payload,
}

impl Envelope {
    pub fn new(seq: u64, payload: Payload) -> Self {
        Self { seq, payload }
    }

    /// The active payload's discriminant.
    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    /// Reply envelope carrying `payload`, echoing this envelope's `seq`.
    pub fn reply(&self, payload: Payload) -> Envelope {
        Envelope::new(self.seq, payload)
    }

    fn mismatch(expected: PayloadKind, payload: &Payload) -> ProtocolError {
        ProtocolError::UnexpectedPayload {
            expected,
            found: payload.kind(),
        }
    }

    pub fn into_initialize(self) -> Result<InitializeCommand, ProtocolError> {
        match self.payload {
            Payload::Initialize(cmd) => Ok(cmd),
            other => Err(Self::mismatch(PayloadKind::Initialize, &other)),
        }
    }

    pub fn into_evaluate(self) -> Result<EvaluateCommand, ProtocolError> {
        match self.payload {
            Payload::Evaluate(cmd) => Ok(cmd),
            other => Err(Self::mismatch(PayloadKind::Evaluate, &other)),
        }
    }

    pub fn into_evaluate_result(self) -> Result<EvaluateResult, ProtocolError> {
        match self.payload {
            Payload::EvaluateResult(res) => Ok(res),
            other => Err(Self::mismatch(PayloadKind::EvaluateResult, &other)),
        }
    }

    pub fn into_finalize(self) -> Result<FinalizeSignal, ProtocolError> {
        match self.payload {
            Payload::Finalize(sig) => Ok(sig),
            other => Err(Self::mismatch(PayloadKind::Finalize, &other)),
        }
    }

    pub fn into_ack(self) -> Result<(), ProtocolError> {
        match self.payload {
            Payload::Ack => Ok(()),
            other => Err(Self::mismatch(PayloadKind::Ack, &other)),
        }
    }
}
