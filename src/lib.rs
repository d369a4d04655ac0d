//! enclavebox: a driver for isolated execution contexts
//! Loads an enclave image, installs a program into it, evaluates expressions
//! across the trust boundary, and tears it down.
//!
//! # Architecture
//!
//! ## Command Protocol ([`protocol`])
//! - [`protocol`]: typed command envelope with a closed payload-kind set;
//!   exactly one active payload per envelope by construction
//!
//! ## Lifecycle Control ([`controller`])
//! - [`controller`]: legal-transition state machine
//!   (Loaded -> Programmed -> Destroyed), live-name registry, sole owner of
//!   the boundary-crossing call
//!
//! ## Isolation Backends ([`backend`])
//! - [`backend::process`]: context image spawned as a child process, frames
//!   over stdio
//! - [`backend::sim`]: in-process simulated context for tests and loopback
//!   callers
//! - [`backend::wire`]: length-prefixed JSON frame codec
//!
//! ## Context Host ([`host`])
//! - [`host`]: the far-side serve loop; backs the bundled
//!   `enclavebox-context` image
//!
//! ## Entry Points ([`cli`])
//! - [`cli`]: flag parsing, pre-flight validation, the
//!   load -> program -> evaluate* -> destroy drive
//!
//! # Design Principles
//!
//! 1. **Illegal transitions are errors, not surprises** - every operation
//!    checks the handle state before touching the boundary
//! 2. **One envelope, one payload** - the tagged union makes ambiguous
//!    envelopes unrepresentable
//! 3. **Exactly-once calls** - no retry, no timeout; a failed call is fatal
//!    for its handle
//! 4. **Local state always advances on destroy** - an unacknowledged
//!    teardown must not leak the handle

// Command Protocol
pub mod protocol;

// Lifecycle Control
pub mod controller;

// Isolation Backends
pub mod backend;

// Context Host
pub mod host;

// CLI entrypoint wiring shared by the driver and context binaries.
pub mod cli;

// Re-export commonly used types for convenience
pub use backend::{BackendError, IsolationBackend};
pub use controller::{EnclaveController, EnclaveHandle, EnclaveState, LifecycleError};
pub use protocol::{Envelope, Payload, PayloadKind, ProtocolError};
