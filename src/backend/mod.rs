//! Isolation subsystem interface.
//!
//! The controller consumes isolation through this narrow seam: instantiate
//! a context from an image, perform synchronous envelope round trips, tear
//! the context down. Everything behind the seam (process plumbing, memory
//! sealing, attestation) is the backend's business and the only source of
//! environmental failure the controller recognizes.

pub mod process;
pub mod sim;
pub mod wire;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::protocol::Envelope;

/// Environmental and transport failures beneath the controller.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("context image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("context reported error: {0}")]
    Context(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// The boundary-crossing contract.
///
/// `call` is synchronous, blocking, and exactly-once: the backend must not
/// retry on its own, because the context's execution is not guaranteed
/// idempotent. A call that does not return successfully is fatal for the
/// context it addressed.
pub trait IsolationBackend {
    /// Backend-owned handle to one instantiated context.
    type Context;

    fn instantiate(&mut self, image: &Path, debug: bool) -> Result<Self::Context>;

    fn call(&mut self, ctx: &mut Self::Context, request: Envelope) -> Result<Envelope>;

    fn teardown(&mut self, ctx: Self::Context) -> Result<()>;
}
