//! Process entry points for the driver and the bundled context image.
//!
//! The driver parses flags, validates them before any controller call, and
//! runs the load -> program -> evaluate* -> destroy sequence. Every
//! controller error is fatal to the whole run: logged, no retry, no
//! skip-and-continue, non-zero exit.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use thiserror::Error;

use crate::backend::process::{ProcessBackend, DEBUG_ENV_VAR};
use crate::controller::{EnclaveController, EnclaveHandle};
use crate::host;

/// Program installed when `--script` is not given: the driver's original
/// demo program.
const DEFAULT_SCRIPT: &str =
    "(define fib (lambda (n) (if (<= n 2) 1 (+ (fib (- n 1)) (fib (- n 2))))))";

/// Name the context is registered under when `--name` is not given.
const DEFAULT_ENCLAVE_NAME: &str = "oak_enclave";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the context image to load
    #[arg(long)]
    enclave_path: PathBuf,

    /// A comma-separated list of expressions to pass to the enclave
    #[arg(long)]
    expressions: String,

    /// Load the context in debug mode
    #[arg(long)]
    debug: bool,

    /// Name to register the context under
    #[arg(long, default_value = DEFAULT_ENCLAVE_NAME)]
    name: String,

    /// Program to install instead of the built-in demo script
    #[arg(long)]
    script: Option<String>,
}

/// Invalid caller arguments, detected before any controller call.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum ConfigError {
    #[error("must supply a non-empty list of expressions with --expressions")]
    EmptyExpressions,
}

/// Split the `--expressions` flag. Empty segments are preserved; only a
/// fully empty flag is rejected.
pub fn parse_expressions(raw: &str) -> std::result::Result<Vec<String>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::EmptyExpressions);
    }
    Ok(raw.split(',').map(str::to_string).collect())
}

/// Driver entry point.
pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let expressions = parse_expressions(&cli.expressions)?;
    let script = cli.script.as_deref().unwrap_or(DEFAULT_SCRIPT);

    println!("Loading {}", cli.enclave_path.display());
    let mut controller = EnclaveController::new(ProcessBackend::new());
    let mut handle = controller.load(&cli.name, &cli.enclave_path, cli.debug)?;
    info!("Enclave initialised");

    match drive(&mut controller, &mut handle, script, &expressions) {
        Ok(()) => {
            info!("Destroying enclave");
            controller.destroy(&mut handle)?;
            info!("Enclave destroyed");
            Ok(())
        }
        Err(e) => {
            // The legacy driver aborted here and leaked the context; this
            // one reclaims it before reporting the original failure.
            info!("Destroying enclave after failure");
            if let Err(destroy_err) = controller.destroy(&mut handle) {
                warn!("destroy after failure also failed: {destroy_err}");
            }
            Err(e)
        }
    }
}

fn drive(
    controller: &mut EnclaveController<ProcessBackend>,
    handle: &mut EnclaveHandle,
    script: &str,
    expressions: &[String],
) -> Result<()> {
    info!("Programming enclave");
    controller.program(handle, script)?;
    info!("Enclave programmed");

    for expression in expressions {
        info!("sending expression to enclave: {expression}");
        let output = controller.evaluate(handle, expression)?;
        println!("Message from enclave: {output}");
    }
    Ok(())
}

/// Entry point for the bundled context image: serve envelope frames on
/// stdio until finalized. Log verbosity follows the debug flag the driver
/// passed through the environment.
pub fn run_context() -> Result<()> {
    let debug = std::env::var(DEBUG_ENV_VAR).map(|v| v == "1").unwrap_or(false);
    let default_filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    host::serve(&mut stdin.lock(), &mut stdout.lock())?;
    Ok(())
}
