use anyhow::Result;

fn main() -> Result<()> {
    enclavebox::cli::run_context()
}
