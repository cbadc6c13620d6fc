use anyhow::Result;

fn main() -> Result<()> {
    benchmonik_runner::cli::execute()
}
