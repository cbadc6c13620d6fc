use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use benchmonik_core::Registry;
use tokio_util::sync::CancellationToken;

use crate::observability;
use crate::run::{Runner, scenario_files};

/// Runs benchmark scenarios against storage and queue backends.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to a JSON or YAML scenario file, may be given more than once
    #[argh(option, short = 'c')]
    pub config: Vec<PathBuf>,

    /// directory whose scenario files are all run, in sorted order
    #[argh(option, short = 'd')]
    pub dir: Option<PathBuf>,

    /// directory for backends that store data locally
    #[argh(option)]
    pub backend_root: Option<PathBuf>,

    /// sample resident memory around every measured phase
    #[argh(switch)]
    pub profile_memory: bool,

    /// log the timing of every scenario, iteration and phase
    #[argh(switch)]
    pub trace: bool,
}

/// Bootstrap the runtime and run the scenario files given on the command line.
///
/// Failing scenario files are logged and do not change the result. Only invalid arguments are
/// reported as errors.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();
    let files = scenario_files(&args.config, args.dir.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("benchmonik-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(args.trace);
    tracing::debug!(?args);

    let cancel = CancellationToken::new();
    runtime.spawn(cancel_on_interrupt(cancel.clone()));

    let runner = Runner::new(Registry::builtin())
        .backend_root(args.backend_root)
        .profile_memory(args.profile_memory)
        .progress(true);
    let failed = runtime.block_on(runner.run_files(&files, &cancel));

    if failed > 0 {
        tracing::warn!(failed, total = files.len(), "some scenario files failed");
    }
    Ok(())
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupted, cancelling the running iteration");
        cancel.cancel();
    }
}
