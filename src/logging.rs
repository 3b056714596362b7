//! Terminal logging with progress bars for running tasks.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a global subscriber printing log lines above the progress bars
/// of the executor. `RUST_LOG` overrides the default filter.
///
/// ```rust,no_run
/// haori::logging::init(false)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("haori={level}"))?,
    };

    let indicatif = IndicatifLayer::new();

    let stderr_layer = fmt::layer()
        .with_writer(indicatif.get_stderr_writer())
        .with_target(false)
        .with_thread_names(verbose)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(indicatif)
        .try_init()?;

    Ok(())
}
