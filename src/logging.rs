use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber. `log` records are bridged into it, so
/// library code keeps using the `log` macros. `RUST_LOG` overrides the default
/// `info` level. Output goes to stderr; stdout belongs to the console transport.
pub fn init_logging() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();

    if let Err(e) = installed {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}
