use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// In worker mode stdout carries protocol events, so logs go to stderr
/// without colors and the supervisor forwards them.
pub fn init(worker_mode: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if worker_mode {
        builder
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(false)
            .try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        // 이미 설치된 경우 (테스트 등)
        eprintln!("tracing subscriber already installed: {e}");
    }
}
