use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber on stderr.
///
/// `RUST_LOG` takes precedence over `level`. With `json` set, events are
/// emitted as one JSON object per line with the current span list attached.
/// Calling this more than once is a no-op.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().with_span_list(true).try_init()
    } else {
        builder.compact().try_init()
    };
}
