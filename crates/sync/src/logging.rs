use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber for sync client binaries.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,relaydesk_sync=info,relaydesk_watch=info"));

    if json {
        fmt().json().with_env_filter(env_filter).init();
    } else {
        fmt().with_env_filter(env_filter).init();
    }
}
