use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter; `json` switches to JSON lines.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));

    if json {
        fmt().json().with_env_filter(env_filter).with_target(false).init();
    } else {
        fmt().with_env_filter(env_filter).with_target(false).init();
    }
}
