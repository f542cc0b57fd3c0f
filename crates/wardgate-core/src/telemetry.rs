use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Called once, from
/// `wardgate-app`'s `main`. `json` selects structured JSON output
/// (suitable for shipping to a log aggregator); otherwise a human
/// readable formatter is used.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
