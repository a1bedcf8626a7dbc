//! Logger setup for the loader binary

/// Initialize `env_logger` on stderr so stdout stays free for record output.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` when
/// `debug` is true.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };

    // A second init (e.g. from tests) is harmless.
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .try_init();
}
