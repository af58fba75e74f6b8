use log::LevelFilter;

/// `RUST_LOG` wins when set; otherwise `--debug` picks between debug and info.
pub fn init_logging(debug: bool) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
        return;
    }

    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_target(true)
        .init();
}
