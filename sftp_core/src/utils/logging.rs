use log::LevelFilter;

/// Initialize logging using env_logger.
/// `default_level` applies first; the RUST_LOG environment variable then
/// refines it, e.g. `RUST_LOG=sftp_core=debug sftp-rs --profile build ls`.
pub fn init_logging(default_level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .try_init();
}
