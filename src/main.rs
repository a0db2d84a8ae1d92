use healthguard::config::AppConfig;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env();
    log::info!(
        "starting healthguard (data dir: {}, cycle: {}s, raw media ttl: {}s)",
        config.data_dir.display(),
        config.cycle_interval_secs,
        config.raw_media_ttl_secs,
    );

    if let Err(e) = healthguard::run(config).await {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
