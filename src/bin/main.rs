use dirrepl::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let cfg = load_config(cli.config.as_deref());
    let _telemetry_guard = telemetry::init(telemetry::TelemetryConfig::new(
        cli.verbose,
        cfg.logging.clone(),
    ));

    if let Err(e) = cli::run(cli, &cfg) {
        tracing::error!("error: {}", e);
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn load_config(explicit: Option<&std::path::Path>) -> config::Config {
    match config::load(explicit) {
        Ok(cfg) => cfg,
        Err(err) if explicit.is_some() => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("config load failed, using defaults: {err}");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}
