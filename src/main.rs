#[macro_use]
extern crate tracing;

use std::env;

use anyhow::anyhow;
use clap::Parser;
use marquee::cli::Cli;
use marquee::kiosk::Kiosk;
use marquee::utils::default_config_path;
use marquee_config::Config;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "marquee=debug,marquee_config=debug,warn";

fn main() -> anyhow::Result<()> {
    let directives = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    info!("starting version {}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(&cli)?;
    cli.apply(&mut config);

    let kiosk = Kiosk::new(config)?;
    kiosk.run(cli.launch_now)
}

/// An explicit `--config` must load. The default location may be missing or broken, in which
/// case the built-in defaults apply.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let _span = tracy_client::span!("load_config");

    if let Some(path) = &cli.config {
        return Config::load(path).map_err(|err| anyhow!("{err:?}"));
    }

    let Some(path) = default_config_path() else {
        debug!("no config directory, using the default config");
        return Ok(Config::default());
    };

    if !path.exists() {
        debug!("{path:?} not found, using the default config");
        return Ok(Config::default());
    }

    match Config::load(&path) {
        Ok(config) => Ok(config),
        Err(err) => {
            warn!("{err:?}");
            warn!("error loading config from {path:?}, using the default config");
            Ok(Config::default())
        }
    }
}
