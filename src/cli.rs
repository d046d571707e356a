use std::path::PathBuf;

use clap::Parser;
use marquee_config::{Config, ModeSize};

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (default: `$XDG_CONFIG_HOME/marquee/config.kdl`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// DRM device to try, in order. Can be given several times.
    #[arg(short, long = "device", value_name = "PATH")]
    pub devices: Vec<PathBuf>,
    /// Display mode as WIDTHxHEIGHT, overriding the config.
    #[arg(short, long)]
    pub mode: Option<ModeSize>,
    /// Hand the display to the configured command right after startup.
    #[arg(long)]
    pub launch_now: bool,
}

impl Cli {
    /// Puts the command-line overrides on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if !self.devices.is_empty() {
            config.display.devices = self.devices.clone();
        }

        if let Some(mode) = self.mode {
            config.display.mode = Some(mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_devices_and_mode() {
        let cli = Cli::try_parse_from([
            "marquee",
            "--device",
            "/dev/dri/card1",
            "-d",
            "/dev/dri/card2",
            "--mode",
            "1280x720",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(
            config.display.devices,
            [PathBuf::from("/dev/dri/card1"), PathBuf::from("/dev/dri/card2")]
        );
        assert_eq!(config.display.mode, Some(ModeSize::new(1280, 720)));
        assert!(!cli.launch_now);
    }

    #[test]
    fn no_arguments_keep_config() {
        let cli = Cli::try_parse_from(["marquee"]).unwrap();

        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn rejects_malformed_mode() {
        assert!(Cli::try_parse_from(["marquee", "--mode", "wide"]).is_err());
    }
}
