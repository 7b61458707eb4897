use std::path::Path;

use super::super::{ConfigCmd, print_line};
use crate::Result;
use crate::config::{self, Config, ConfigError};

pub(crate) fn handle(cmd: ConfigCmd, cfg: &Config, explicit: Option<&Path>) -> Result<()> {
    match cmd {
        ConfigCmd::Show => {
            let rendered = toml::to_string_pretty(cfg).map_err(ConfigError::from)?;
            print_line(rendered.trim_end())
        }
        ConfigCmd::Path => {
            let path = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(config::config_path);
            print_line(&path.display().to_string())
        }
    }
}
