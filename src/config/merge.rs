use std::str::FromStr;

use crate::core::{GroupId, ServerId};

use super::{Config, ConfigLayer};

pub fn merge_layers(layers: impl IntoIterator<Item = ConfigLayer>) -> Config {
    let mut config = Config::default();
    for layer in layers {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply `DIRREPL_*` overrides read through `lookup`.
pub fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(id) = parse_value::<u16>(&lookup, "DIRREPL_SERVER_ID") {
        config.replication.server_id = ServerId::new(id);
    }
    if let Some(id) = parse_value::<u8>(&lookup, "DIRREPL_GROUP_ID") {
        config.replication.group_id = GroupId::new(id);
    }
    if let Some(ms) = parse_value::<u64>(&lookup, "DIRREPL_ASSURED_TIMEOUT_MS") {
        config.replication.assured_timeout_ms = Some(ms);
    }
    if let Some(window) = parse_value::<u32>(&lookup, "DIRREPL_WINDOW_SIZE") {
        config.replication.window_size = window;
    }
}

/// Parse a non-empty variable; invalid values are ignored.
fn parse_value<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}
