use super::{Config, ConfigLayer};

pub const ENV_WORKERS: &str = "ENTITY_REPL_WORKERS";
pub const ENV_PASSIVE_ACK_TIMEOUT_MS: &str = "ENTITY_REPL_PASSIVE_ACK_TIMEOUT_MS";
pub const ENV_LOG: &str = "ENTITY_REPL_LOG";

/// Applies `layers` over the defaults; later layers win.
pub fn merge_layers(layers: impl IntoIterator<Item = ConfigLayer>) -> Config {
    let mut config = Config::default();
    for layer in layers {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

/// Invalid values are logged and ignored.
pub(crate) fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(raw) = lookup(ENV_WORKERS) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<usize>() {
                Ok(0) => tracing::warn!("{ENV_WORKERS} must be positive, ignoring"),
                Ok(value) => config.lanes.workers = value,
                Err(err) => tracing::warn!("invalid {ENV_WORKERS}, ignoring: {err}"),
            }
        }
    }

    if let Some(raw) = lookup(ENV_PASSIVE_ACK_TIMEOUT_MS) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u64>() {
                Ok(value) => config.limits.passive_ack_timeout_ms = value,
                Err(err) => {
                    tracing::warn!("invalid {ENV_PASSIVE_ACK_TIMEOUT_MS}, ignoring: {err}");
                }
            }
        }
    }

    if let Some(raw) = lookup(ENV_LOG) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            config.logging.filter = Some(trimmed.to_string());
        }
    }
}
