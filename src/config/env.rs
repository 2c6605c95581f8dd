use super::{BrokerRole, RangeConfig};

/// Apply `RANGE_*` environment overrides on top of a loaded configuration.
/// Unparsable values are ignored.
pub fn apply_env_overrides(config: &mut RangeConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup, so tests
/// do not have to mutate the process environment.
pub fn apply_overrides_from<F>(config: &mut RangeConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("RANGE_BROKER_HOST") {
        if !host.trim().is_empty() {
            config.brokers.host = host;
        }
    }

    for (role, key) in [
        (BrokerRole::Main, "RANGE_MAIN_PORT"),
        (BrokerRole::Red, "RANGE_RED_PORT"),
        (BrokerRole::Blue, "RANGE_BLUE_PORT"),
    ] {
        if let Some(v) = lookup(key) {
            if let Ok(port) = v.parse::<u16>() {
                config.brokers.endpoint_mut(role).port = port;
            }
        }
    }

    if let Some(v) = lookup("RANGE_STALE_TIMEOUT_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            config.liveness.stale_timeout_seconds = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("RANGE_BROKER_HOST", "10.0.0.5"),
            ("RANGE_RED_PORT", "9001"),
            ("RANGE_BLUE_PORT", "not-a-port"),
            ("RANGE_STALE_TIMEOUT_SECONDS", "45"),
        ]
        .into_iter()
        .collect();

        let mut config = RangeConfig::default();
        apply_overrides_from(&mut config, |k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.brokers.host, "10.0.0.5");
        assert_eq!(config.brokers.red.port, 9001);
        assert_eq!(config.brokers.blue.port, 8082);
        assert_eq!(config.brokers.main.port, 8080);
        assert_eq!(config.liveness.stale_timeout_seconds, 45);
    }
}
