#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Build-time overrides for the wake-cycle configuration.
//!
//! Each knob can be set through the environment when the firmware is
//! compiled, e.g. `SENSOR_NODE_SLEEP_SECS=300 cargo build --release`.
//! Values that fail to parse fall back to the defaults.

use core::time::Duration;

use node_core::config::CycleConfig;

/// Configuration baked into this image.
pub const CYCLE_CONFIG: CycleConfig = resolve(
    option_env!("SENSOR_NODE_TOPIC"),
    option_env!("SENSOR_NODE_SLEEP_SECS"),
    option_env!("SENSOR_NODE_ACQUIRE_MS"),
    option_env!("SENSOR_NODE_BARRIER_MS"),
    option_env!("SENSOR_NODE_FLUSH_MS"),
    option_env!("SENSOR_NODE_RETRY_MS"),
);

const fn resolve(
    topic: Option<&'static str>,
    sleep_secs: Option<&str>,
    acquire_ms: Option<&str>,
    barrier_ms: Option<&str>,
    flush_ms: Option<&str>,
    retry_ms: Option<&str>,
) -> CycleConfig {
    let mut config = CycleConfig::new();
    if let Some(topic) = topic {
        config = config.with_topic(topic);
    }
    if let Some(secs) = parse_override(sleep_secs) {
        config = config.with_sleep_interval(Duration::from_secs(secs));
    }
    if let Some(ms) = parse_override(acquire_ms) {
        config = config.with_acquisition_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = parse_override(barrier_ms) {
        config = config.with_barrier_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = parse_override(flush_ms) {
        config = config.with_flush_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = parse_override(retry_ms) {
        config = config.with_retry_interval(Duration::from_millis(ms));
    }
    config
}

const fn parse_override(value: Option<&str>) -> Option<u64> {
    match value {
        Some(text) => parse_decimal(text),
        None => None,
    }
}

/// Parses an unsigned decimal literal; `None` on empty input, stray characters, or overflow.
const fn parse_decimal(text: &str) -> Option<u64> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return None;
    }

    let mut value: u64 = 0;
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        if !byte.is_ascii_digit() {
            return None;
        }
        value = match value.checked_mul(10) {
            Some(scaled) => match scaled.checked_add((byte - b'0') as u64) {
                Some(sum) => sum,
                None => return None,
            },
            None => return None,
        };
        index += 1;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_parser_rejects_garbage() {
        assert_eq!(parse_decimal("300"), Some(300));
        assert_eq!(parse_decimal("0"), Some(0));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("5s"), None);
        assert_eq!(parse_decimal("-1"), None);
        assert_eq!(parse_decimal("99999999999999999999"), None);
    }

    #[test]
    fn overrides_replace_only_what_is_set() {
        let config = resolve(
            Some("garden/bed-3"),
            Some("300"),
            None,
            Some("oops"),
            Some("1500"),
            Some("250"),
        );

        assert_eq!(config.topic, "garden/bed-3");
        assert_eq!(config.sleep_interval, Duration::from_secs(300));
        assert_eq!(config.acquisition_timeout, CycleConfig::DEFAULT_ACQUISITION_TIMEOUT);
        assert_eq!(config.barrier_timeout, CycleConfig::DEFAULT_BARRIER_TIMEOUT);
        assert_eq!(config.flush_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry_interval, Duration::from_millis(250));
    }

    #[test]
    fn unset_environment_keeps_defaults() {
        assert_eq!(
            resolve(None, None, None, None, None, None),
            CycleConfig::new()
        );
    }
}
