// Configuration validation
//
// Validates that required fields are present and values are sensible.
// Hard violations fail before the engine starts; suspicious-but-legal
// values only log a warning.

use crate::{ConfigError, EngineConfig, FlushMode};
use tracing::warn;

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    validate_buffer(config)?;
    validate_flush(config)?;
    validate_delivery(config)?;
    Ok(())
}

fn validate_buffer(config: &EngineConfig) -> Result<(), ConfigError> {
    let buffer = &config.buffer;

    if buffer.chunk_limit_bytes == 0 {
        return Err(ConfigError::invalid(
            "buffer.chunk_limit_bytes",
            "must be greater than 0",
        ));
    }

    if buffer.total_limit_bytes == 0 {
        return Err(ConfigError::invalid(
            "buffer.total_limit_bytes",
            "must be greater than 0",
        ));
    }

    if buffer.chunk_limit_bytes > buffer.total_limit_bytes {
        return Err(ConfigError::invalid(
            "buffer.chunk_limit_bytes",
            format!(
                "chunk limit ({}) exceeds the total buffer limit ({})",
                buffer.chunk_limit_bytes, buffer.total_limit_bytes
            ),
        ));
    }

    if buffer.uses_time_key() {
        match buffer.timekey_range_secs {
            None => return Err(ConfigError::MissingTimekeyRange),
            Some(0) => {
                return Err(ConfigError::invalid(
                    "buffer.timekey_range_secs",
                    "must be greater than 0",
                ))
            }
            Some(_) => {}
        }
    } else if buffer.timekey_range_secs.is_some() {
        warn!("buffer.timekey_range_secs is set but 'time' is not among the chunk keys; it will be ignored");
    }

    // Warn about very large limits
    if buffer.chunk_limit_bytes > 1024 * 1024 * 1024 {
        warn!(
            chunk_limit_bytes = buffer.chunk_limit_bytes,
            "buffer.chunk_limit_bytes is very large; may cause memory issues"
        );
    }

    Ok(())
}

fn validate_flush(config: &EngineConfig) -> Result<(), ConfigError> {
    let flush = &config.flush;

    if flush.thread_count == 0 {
        return Err(ConfigError::invalid(
            "flush.thread_count",
            "must be greater than 0",
        ));
    }

    let resolved = config.resolved_flush_mode();
    if resolved == FlushMode::Fast && flush.interval_secs == 0 {
        return Err(ConfigError::invalid(
            "flush.interval_secs",
            "must be greater than 0 in fast flush mode",
        ));
    }

    if flush.tick_interval_ms == 0 {
        return Err(ConfigError::invalid(
            "flush.tick_interval_ms",
            "must be greater than 0",
        ));
    }

    if flush.burst_interval_ms == 0 {
        return Err(ConfigError::invalid(
            "flush.burst_interval_ms",
            "must be greater than 0",
        ));
    }

    if flush.burst_interval_ms > flush.tick_interval_ms {
        warn!(
            burst_interval_ms = flush.burst_interval_ms,
            tick_interval_ms = flush.tick_interval_ms,
            "flush.burst_interval_ms exceeds the tick interval; bursts will not shorten ticks"
        );
    }

    Ok(())
}

fn validate_delivery(config: &EngineConfig) -> Result<(), ConfigError> {
    let delivery = &config.delivery;

    if delivery.delayed_commit_timeout_secs == 0 {
        return Err(ConfigError::invalid(
            "delivery.delayed_commit_timeout_secs",
            "must be greater than 0",
        ));
    }

    if delivery.retry_base_interval_ms == 0 {
        return Err(ConfigError::invalid(
            "delivery.retry_base_interval_ms",
            "must be greater than 0",
        ));
    }

    if delivery.retry_max_interval().as_millis() < delivery.retry_base_interval().as_millis() {
        return Err(ConfigError::invalid(
            "delivery.retry_max_interval_secs",
            "must not be shorter than retry_base_interval_ms",
        ));
    }

    if delivery.retry_timeout_secs == 0 {
        return Err(ConfigError::invalid(
            "delivery.retry_timeout_secs",
            "must be greater than 0",
        ));
    }

    if delivery.retry_max_attempts == Some(0) {
        return Err(ConfigError::invalid(
            "delivery.retry_max_attempts",
            "must be greater than 0 when set",
        ));
    }

    Ok(())
}
