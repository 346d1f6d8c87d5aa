//! Fulfillment tuning knobs. The config travels inside the workflow input
//! (not read from the environment at replay time), so a restarted worker
//! with different settings still replays old instances deterministically.

use serde::{Deserialize, Serialize};

use crate::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FulfillmentConfig {
    pub order_queue: String,
    pub shipping_queue: String,
    pub receive_timeout_ms: u64,
    pub validate_timeout_ms: u64,
    pub payment_timeout_ms: u64,
    pub shipping_timeout_ms: u64,
    /// Manual review window; an `approve` signal cuts it short.
    pub review_delay_ms: u64,
    /// Attempts per activity, applied by the executor.
    pub activity_attempts: u32,
    /// Shipping child workflows per order before giving up.
    pub max_shipping_attempts: u32,
    /// Durable pause between shipping attempts.
    pub ship_retry_backoff_ms: u64,
    /// Whole-order execution budget.
    pub instance_deadline_ms: u64,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            order_queue: "orders-tq".to_string(),
            shipping_queue: "shipping-tq".to_string(),
            receive_timeout_ms: 3_000,
            validate_timeout_ms: 3_000,
            payment_timeout_ms: 5_000,
            shipping_timeout_ms: 5_000,
            review_delay_ms: 2_000,
            activity_attempts: 3,
            max_shipping_attempts: 3,
            ship_retry_backoff_ms: 500,
            instance_deadline_ms: 15_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
}

fn env_u64(var: &'static str, target: &mut u64) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var(var) {
        *target = raw
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw })?;
    }
    Ok(())
}

fn env_u32(var: &'static str, target: &mut u32) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var(var) {
        *target = raw
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw })?;
    }
    Ok(())
}

impl FulfillmentConfig {
    /// Defaults overridden by `ORDEX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("ORDEX_ORDER_QUEUE") {
            cfg.order_queue = v;
        }
        if let Ok(v) = std::env::var("ORDEX_SHIPPING_QUEUE") {
            cfg.shipping_queue = v;
        }
        env_u64("ORDEX_RECEIVE_TIMEOUT_MS", &mut cfg.receive_timeout_ms)?;
        env_u64("ORDEX_VALIDATE_TIMEOUT_MS", &mut cfg.validate_timeout_ms)?;
        env_u64("ORDEX_PAYMENT_TIMEOUT_MS", &mut cfg.payment_timeout_ms)?;
        env_u64("ORDEX_SHIPPING_TIMEOUT_MS", &mut cfg.shipping_timeout_ms)?;
        env_u64("ORDEX_REVIEW_DELAY_MS", &mut cfg.review_delay_ms)?;
        env_u32("ORDEX_ACTIVITY_ATTEMPTS", &mut cfg.activity_attempts)?;
        env_u32("ORDEX_MAX_SHIPPING_ATTEMPTS", &mut cfg.max_shipping_attempts)?;
        env_u64("ORDEX_SHIP_RETRY_BACKOFF_MS", &mut cfg.ship_retry_backoff_ms)?;
        env_u64("ORDEX_INSTANCE_DEADLINE_MS", &mut cfg.instance_deadline_ms)?;
        Ok(cfg)
    }

    pub fn activity_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.activity_attempts,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}
