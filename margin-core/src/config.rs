//! Sync tuning knobs shared by the stores.

use crate::{OrderKey, ValidationError, DEFAULT_ORDER_GAP};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_STALE_THRESHOLD_MS: u64 = 5 * 60 * 1000;
const DEFAULT_AUTOSAVE_DELAY_MS: u64 = 800;
const DEFAULT_PAGE_SIZE: u32 = 50;

/// Durations are stored in milliseconds so the struct reads naturally from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Age after which a cached response is reported stale.
    pub stale_threshold_ms: u64,
    /// Spacing between order keys after normalization.
    pub order_gap: OrderKey,
    /// Quiet period before an autosave is written.
    pub autosave_delay_ms: u64,
    /// Upper bound on a batch selection. `None` means unbounded.
    pub max_selection: Option<usize>,
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            order_gap: DEFAULT_ORDER_GAP,
            autosave_delay_ms: DEFAULT_AUTOSAVE_DELAY_MS,
            max_selection: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_autosave_delay(mut self, delay: Duration) -> Self {
        self.autosave_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_selection(mut self, max: usize) -> Self {
        self.max_selection = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.order_gap < 2 {
            return Err(ValidationError::invalid("order_gap", "must be >= 2"));
        }
        if self.page_size == 0 {
            return Err(ValidationError::invalid("page_size", "must be > 0"));
        }
        if self.max_selection == Some(0) {
            return Err(ValidationError::invalid(
                "max_selection",
                "must be > 0 when set",
            ));
        }
        Ok(())
    }
}
