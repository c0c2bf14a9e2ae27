//! APY stat status as the rendering layer sees it.

use crate::publisher::AggregateSnapshot;

/// Placeholder shown for values that are known to be unavailable.
pub const UNKNOWN_PLACEHOLDER: &str = "???";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApyStat {
    /// No snapshot has been published yet
    Loading,
    /// Data arrived but this pool's APY did not
    Unknown,
    Available { yearly: f64, daily: f64 },
}

impl ApyStat {
    /// Yearly APY as a percent string, `"???"` when unknown, `None` while loading.
    pub fn yearly_label(&self) -> Option<String> {
        match self {
            ApyStat::Loading => None,
            ApyStat::Unknown => Some(UNKNOWN_PLACEHOLDER.to_string()),
            ApyStat::Available { yearly, .. } => Some(format_percent(Some(*yearly))),
        }
    }

    pub fn daily_label(&self) -> Option<String> {
        match self {
            ApyStat::Loading => None,
            ApyStat::Unknown => Some(UNKNOWN_PLACEHOLDER.to_string()),
            ApyStat::Available { daily, .. } => Some(format_percent(Some(*daily))),
        }
    }
}

pub fn apy_stat(snapshot: Option<&AggregateSnapshot>, pool_id: &str) -> ApyStat {
    let Some(snapshot) = snapshot else {
        return ApyStat::Loading;
    };
    match snapshot.pools.iter().find(|pool| pool.id == pool_id) {
        Some(pool) if pool.apy_available => ApyStat::Available {
            yearly: pool.apy,
            daily: pool.daily,
        },
        _ => ApyStat::Unknown,
    }
}

/// Formats a fraction as a percent with two decimals (0.1234 → "12.34%").
pub fn format_percent(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.2}%", v * 100.0),
        _ => UNKNOWN_PLACEHOLDER.to_string(),
    }
}
