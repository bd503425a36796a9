//! Effective-priority computation and resource-share parsing.

use chrono::{DateTime, Duration, Utc};

/// Inputs that feed one effective-priority computation.
#[derive(Debug, Clone, Copy)]
pub struct PriorityInputs {
    /// Owning project's current (dynamic) priority
    pub project_priority: u8,
    /// Task's own base priority derived from labels
    pub task_priority: u8,
    /// Optional completion deadline
    pub deadline: Option<DateTime<Utc>>,
    /// Whether the owning project has quota headroom
    pub under_quota: bool,
}

/// Compute the effective priority in `[0, 100]`.
///
/// The blend weighs the project at 0.6 and the task at 0.4, then boosts:
/// +20 for a deadline inside 24 hours, +10 inside 72 hours, and +5 when
/// the project is under its resource quota. The retry boost is not part
/// of this formula; the queue applies it once to retrying tasks.
pub fn effective_priority(inputs: &PriorityInputs, now: DateTime<Utc>) -> u8 {
    let blended =
        (0.6 * inputs.project_priority as f64 + 0.4 * inputs.task_priority as f64).round();
    let mut value = blended as i64;

    if let Some(deadline) = inputs.deadline {
        let remaining = deadline - now;
        if remaining <= Duration::hours(24) {
            value += 20;
        } else if remaining <= Duration::hours(72) {
            value += 10;
        }
    }
    if inputs.under_quota {
        value += 5;
    }

    value.clamp(0, 100) as u8
}

/// Parse a Kubernetes-style CPU share: `"500m"` is half a core, `"2"`
/// is two cores.
pub fn parse_cpu_share(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Some(millis) = trimmed.strip_suffix('m') {
        let value: f64 = millis.parse().ok()?;
        if value < 0.0 {
            return None;
        }
        return Some(value / 1_000.0);
    }
    let value: f64 = trimmed.parse().ok()?;
    (value >= 0.0).then_some(value)
}

/// Parse a Kubernetes-style memory share into bytes: binary suffixes
/// (`Ki`, `Mi`, `Gi`, `Ti`), decimal suffixes (`K`, `M`, `G`, `T`), or a
/// plain byte count.
pub fn parse_memory_share(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let (digits, factor): (&str, u64) = if let Some(d) = trimmed.strip_suffix("Ki") {
        (d, 1 << 10)
    } else if let Some(d) = trimmed.strip_suffix("Mi") {
        (d, 1 << 20)
    } else if let Some(d) = trimmed.strip_suffix("Gi") {
        (d, 1 << 30)
    } else if let Some(d) = trimmed.strip_suffix("Ti") {
        (d, 1 << 40)
    } else if let Some(d) = trimmed.strip_suffix('K') {
        (d, 1_000)
    } else if let Some(d) = trimmed.strip_suffix('M') {
        (d, 1_000_000)
    } else if let Some(d) = trimmed.strip_suffix('G') {
        (d, 1_000_000_000)
    } else if let Some(d) = trimmed.strip_suffix('T') {
        (d, 1_000_000_000_000)
    } else {
        (trimmed, 1)
    };
    let value: u64 = digits.trim().parse().ok()?;
    value.checked_mul(factor)
}
