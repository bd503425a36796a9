//! Pure discovery rules: label filtering, kind mapping, priority and
//! deadline derivation, and comment actionability.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ProjectConfig;

/// Kind tag derived from an item's labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindTag {
    Issue,
    Comment,
    PrReview,
}

/// Map labels to a task kind.
///
/// `task:bug` and `task:feature` mark plain issues, `comment` marks a
/// conversational follow-up, `review` requests a pull-request review.
/// Anything else defaults to an issue task.
pub fn kind_from_labels(labels: &[String]) -> KindTag {
    for label in labels {
        match label.as_str() {
            "task:bug" | "task:feature" => return KindTag::Issue,
            "comment" => return KindTag::Comment,
            "review" => return KindTag::PrReview,
            _ => {}
        }
    }
    KindTag::Issue
}

/// Whether an item's labels admit it for the given project.
///
/// An empty include list admits everything; any overlap with the exclude
/// list rejects.
pub fn labels_admit(project: &ProjectConfig, labels: &[String]) -> bool {
    if labels
        .iter()
        .any(|l| project.exclude_labels.iter().any(|e| e == l))
    {
        return false;
    }
    if project.labels.is_empty() {
        return true;
    }
    labels.iter().any(|l| project.labels.iter().any(|i| i == l))
}

/// Derive a base priority from labels, boosted by item age.
///
/// Label table: urgent=100, high=75, normal=50, low=25 (default 50).
/// Items older than 7 days gain +10, and +10 more beyond 14 days.
pub fn base_priority(
    labels: &[String],
    created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> u8 {
    let mut priority: i64 = labels
        .iter()
        .find_map(|label| match label.trim_start_matches("priority:") {
            "urgent" => Some(100),
            "high" => Some(75),
            "normal" => Some(50),
            "low" => Some(25),
            _ => None,
        })
        .unwrap_or(50);

    if let Some(created) = created_at {
        let age_days = (now - created).num_days();
        if age_days > 7 {
            priority += 10;
        }
        if age_days > 14 {
            priority += 10;
        }
    }
    priority.clamp(0, 100) as u8
}

/// Extract an explicit `deadline: YYYY-MM-DD` marker from an item body.
///
/// The deadline is interpreted as the end of that day, UTC.
pub fn extract_deadline(body: &str) -> Option<DateTime<Utc>> {
    static DEADLINE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?im)^\s*deadline:\s*(\d{4}-\d{2}-\d{2})\s*$").unwrap());
    let caps = DEADLINE.captures(body)?;
    let date = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()?;
    let end_of_day = date.and_hms_opt(23, 59, 59)?;
    Utc.from_utc_datetime(&end_of_day).into()
}

/// Whether a comment asks for work rather than merely chatting.
///
/// A comment is actionable when it matches any of a small keyword set or
/// mentions the given handle explicitly.
pub fn is_actionable_comment(body: &str, mention: Option<&str>) -> bool {
    static KEYWORDS: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\b(please|fix|implement|resolve|update|add|handle|investigate)\b")
            .unwrap()
    });
    if KEYWORDS.is_match(body) {
        return true;
    }
    if let Some(handle) = mention {
        let at = format!("@{}", handle);
        return body.contains(&at);
    }
    false
}

/// Whether a pull request is fresh enough to review: not stale for more
/// than 3 days.
pub fn pr_is_fresh(updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match updated_at {
        Some(updated) => (now - updated).num_days() < 3,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_kind_mapping_table() {
        assert_eq!(kind_from_labels(&labels(&["task:bug"])), KindTag::Issue);
        assert_eq!(kind_from_labels(&labels(&["task:feature"])), KindTag::Issue);
        assert_eq!(kind_from_labels(&labels(&["comment"])), KindTag::Comment);
        assert_eq!(kind_from_labels(&labels(&["review"])), KindTag::PrReview);
        assert_eq!(kind_from_labels(&labels(&["whatever"])), KindTag::Issue);
        assert_eq!(kind_from_labels(&[]), KindTag::Issue);
    }

    #[test]
    fn test_label_admission() {
        let mut project = ProjectConfig::new("p", "o", "r");
        project.labels = labels(&["task:bug"]);
        project.exclude_labels = labels(&["wontfix"]);

        assert!(labels_admit(&project, &labels(&["task:bug"])));
        assert!(!labels_admit(&project, &labels(&["task:bug", "wontfix"])));
        assert!(!labels_admit(&project, &labels(&["task:feature"])));

        // Empty include list admits everything not excluded
        project.labels.clear();
        assert!(labels_admit(&project, &labels(&["anything"])));
        assert!(!labels_admit(&project, &labels(&["wontfix"])));
    }

    #[test_case::test_case("urgent", 100)]
    #[test_case::test_case("priority:urgent", 100)]
    #[test_case::test_case("high", 75)]
    #[test_case::test_case("priority:high", 75)]
    #[test_case::test_case("normal", 50)]
    #[test_case::test_case("low", 25)]
    #[test_case::test_case("task:bug", 50; "unknown labels default to normal")]
    fn test_priority_label_table(label: &str, expected: u8) {
        assert_eq!(base_priority(&labels(&[label]), None, Utc::now()), expected);
    }

    #[test]
    fn test_priority_age_boost() {
        let now = Utc::now();
        let eight_days = Some(now - Duration::days(8));
        let three_weeks = Some(now - Duration::days(21));
        assert_eq!(base_priority(&labels(&["low"]), eight_days, now), 35);
        assert_eq!(base_priority(&labels(&["low"]), three_weeks, now), 45);
        // Clamped at 100
        assert_eq!(base_priority(&labels(&["urgent"]), three_weeks, now), 100);
    }

    #[test]
    fn test_deadline_extraction() {
        let body = "Fix the flaky test.\n\ndeadline: 2026-09-15\n";
        let deadline = extract_deadline(body).unwrap();
        assert_eq!(deadline.date_naive().to_string(), "2026-09-15");
        assert_eq!(deadline.time().to_string(), "23:59:59");

        assert!(extract_deadline("no marker here").is_none());
        assert!(extract_deadline("deadline: tomorrow").is_none());
    }

    #[test]
    fn test_comment_actionability() {
        assert!(is_actionable_comment("Please fix the retry loop", None));
        assert!(is_actionable_comment("could you implement this?", None));
        assert!(is_actionable_comment("ping @pilot-bot", Some("pilot-bot")));
        assert!(!is_actionable_comment("thanks, looks great!", Some("pilot-bot")));
        assert!(!is_actionable_comment("lgtm", None));
    }

    #[test]
    fn test_pr_freshness() {
        let now = Utc::now();
        assert!(pr_is_fresh(Some(now - Duration::days(1)), now));
        assert!(!pr_is_fresh(Some(now - Duration::days(4)), now));
        assert!(pr_is_fresh(None, now));
    }
}
