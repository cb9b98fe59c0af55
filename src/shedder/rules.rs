use std::cmp::Ordering;

use chrono::NaiveTime;

/// A prioritized, time-windowed binding between shedding policy and a
/// controllable switch.
///
/// Lower `priority` values are considered first when shedding; rules without
/// a priority sort after all prioritized rules. Rules are immutable once an
/// evaluation cycle starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShedRule {
    pub control_id: String,
    pub name: Option<String>,
    /// Ascending order of consideration; `None` sorts last.
    pub priority: Option<i32>,
    pub active: bool,
    /// Inclusive start of the daily applicability window.
    pub time_window_start: Option<NaiveTime>,
    /// Inclusive end of the daily applicability window.
    pub time_window_end: Option<NaiveTime>,
    /// Hold period after a shed action before the control is eligible for
    /// release.
    pub minimum_limit_minutes: Option<u32>,
}

impl ShedRule {
    /// Creates an always-applicable rule for `control_id` with no priority.
    pub fn new(control_id: impl Into<String>) -> Self {
        Self {
            control_id: control_id.into(),
            name: None,
            priority: None,
            active: true,
            time_window_start: None,
            time_window_end: None,
            minimum_limit_minutes: None,
        }
    }

    /// Whether the rule applies at the given time of day.
    ///
    /// No bounds means always applicable; a single bound is an open-ended
    /// window; both bounds are inclusive on both ends.
    pub fn falls_within_time_window(&self, time_of_day: NaiveTime) -> bool {
        match (self.time_window_start, self.time_window_end) {
            (None, None) => true,
            (None, Some(end)) => time_of_day <= end,
            (Some(start), None) => time_of_day >= start,
            (Some(start), Some(end)) => start <= time_of_day && time_of_day <= end,
        }
    }
}

/// Total order over rules: ascending priority with unset priorities last,
/// tie-broken by case-insensitive control id.
pub fn priority_order(a: &ShedRule, b: &ShedRule) -> Ordering {
    let by_priority = match (a.priority, b.priority) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_priority.then_with(|| {
        a.control_id
            .to_lowercase()
            .cmp(&b.control_id.to_lowercase())
    })
}

/// Rules that are active and applicable at `time_of_day`, sorted by
/// [`priority_order`].
pub fn applicable_rules(time_of_day: NaiveTime, rules: &[ShedRule]) -> Vec<ShedRule> {
    let mut applicable: Vec<ShedRule> = rules
        .iter()
        .filter(|r| r.active && r.falls_within_time_window(time_of_day))
        .cloned()
        .collect();
    applicable.sort_by(priority_order);
    applicable
}
