use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, trace, warn};

use crate::control::{ControlInfo, ControlProvider, ControlValueType};

use super::rules::{ShedRule, applicable_rules};

/// A single shed or release decision.
///
/// Positive `shed_watts` requests that much load be shed; zero or negative
/// requests any active limit be removed. Created fresh per decision and
/// immediately consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShedAction {
    pub control_id: String,
    pub shed_watts: i32,
}

/// Last recorded action for one control.
///
/// One entry is kept per control id and overwritten after each action; no
/// history is retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShedControlInfo {
    pub control_id: String,
    /// When the control last changed.
    pub action_date: DateTime<Utc>,
    /// Power reading just before the action executed.
    pub watts_before_action: Option<i32>,
    pub action: ShedAction,
}

/// The rule evaluation engine: decides when to shed or release load.
///
/// Stateless apart from its thresholds; all mutable bookkeeping (sample
/// buffer, per-control action map) lives in the owning
/// [`LoadShedder`](super::service::LoadShedder).
#[derive(Debug, Clone)]
pub struct ShedStrategy {
    /// Average power above which shedding is required, in watts.
    pub shed_threshold_watts: i32,
    /// Whole-rule-set cool-down: no action while any applicable control
    /// changed within this window.
    pub limit_execution_monitor_secs: u32,
}

impl Default for ShedStrategy {
    fn default() -> Self {
        Self {
            shed_threshold_watts: 9500,
            limit_execution_monitor_secs: 60,
        }
    }
}

impl ShedStrategy {
    /// Evaluates the rule set against the averaged power reading.
    ///
    /// Returns zero or one action; the collection type leaves room for a
    /// future multi-action extension. Every failure mode (no rules, no
    /// applicable rules, no power reading, no resolvable control) resolves
    /// to an empty result with a log entry, never an error.
    pub fn evaluate_rules(
        &self,
        rules: &[ShedRule],
        infos: &HashMap<String, ShedControlInfo>,
        now: DateTime<Utc>,
        average_power: Option<i32>,
        providers: &[Arc<dyn ControlProvider>],
    ) -> Vec<ShedAction> {
        if rules.is_empty() {
            info!("no shed rules defined, no limit placed on power");
            return Vec::new();
        }
        let rules = applicable_rules(now.time(), rules);
        if rules.is_empty() {
            info!("no applicable shed rules, no limit placed on power");
            return Vec::new();
        }
        let Some(power) = average_power else {
            info!("power reading not available, no limit placed on power");
            return Vec::new();
        };

        let mut actions = Vec::with_capacity(1);
        if power > self.shed_threshold_watts {
            let desired = power - self.shed_threshold_watts;
            info!(
                power,
                threshold = self.shed_threshold_watts,
                "power limit required"
            );
            if let Some(control_id) = self.control_to_shed(&rules, infos, now, desired, providers)
            {
                actions.push(ShedAction {
                    control_id,
                    shed_watts: desired,
                });
            } else {
                warn!(desired_watts = desired, "no control available to shed load");
            }
        } else {
            // a release request carries the (zero or negative) surplus
            let desired = power - self.shed_threshold_watts;
            if let Some(control_id) = self.control_to_release(&rules, infos, now, providers) {
                actions.push(ShedAction {
                    control_id,
                    shed_watts: desired,
                });
            } else {
                trace!("no controls need a limit lifted");
            }
        }
        actions
    }

    /// First eligible, non-limiting control in priority order, unless the
    /// whole rule set is inside the cool-down window.
    fn control_to_shed(
        &self,
        rules: &[ShedRule],
        infos: &HashMap<String, ShedControlInfo>,
        now: DateTime<Utc>,
        desired_watts: i32,
        providers: &[Arc<dyn ControlProvider>],
    ) -> Option<String> {
        // a change on ANY applicable control within the cool-down window
        // suppresses action across the whole rule set, not just that control
        for rule in rules {
            if self.acted_too_recently(infos.get(&rule.control_id), now) {
                debug!(
                    control_id = %rule.control_id,
                    "control changed too recently to enforce a limit now"
                );
                return None;
            }
        }

        for rule in rules {
            let Some(provider) = provider_for_control(providers, &rule.control_id) else {
                warn!(
                    control_id = %rule.control_id,
                    "control not available, cannot use to limit power"
                );
                continue;
            };
            let Some(control) = provider.current_control_info(&rule.control_id) else {
                warn!(
                    control_id = %rule.control_id,
                    "control state not readable, cannot use to limit power"
                );
                continue;
            };
            if control_is_limiting(&control) {
                debug!(
                    control_id = %rule.control_id,
                    desired_watts,
                    "control already limiting power"
                );
            } else {
                info!(
                    control_id = %rule.control_id,
                    desired_watts,
                    "found control available for load shed"
                );
                return Some(rule.control_id.clone());
            }
        }
        None
    }

    /// First eligible control currently limiting, scanned in reverse priority
    /// order, respecting each rule's minimum hold period.
    fn control_to_release(
        &self,
        rules: &[ShedRule],
        infos: &HashMap<String, ShedControlInfo>,
        now: DateTime<Utc>,
        providers: &[Arc<dyn ControlProvider>],
    ) -> Option<String> {
        for rule in rules {
            if self.acted_too_recently(infos.get(&rule.control_id), now) {
                trace!(
                    control_id = %rule.control_id,
                    "control changed too recently to release any limit now"
                );
                return None;
            }
        }

        // release in reverse order of limiting
        for rule in rules.iter().rev() {
            let Some(provider) = provider_for_control(providers, &rule.control_id) else {
                warn!(
                    control_id = %rule.control_id,
                    "control not available, cannot use to limit power"
                );
                continue;
            };
            if within_limit_hold(infos.get(&rule.control_id), rule, now) {
                debug!(
                    control_id = %rule.control_id,
                    "control within limit hold period, cannot release limit now"
                );
                continue;
            }
            let Some(control) = provider.current_control_info(&rule.control_id) else {
                warn!(
                    control_id = %rule.control_id,
                    "control state not readable, cannot use to remove limit"
                );
                continue;
            };
            if control_is_limiting(&control) {
                info!(
                    control_id = %rule.control_id,
                    "found control available for removing load shed limit"
                );
                return Some(rule.control_id.clone());
            }
            trace!(
                control_id = %rule.control_id,
                "control already not limiting power, cannot use to remove limit"
            );
        }
        None
    }

    fn acted_too_recently(&self, info: Option<&ShedControlInfo>, now: DateTime<Utc>) -> bool {
        let Some(info) = info else { return false };
        info.action_date + Duration::seconds(i64::from(self.limit_execution_monitor_secs)) > now
    }
}

/// Whether the control is inside its post-shed hold window and thus
/// ineligible for release.
fn within_limit_hold(
    info: Option<&ShedControlInfo>,
    rule: &ShedRule,
    now: DateTime<Utc>,
) -> bool {
    let (Some(info), Some(minutes)) = (info, rule.minimum_limit_minutes) else {
        return false;
    };
    info.action.shed_watts > 0 && info.action_date + Duration::minutes(i64::from(minutes)) > now
}

/// Whether the control reports itself as actively limiting power.
///
/// Only Boolean-typed controls are interpretable; a truthy value is `"1"`,
/// `"yes"`, or `"true"` ignoring case. Other types are unsupported.
fn control_is_limiting(control: &ControlInfo) -> bool {
    match control.value_type {
        ControlValueType::Boolean => {
            let v = control.value.as_str();
            v == "1" || v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true")
        }
        other => {
            warn!(
                control_id = %control.control_id,
                value_type = ?other,
                "control data type not supported, cannot use to limit power"
            );
            false
        }
    }
}

fn provider_for_control<'a>(
    providers: &'a [Arc<dyn ControlProvider>],
    control_id: &str,
) -> Option<&'a Arc<dyn ControlProvider>> {
    providers
        .iter()
        .find(|p| p.available_control_ids().iter().any(|id| id == control_id))
}
