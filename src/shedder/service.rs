use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::ShedSettings;
use crate::control::{ControlProvider, PowerSource};
use crate::reactor::store::{InstructionStore, StoreError};

use super::rules::ShedRule;
use super::sample::SampleBuffer;
use super::strategy::{ShedAction, ShedControlInfo, ShedStrategy};
use super::translate::shed_load_instruction;

/// Long-lived demand-response controller for one node.
///
/// Owns the rule list, the rolling power-sample buffer, and the per-control
/// action map; none of these are designed for concurrent mutation, so the
/// evaluation entry point takes `&mut self` and callers serialize access.
/// The controller coordinates with the periodic reactor jobs only through
/// the durable instruction store.
pub struct LoadShedder {
    strategy: ShedStrategy,
    rules: Vec<ShedRule>,
    providers: Vec<Arc<dyn ControlProvider>>,
    power_source: Arc<dyn PowerSource>,
    store: Arc<dyn InstructionStore>,
    power_average_sample_secs: u32,
    samples: SampleBuffer,
    control_infos: HashMap<String, ShedControlInfo>,
    last_evaluation: Option<DateTime<Utc>>,
}

impl LoadShedder {
    pub fn new(
        settings: &ShedSettings,
        rules: Vec<ShedRule>,
        providers: Vec<Arc<dyn ControlProvider>>,
        power_source: Arc<dyn PowerSource>,
        store: Arc<dyn InstructionStore>,
    ) -> Self {
        Self {
            strategy: ShedStrategy {
                shed_threshold_watts: settings.shed_threshold_watts,
                limit_execution_monitor_secs: settings.limit_execution_monitor_secs,
            },
            rules,
            providers,
            power_source,
            store,
            power_average_sample_secs: settings.power_average_sample_secs,
            samples: SampleBuffer::new(settings.sample_buffer_limit),
            control_infos: HashMap::new(),
            last_evaluation: None,
        }
    }

    /// Evaluates current demand and sheds or releases load as necessary.
    ///
    /// One cycle: pull a power sample, average the trailing window, run the
    /// rule evaluation, translate each resulting action into a `ShedLoad`
    /// instruction handed to the durable store, and overwrite the per-control
    /// action record. Decision failure modes resolve to an empty result;
    /// only store failures are errors.
    pub fn evaluate_power_load(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ShedAction>, StoreError> {
        self.last_evaluation = Some(now);
        match self.power_source.read_power() {
            Some(sample) => {
                // repeated timestamps mean an unchanged reading
                self.samples.push(sample);
            }
            None => debug!("no current power reading available"),
        }
        let average = self.samples.average(now, self.power_average_sample_secs);
        let actions = self.strategy.evaluate_rules(
            &self.rules,
            &self.control_infos,
            now,
            average,
            &self.providers,
        );
        for action in &actions {
            let instruction = shed_load_instruction(action, now);
            let id = self.store.store_instruction(instruction)?;
            info!(
                instruction_id = id,
                control_id = %action.control_id,
                shed_watts = action.shed_watts,
                "stored shed instruction"
            );
            self.record_action(action, now);
        }
        Ok(actions)
    }

    fn record_action(&mut self, action: &ShedAction, now: DateTime<Utc>) {
        let watts_before_action = self.samples.latest().map(|s| s.watts);
        self.control_infos.insert(
            action.control_id.clone(),
            ShedControlInfo {
                control_id: action.control_id.clone(),
                action_date: now,
                watts_before_action,
                action: action.clone(),
            },
        );
    }

    /// Last recorded action for a control, if any.
    pub fn control_info(&self, control_id: &str) -> Option<&ShedControlInfo> {
        self.control_infos.get(control_id)
    }

    /// When the controller last ran an evaluation cycle.
    pub fn last_evaluation_date(&self) -> Option<DateTime<Utc>> {
        self.last_evaluation
    }

    /// Number of samples currently buffered.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
