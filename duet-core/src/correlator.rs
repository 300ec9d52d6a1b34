use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::message::Message;
use crate::message::SegmentKind;
use crate::message::ToolCallPatch;
use crate::protocol::Panel;
use crate::protocol::StepKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelatorError {
    #[error("step `{step_id}` was never registered on the {panel} panel")]
    UnknownStep { panel: Panel, step_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStep {
    pub step_id: String,
    pub run_id: String,
    pub index: usize,
    pub kind: StepKind,
}

#[derive(Debug, Default)]
struct PanelScope {
    steps: HashMap<String, RunStep>,
    messages: HashMap<String, Message>,
    tool_call_ids: HashMap<String, String>,
    part_slots: HashMap<(String, SegmentKind), usize>,
}

impl PanelScope {
    fn is_empty(&self) -> bool {
        self.steps.is_empty()
            && self.messages.is_empty()
            && self.tool_call_ids.is_empty()
            && self.part_slots.is_empty()
    }
}

/// Turn-scoped maps from step ids to runs, run ids to messages and step ids
/// to tool-call ids, plus the side slots holding content parts whose kind
/// differs from their step's own segment. Every key lives under its panel,
/// so identical ids coming from the two panels never collide.
#[derive(Debug, Default)]
pub struct RunCorrelator {
    scopes: HashMap<Panel, PanelScope>,
}

impl RunCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a step. Re-registering a known step keeps the first record.
    ///
    /// For a tool-calls step, the first tool call with a non-empty id names
    /// the step: deltas and completions that omit an id are attributed to
    /// it. Later ids in the same step are not recorded.
    pub fn register_step(
        &mut self,
        panel: Panel,
        step_id: &str,
        run_id: &str,
        index: usize,
        kind: StepKind,
        tool_calls: &[ToolCallPatch],
    ) -> &RunStep {
        let scope = self.scopes.entry(panel).or_default();

        if kind == StepKind::ToolCalls {
            let tool_call_id = tool_calls
                .iter()
                .filter_map(|tool_call| tool_call.id.as_deref())
                .find(|id| !id.is_empty());
            if let Some(id) = tool_call_id {
                scope
                    .tool_call_ids
                    .entry(step_id.to_string())
                    .or_insert_with(|| id.to_string());
            }
        }

        scope
            .steps
            .entry(step_id.to_string())
            .or_insert_with(|| {
                debug!(%panel, step_id, run_id, index, "registered run step");
                RunStep {
                    step_id: step_id.to_string(),
                    run_id: run_id.to_string(),
                    index,
                    kind,
                }
            })
    }

    pub fn step(&self, panel: Panel, step_id: &str) -> Option<&RunStep> {
        self.scopes.get(&panel)?.steps.get(step_id)
    }

    pub fn resolve_run(&self, panel: Panel, step_id: &str) -> Result<&str, CorrelatorError> {
        self.step(panel, step_id)
            .map(|step| step.run_id.as_str())
            .ok_or_else(|| CorrelatorError::UnknownStep {
                panel,
                step_id: step_id.to_string(),
            })
    }

    pub fn tool_call_id_for(&self, panel: Panel, step_id: &str) -> Option<&str> {
        self.scopes
            .get(&panel)?
            .tool_call_ids
            .get(step_id)
            .map(String::as_str)
    }

    pub fn message(&self, panel: Panel, run_id: &str) -> Option<&Message> {
        self.scopes.get(&panel)?.messages.get(run_id)
    }

    pub fn store_message(&mut self, panel: Panel, message: Message) {
        self.scopes
            .entry(panel)
            .or_default()
            .messages
            .insert(message.run_id.clone(), message);
    }

    /// Side slot holding `step_id`'s parts of `kind`.
    pub fn part_slot(&self, panel: Panel, step_id: &str, kind: SegmentKind) -> Option<usize> {
        self.scopes
            .get(&panel)?
            .part_slots
            .get(&(step_id.to_string(), kind))
            .copied()
    }

    pub fn assign_part_slot(&mut self, panel: Panel, step_id: &str, kind: SegmentKind, index: usize) {
        debug!(%panel, step_id, %kind, index, "assigned content part slot");
        self.scopes
            .entry(panel)
            .or_default()
            .part_slots
            .insert((step_id.to_string(), kind), index);
    }

    /// The step and kind whose side slot sits at `index`, if any.
    pub fn part_at(&self, panel: Panel, index: usize) -> Option<(String, SegmentKind)> {
        self.scopes
            .get(&panel)?
            .part_slots
            .iter()
            .find(|(_, slot)| **slot == index)
            .map(|((step_id, kind), _)| (step_id.clone(), *kind))
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.values().all(PanelScope::is_empty)
    }
}
