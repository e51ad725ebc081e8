//! Execution plans: an ordered step graph with an IAM forecast and a cost estimate

use crate::error::{Result, SkyError};
use crate::intent::IntentKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One unit of work in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    /// Primary API call, e.g. `s3:CreateBucket`
    pub action: String,
    pub resource: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub iam_actions: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            resource: resource.into(),
            description: description.into(),
            reason: None,
            iam_actions: Vec::new(),
            depends_on: Vec::new(),
            optional: false,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn iam(mut self, actions: &[&str]) -> Self {
        self.iam_actions
            .extend(actions.iter().map(|action| action.to_string()));
        self
    }

    pub fn after(mut self, ids: &[&str]) -> Self {
        self.depends_on.extend(ids.iter().map(|id| id.to_string()));
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// IAM actions the executing principal needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostItem {
    pub component: String,
    pub monthly: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub currency: String,
    pub monthly: f64,
    pub breakdown: Vec<CostItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub kind: IntentKind,
    /// Target resource name
    pub name: String,
    pub steps: Vec<Step>,
    pub permissions: Permissions,
    pub cost: CostEstimate,
    /// Estimated wall-clock time in seconds
    pub duration_secs: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub adoption: bool,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Rough human form of `duration_secs`
    pub fn duration_display(&self) -> String {
        match self.duration_secs {
            0..=59 => format!("~{}s", self.duration_secs),
            secs => format!("~{} min", secs.div_ceil(60)),
        }
    }

    /// Check the graph invariants: unique ids, dependencies only on earlier steps.
    ///
    /// Plans loaded from JSON go through this before execution.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(SkyError::invalid_input(format!(
                        "step '{}' depends on '{}' which is not an earlier step",
                        step.id, dep
                    )));
                }
            }
            if !seen.insert(step.id.as_str()) {
                return Err(SkyError::invalid_input(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }
        Ok(())
    }
}

/// Append-only plan construction; a step may only depend on steps already added,
/// which keeps the graph acyclic and the step list in topological order.
#[derive(Debug)]
pub struct PlanBuilder {
    kind: IntentKind,
    name: String,
    title: String,
    steps: Vec<Step>,
    adoption: bool,
}

impl PlanBuilder {
    pub fn new(kind: IntentKind, name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            title: title.into(),
            steps: Vec::new(),
            adoption: false,
        }
    }

    pub fn adoption(mut self) -> Self {
        self.adoption = true;
        self
    }

    pub fn push(&mut self, step: Step) -> Result<&mut Self> {
        if self.steps.iter().any(|existing| existing.id == step.id) {
            return Err(SkyError::invalid_input(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        for dep in &step.depends_on {
            if !self.steps.iter().any(|existing| &existing.id == dep) {
                return Err(SkyError::invalid_input(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
        self.steps.push(step);
        Ok(self)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.iter().any(|step| step.id == id)
    }

    /// Finish the plan, aggregating IAM actions in first-seen order.
    pub fn build(self, cost: CostEstimate, duration_secs: u64) -> Plan {
        let mut seen = HashSet::new();
        let mut actions = Vec::new();
        for step in &self.steps {
            for action in &step.iam_actions {
                if seen.insert(action.clone()) {
                    actions.push(action.clone());
                }
            }
        }

        Plan {
            id: uuid::Uuid::new_v4().to_string(),
            title: self.title,
            kind: self.kind,
            name: self.name,
            steps: self.steps,
            permissions: Permissions { actions },
            cost,
            duration_secs,
            created_at: Utc::now(),
            adoption: self.adoption,
        }
    }
}
