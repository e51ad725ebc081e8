// skyplan-planner - Intent to execution plan
//
// Plans are a pure function of the intent: fixed per-kind step templates,
// the IAM actions they need, a cost estimate and a duration guess.
// The only remote input is the optional existence probe that switches
// to an adoption plan.

pub mod adoption;
pub mod cost;
pub mod format;
pub mod templates;

use skyplan_core::{Intent, Plan, PlanBuilder, ResourceProbe, Result};
use tracing::{debug, info};

pub use format::render;

/// Build the deploy plan for `intent` without touching the cloud
pub fn plan(intent: &Intent) -> Result<Plan> {
    let title = format!("Deploy {} '{}'", intent.kind.display_name(), intent.name);
    let mut builder = PlanBuilder::new(intent.kind, &intent.name, title);
    templates::add_steps(intent, &mut builder)?;

    let cost = cost::estimate(intent)?;
    let plan = {
        let built = builder.build(cost, 0);
        let duration = built
            .steps
            .iter()
            .map(|step| templates::action_seconds(&step.action))
            .sum();
        Plan {
            duration_secs: duration,
            ..built
        }
    };
    debug!(plan = %plan.id, steps = plan.steps.len(), "Built plan");
    Ok(plan)
}

/// Like [`plan`], but adopt the resource when the probe finds it already exists
pub async fn plan_with_probe(intent: &Intent, probe: &dyn ResourceProbe) -> Result<Plan> {
    if probe.exists(intent.kind, &intent.name).await? {
        info!(kind = %intent.kind, name = %intent.name, "Resource exists; planning adoption");
        return adoption::plan(intent);
    }
    plan(intent)
}
