//! Terminal rendering of a plan

use skyplan_core::Plan;
use std::fmt::Write;

pub fn render(plan: &Plan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", plan.title);
    let _ = writeln!(out, "{}", "=".repeat(plan.title.len()));
    let _ = writeln!(out);

    for (i, step) in plan.steps.iter().enumerate() {
        let marker = if step.optional { " (optional)" } else { "" };
        let _ = writeln!(out, "{:>2}. {}{}", i + 1, step.description, marker);
        let _ = writeln!(out, "    {} -> {}", step.action, step.resource);
        if let Some(reason) = &step.reason {
            let _ = writeln!(out, "    why: {}", reason);
        }
        if !step.depends_on.is_empty() {
            let _ = writeln!(out, "    after: {}", step.depends_on.join(", "));
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Permissions required:");
    for action in &plan.permissions.actions {
        let _ = writeln!(out, "  - {}", action);
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Estimated cost: {:.2} {}/month",
        plan.cost.monthly, plan.cost.currency
    );
    for item in &plan.cost.breakdown {
        let _ = writeln!(out, "  {:<16} {:>8.2}", item.component, item.monthly);
    }
    let _ = writeln!(out, "Estimated time: {}", plan.duration_display());
    out
}
