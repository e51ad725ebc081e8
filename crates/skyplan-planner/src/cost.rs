//! Monthly cost model: a per-kind base rate scaled by sizing options,
//! split across components in fixed shares.

use skyplan_core::{CostEstimate, CostItem, Intent, IntentKind, Result};

pub const CURRENCY: &str = "USD";

/// Monthly USD at default sizing
fn base_rate(kind: IntentKind) -> f64 {
    match kind {
        // 10 GB standard storage
        IntentKind::Bucket => 0.23,
        // one public IPv4 address on the gateway
        IntentKind::Network => 3.65,
        // 1M requests at 128 MB, 100 ms
        IntentKind::Function => 0.41,
        // 10 GB CDN egress plus storage
        IntentKind::StaticSite => 1.08,
        // db.t3.micro with 20 GB gp2
        IntentKind::Database => 14.71,
        // 1M requests plus the backing function
        IntentKind::Api => 1.41,
        // t3.micro with 8 GB EBS
        IntentKind::Webapp => 8.39,
    }
}

fn shares(kind: IntentKind) -> &'static [(&'static str, f64)] {
    match kind {
        IntentKind::Bucket => &[("Storage", 0.85), ("Requests", 0.10), ("Data transfer", 0.05)],
        IntentKind::Network => &[("Public IPv4", 0.80), ("Data transfer", 0.20)],
        IntentKind::Function => &[("Compute", 0.50), ("Requests", 0.50)],
        IntentKind::StaticSite => &[("CDN", 0.75), ("Storage", 0.15), ("Requests", 0.10)],
        IntentKind::Database => &[("Instance", 0.80), ("Storage", 0.15), ("Backups", 0.05)],
        IntentKind::Api => &[("API requests", 0.70), ("Compute", 0.30)],
        IntentKind::Webapp => &[("Compute", 0.80), ("Storage", 0.12), ("Data transfer", 0.08)],
    }
}

/// Relative price of an instance size against the smallest default
fn size_factor(class: &str) -> f64 {
    let size = class.rsplit('.').next().unwrap_or(class);
    match size {
        "nano" => 0.5,
        "micro" => 1.0,
        "small" => 2.0,
        "medium" => 4.0,
        "large" => 8.0,
        "xlarge" => 16.0,
        "2xlarge" => 32.0,
        _ => 1.0,
    }
}

fn scale(intent: &Intent) -> Result<f64> {
    let factor = match intent.kind {
        IntentKind::Bucket => intent.number::<f64>("size_gb", 10.0)? / 10.0,
        IntentKind::Network => {
            if intent.flag("nat", false)? {
                10.0
            } else {
                1.0
            }
        }
        IntentKind::Function => {
            intent.number::<f64>("requests_m", 1.0)?
                * (intent.number::<f64>("memory", 128.0)? / 128.0)
        }
        IntentKind::StaticSite => intent.number::<f64>("transfer_gb", 10.0)? / 10.0,
        IntentKind::Database => {
            let class = intent.param("instance_class").unwrap_or("db.t3.micro");
            let multi_az = if intent.flag("multi_az", false)? { 2.0 } else { 1.0 };
            size_factor(class) * multi_az
        }
        IntentKind::Api => intent.number::<f64>("requests_m", 1.0)?,
        IntentKind::Webapp => {
            let instance_type = intent.param("instance_type").unwrap_or("t3.micro");
            let count = if intent.flag("autoscaling", false)? {
                intent.number::<f64>("min", 1.0)?
            } else {
                1.0
            };
            size_factor(instance_type) * count
        }
    };
    Ok(factor.max(0.0))
}

fn cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn estimate(intent: &Intent) -> Result<CostEstimate> {
    let monthly = base_rate(intent.kind) * scale(intent)?;
    let breakdown = shares(intent.kind)
        .iter()
        .map(|(component, share)| CostItem {
            component: component.to_string(),
            monthly: cents(monthly * share),
        })
        .collect();
    Ok(CostEstimate {
        currency: CURRENCY.to_string(),
        monthly: cents(monthly),
        breakdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shares_sum_to_one() {
        for kind in IntentKind::ALL {
            let total: f64 = shares(kind).iter().map(|(_, s)| s).sum();
            assert!((total - 1.0).abs() < 1e-9, "{kind}");
        }
    }

    #[test]
    fn test_default_bucket_cost() {
        let cost = estimate(&Intent::new(IntentKind::Bucket, "b")).unwrap();
        assert_eq!(cost.currency, "USD");
        assert_eq!(cost.monthly, 0.23);
        assert_eq!(cost.breakdown.len(), 3);
    }

    #[test]
    fn test_sizing_scales_cost() {
        let small = estimate(&Intent::new(IntentKind::Database, "db")).unwrap();
        let large = estimate(
            &Intent::new(IntentKind::Database, "db")
                .with_param("instance_class", "db.m5.large")
                .with_param("multi_az", "true"),
        )
        .unwrap();
        assert_eq!(large.monthly, cents(small.monthly * 16.0));

        let busy = estimate(&Intent::new(IntentKind::Function, "f").with_param("requests_m", "10"))
            .unwrap();
        assert_eq!(busy.monthly, 4.1);
    }

    #[test]
    fn test_bad_sizing_is_invalid_input() {
        let err = estimate(&Intent::new(IntentKind::Bucket, "b").with_param("size_gb", "lots"))
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
