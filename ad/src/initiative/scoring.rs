//! Focus-weighted initiative scoring

use crate::domain::Initiative;
use crate::profile::FocusArea;

/// Score an initiative against the agent's focus area.
///
/// Revenue impact is weighted by `revenue_focus`; marketing- and dev-tagged
/// work earns a role-match term against `marketing_vs_dev`; community-tagged
/// work a bonus scaled by `community_growth`. Risk-tagged work is dampened by
/// `risk_tolerance`, short-term work boosted under a low `time_horizon`, and
/// effort always subtracts at half weight.
pub fn score(initiative: &Initiative, focus: &FocusArea) -> f64 {
    let mut score = initiative.revenue_impact as f64 * focus.revenue_focus;

    if initiative.has_tag("marketing") {
        score += 2.0 * focus.marketing_vs_dev;
    }
    if initiative.has_tag("dev") {
        score += 2.0 * (1.0 - focus.marketing_vs_dev);
    }
    if initiative.has_tag("community") {
        score += 1.5 * focus.community_growth;
    }
    if initiative.has_tag("risk") {
        score *= focus.risk_tolerance;
    }
    if initiative.has_tag("short-term") && focus.time_horizon < 0.5 {
        score *= 1.0 + (0.5 - focus.time_horizon);
    }

    score - 0.5 * initiative.effort as f64
}
