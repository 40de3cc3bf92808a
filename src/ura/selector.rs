use crate::crm::CallActivity;
use chrono::{DateTime, FixedOffset};
use std::cmp::Reverse;

/// Picks the activity whose subject carries `suffix` and whose creation is
/// closest to `reference`. Ties go to the highest activity id; undated
/// activities rank after every dated one.
pub fn select_closest<'a>(
    candidates: &'a [CallActivity],
    suffix: &str,
    reference: DateTime<FixedOffset>,
) -> Option<&'a CallActivity> {
    candidates
        .iter()
        .filter(|activity| activity.subject_digits().contains(suffix))
        .min_by_key(|activity| {
            let distance = activity
                .created_at()
                .map(|created| (created - reference).num_milliseconds().abs());
            (
                distance.is_none(),
                distance.unwrap_or(i64::MAX),
                Reverse(activity.id.parse::<u64>().unwrap_or(0)),
            )
        })
}
