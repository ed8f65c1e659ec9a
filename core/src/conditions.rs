use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Upserts `new` into `conditions` by matching on `.type_`. The
/// `last_transition_time` is only bumped when the status actually changes
/// (matching `meta.SetStatusCondition` semantics) — repeated reconciles of an
/// unchanged condition don't churn the timestamp.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) {
        if existing.status != new.status {
            existing.last_transition_time = new.last_transition_time;
        } else {
            new.last_transition_time = existing.last_transition_time.clone();
        }
        existing.status = new.status;
        existing.reason = new.reason;
        existing.message = new.message;
        existing.observed_generation = new.observed_generation;
    } else {
        conditions.push(new);
    }
}

pub fn clear_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

pub fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    now: Time,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now,
        observed_generation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: i64) -> Time {
        Time(k8s_openapi::chrono::DateTime::from_timestamp(n, 0).unwrap())
    }

    #[test]
    fn set_condition_inserts_when_absent() {
        let mut conds = vec![];
        set_condition(&mut conds, condition("Ready", true, "AllGood", "ready", t(1)));
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].status, "True");
    }

    #[test]
    fn set_condition_updates_existing_by_type() {
        let mut conds = vec![condition("Ready", false, "NotYet", "waiting", t(1))];
        set_condition(&mut conds, condition("Ready", true, "AllGood", "ready", t(2)));
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].status, "True");
        assert_eq!(conds[0].reason, "AllGood");
    }

    #[test]
    fn set_condition_bumps_transition_time_only_on_status_change() {
        let mut conds = vec![condition("Ready", true, "AllGood", "ready", t(1))];
        set_condition(&mut conds, condition("Ready", true, "StillGood", "ready", t(99)));
        assert_eq!(conds[0].last_transition_time, t(1));

        set_condition(&mut conds, condition("Ready", false, "Degraded", "oops", t(5)));
        assert_eq!(conds[0].last_transition_time, t(5));
    }

    #[test]
    fn clear_condition_removes_by_type_and_leaves_others() {
        let mut conds = vec![
            condition("Ready", true, "AllGood", "ready", t(1)),
            condition("Running", true, "Started", "running", t(1)),
        ];
        clear_condition(&mut conds, "Ready");
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].type_, "Running");
    }
}
