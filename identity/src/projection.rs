//! The `lockout_policies` view.
//!
//! One row per defined policy: the default policy of each instance
//! (`is_default = true`) and the policies organizations define for
//! themselves. The view is assembled from a generic policy table, shared by
//! both scopes, extended with the cases only organizations and instances
//! have.
//!
//! | event                         | statement                                   |
//! |-------------------------------|---------------------------------------------|
//! | `*.policy.lockout.added`      | insert                                      |
//! | `*.policy.lockout.changed`    | update set fields, `change_date`, sequence  |
//! | `org.policy.lockout.removed`  | delete the org's row                        |
//! | `org.removed`                 | delete rows owned by the org                |
//! | `instance.removed`            | delete every row of the instance            |

use crate::events::{IamEvent, INSTANCE, ORG, PolicyScope, types};
use eventide_core::event::RecordedEvent;
use eventide_core::projection::{ProjectionError, ReducerTable, TableProjection};
use eventide_projections::{Column, Condition, Statement};

/// View (and table) name.
pub const LOCKOUT_POLICY_TABLE: &str = "lockout_policies";

/// `state` column value of a usable policy.
pub const POLICY_STATE_ACTIVE: i64 = 1;

/// The lockout policy view.
pub type LockoutPolicyProjection = TableProjection<IamEvent, Statement>;

/// Added and changed reducers for policies of `scope`.
#[must_use]
pub fn policy_reducers(scope: PolicyScope) -> ReducerTable<IamEvent, Statement> {
    ReducerTable::new()
        .on(scope.aggregate_type(), scope.added_type(), move |e| added(scope, e))
        .on(scope.aggregate_type(), scope.changed_type(), changed)
}

/// Build the view.
#[must_use]
pub fn lockout_policy_projection() -> LockoutPolicyProjection {
    let table = policy_reducers(PolicyScope::Instance)
        .extend(policy_reducers(PolicyScope::Org))
        .on(ORG, types::ORG_LOCKOUT_POLICY_REMOVED, |e| {
            Ok(vec![Statement::delete(LOCKOUT_POLICY_TABLE, row_of(e))])
        })
        .on(ORG, types::ORG_REMOVED, |e| {
            Ok(vec![Statement::delete(
                LOCKOUT_POLICY_TABLE,
                vec![
                    Condition::new("instance_id", &e.meta.key.tenant),
                    Condition::new("resource_owner", &e.meta.key.aggregate_id),
                ],
            )])
        })
        .on(INSTANCE, types::INSTANCE_REMOVED, |e| {
            Ok(vec![Statement::delete(
                LOCKOUT_POLICY_TABLE,
                vec![Condition::new("instance_id", &e.meta.key.tenant)],
            )])
        });

    TableProjection::new(LOCKOUT_POLICY_TABLE, table).with_reset(|| vec![Statement::clear(LOCKOUT_POLICY_TABLE)])
}

fn added(scope: PolicyScope, e: &RecordedEvent<IamEvent>) -> Result<Vec<Statement>, ProjectionError> {
    let IamEvent::LockoutPolicyAdded(policy) = &e.data else {
        return Err(unexpected(e));
    };
    let meta = &e.meta;
    Ok(vec![Statement::create(
        LOCKOUT_POLICY_TABLE,
        vec![
            Column::new("instance_id", &meta.key.tenant),
            Column::new("id", &meta.key.aggregate_id),
            Column::new("creation_date", meta.creation_date),
            Column::new("change_date", meta.creation_date),
            Column::new("sequence", meta.sequence.value()),
            Column::new("state", POLICY_STATE_ACTIVE),
            Column::new("is_default", scope.is_default()),
            Column::new("resource_owner", &meta.resource_owner),
            Column::new("max_password_attempts", policy.max_password_attempts),
            Column::new("show_failure", policy.show_lockout_failures),
        ],
    )])
}

fn changed(e: &RecordedEvent<IamEvent>) -> Result<Vec<Statement>, ProjectionError> {
    let IamEvent::LockoutPolicyChanged(change) = &e.data else {
        return Err(unexpected(e));
    };
    let mut columns = vec![
        Column::new("change_date", e.meta.creation_date),
        Column::new("sequence", e.meta.sequence.value()),
    ];
    if let Some(max) = change.max_password_attempts {
        columns.push(Column::new("max_password_attempts", max));
    }
    if let Some(show) = change.show_lockout_failures {
        columns.push(Column::new("show_failure", show));
    }
    Ok(vec![Statement::update(LOCKOUT_POLICY_TABLE, columns, row_of(e))])
}

fn row_of(e: &RecordedEvent<IamEvent>) -> Vec<Condition> {
    vec![
        Condition::new("instance_id", &e.meta.key.tenant),
        Condition::new("id", &e.meta.key.aggregate_id),
    ]
}

fn unexpected(e: &RecordedEvent<IamEvent>) -> ProjectionError {
    ProjectionError::EventProcessing(format!(
        "{} at {}#{} decoded to an unexpected payload",
        e.meta.event_type,
        e.meta.key,
        e.meta.sequence
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::{LockoutPolicyAdded, LockoutPolicyChanged, OrgRemoved};
    use eventide_core::environment::Clock;
    use eventide_core::projection::Projection;
    use eventide_core::stream::{AggregateKey, AggregateType};
    use eventide_projections::SqlValue;
    use eventide_testing::helpers::recorded;
    use eventide_testing::test_clock;

    fn org_key() -> AggregateKey {
        AggregateKey::new("inst", ORG, "org-1")
    }

    fn columns(statement: &Statement) -> &[Column] {
        match statement {
            Statement::Create { columns, .. } | Statement::Update { columns, .. } => columns,
            _ => &[],
        }
    }

    fn value<'a>(statement: &'a Statement, name: &str) -> Option<&'a SqlValue> {
        columns(statement).iter().find(|c| c.name == name).map(|c| &c.value)
    }

    #[test]
    fn added_marks_instance_policies_as_default() {
        let projection = lockout_policy_projection();
        let data = IamEvent::LockoutPolicyAdded(LockoutPolicyAdded {
            max_password_attempts: 5,
            show_lockout_failures: true,
        });

        let instance = AggregateKey::new("inst", INSTANCE, "inst");
        let event = recorded(&instance, types::INSTANCE_LOCKOUT_POLICY_ADDED, 2, 10, test_clock().now(), data.clone());
        let stmts = projection.reduce(&event).unwrap();
        assert_eq!(value(&stmts[0], "is_default"), Some(&SqlValue::Bool(true)));
        assert_eq!(value(&stmts[0], "max_password_attempts"), Some(&SqlValue::Int(5)));
        assert_eq!(value(&stmts[0], "sequence"), Some(&SqlValue::Int(2)));

        let event = recorded(&org_key(), types::ORG_LOCKOUT_POLICY_ADDED, 1, 11, test_clock().now(), data);
        let stmts = projection.reduce(&event).unwrap();
        assert_eq!(value(&stmts[0], "is_default"), Some(&SqlValue::Bool(false)));
        assert_eq!(value(&stmts[0], "resource_owner"), Some(&SqlValue::Text("org-1".into())));
    }

    #[test]
    fn changed_only_sets_given_fields() {
        let event = recorded(
            &org_key(),
            types::ORG_LOCKOUT_POLICY_CHANGED,
            3,
            12,
            test_clock().now(),
            IamEvent::LockoutPolicyChanged(LockoutPolicyChanged {
                max_password_attempts: None,
                show_lockout_failures: Some(false),
            }),
        );

        let stmts = lockout_policy_projection().reduce(&event).unwrap();

        let names: Vec<&str> = columns(&stmts[0]).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["change_date", "sequence", "show_failure"]);
        assert_eq!(
            stmts[0].to_sql().unwrap().as_deref(),
            Some("UPDATE lockout_policies SET change_date = $1, sequence = $2, show_failure = $3 WHERE instance_id = $4 AND id = $5")
        );
    }

    #[test]
    fn org_removal_deletes_by_owner_and_instance_removal_by_instance() {
        let projection = lockout_policy_projection();
        let org_removed = recorded(
            &org_key(),
            types::ORG_REMOVED,
            4,
            13,
            test_clock().now(),
            IamEvent::OrgRemoved(OrgRemoved { name: "acme".into() }),
        );
        assert_eq!(
            projection.reduce(&org_removed).unwrap(),
            vec![Statement::delete(
                LOCKOUT_POLICY_TABLE,
                vec![Condition::new("instance_id", "inst"), Condition::new("resource_owner", "org-1")]
            )]
        );

        let instance_removed = recorded(
            &AggregateKey::new("inst", INSTANCE, "inst"),
            types::INSTANCE_REMOVED,
            9,
            14,
            test_clock().now(),
            IamEvent::InstanceRemoved(crate::events::InstanceRemoved { name: "prod".into() }),
        );
        assert_eq!(
            projection.reduce(&instance_removed).unwrap(),
            vec![Statement::delete(LOCKOUT_POLICY_TABLE, vec![Condition::new("instance_id", "inst")])]
        );
    }

    #[test]
    fn query_covers_both_scopes_and_the_cascades() {
        let projection = lockout_policy_projection();
        let table = projection.table();

        for (aggregate, event) in [
            (INSTANCE, types::INSTANCE_LOCKOUT_POLICY_ADDED),
            (INSTANCE, types::INSTANCE_LOCKOUT_POLICY_CHANGED),
            (INSTANCE, types::INSTANCE_REMOVED),
            (ORG, types::ORG_LOCKOUT_POLICY_ADDED),
            (ORG, types::ORG_LOCKOUT_POLICY_CHANGED),
            (ORG, types::ORG_LOCKOUT_POLICY_REMOVED),
            (ORG, types::ORG_REMOVED),
        ] {
            assert!(table.handles(&AggregateType::new(aggregate), &event.into()), "{event}");
        }
        assert_eq!(table.len(), 7);
        assert_eq!(projection.query().queries.len(), 2);
        assert_eq!(projection.reset(), vec![Statement::clear(LOCKOUT_POLICY_TABLE)]);
    }

    #[test]
    fn mismatched_payload_is_a_processing_error() {
        let event = recorded(
            &org_key(),
            types::ORG_LOCKOUT_POLICY_ADDED,
            1,
            1,
            test_clock().now(),
            IamEvent::OrgRemoved(OrgRemoved { name: "acme".into() }),
        );
        assert!(matches!(
            lockout_policy_projection().reduce(&event),
            Err(ProjectionError::EventProcessing(_))
        ));
    }
}
