//! Reads on the `lockout_policies` view.

use crate::projection::LOCKOUT_POLICY_TABLE;
use chrono::{DateTime, Utc};
use eventide_core::projection::ProjectionError;
use sqlx::PgPool;

/// One row of the lockout policy view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutPolicyView {
    /// Organization ID, or the instance ID for the default policy.
    pub id: String,
    /// Owning instance.
    pub instance_id: String,
    /// Resource owner of the policy events.
    pub resource_owner: String,
    /// When the policy was added.
    pub creation_date: DateTime<Utc>,
    /// When the policy last changed.
    pub change_date: DateTime<Utc>,
    /// Sequence of the last event applied to the row.
    pub sequence: i64,
    /// Whether this is the instance default.
    pub is_default: bool,
    /// Failed password checks before lockout.
    pub max_password_attempts: i64,
    /// Whether users see how many attempts are left.
    pub show_failure: bool,
}

type Row = (String, String, String, DateTime<Utc>, DateTime<Utc>, i64, bool, i64, bool);

impl From<Row> for LockoutPolicyView {
    fn from(row: Row) -> Self {
        let (id, instance_id, resource_owner, creation_date, change_date, sequence, is_default, max_password_attempts, show_failure) =
            row;
        Self {
            id,
            instance_id,
            resource_owner,
            creation_date,
            change_date,
            sequence,
            is_default,
            max_password_attempts,
            show_failure,
        }
    }
}

/// The policy in effect for `org_id`: its own policy if it has one,
/// otherwise the instance default.
///
/// # Errors
///
/// Returns [`ProjectionError::Storage`] if the query fails.
pub async fn effective_lockout_policy(
    pool: &PgPool,
    instance_id: &str,
    org_id: &str,
) -> Result<Option<LockoutPolicyView>, ProjectionError> {
    let sql = format!(
        "SELECT id, instance_id, resource_owner, creation_date, change_date, sequence, is_default, \
         max_password_attempts, show_failure \
         FROM {LOCKOUT_POLICY_TABLE} \
         WHERE instance_id = $1 AND ((id = $2 AND NOT is_default) OR is_default) \
         ORDER BY is_default ASC LIMIT 1"
    );
    let row: Option<Row> = sqlx::query_as(&sql)
        .bind(instance_id)
        .bind(org_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to load lockout policy: {e}")))?;
    Ok(row.map(LockoutPolicyView::from))
}
