pub mod credits;
pub mod jobs;
pub mod reservations;

pub use credits::Credits;
pub use jobs::Jobs;
pub use reservations::Reservations;

use crate::{db::errors::Result, types::UserId};
use sqlx::PgConnection;
use tracing::trace;

/// Advisory lock key for a user's ledger: the first 8 bytes of the UUID.
pub(crate) fn user_lock_key(user_id: UserId) -> i64 {
    let bytes = user_id.as_bytes();
    i64::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]])
}

/// Serialize ledger checks for one user. Must be called inside a transaction:
/// `pg_advisory_xact_lock` is released on commit or rollback and blocks until
/// any concurrent holder finishes.
pub(crate) async fn lock_user_ledger(conn: &mut PgConnection, user_id: UserId) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1 FROM (SELECT pg_advisory_xact_lock($1)) AS _")
        .bind(user_lock_key(user_id))
        .fetch_one(&mut *conn)
        .await?;
    trace!("Acquired ledger lock for user_id {}", user_id);
    Ok(())
}

/// Credits the user can still commit: ledger balance minus live pending holds.
pub(crate) async fn available_credits(conn: &mut PgConnection, user_id: UserId) -> Result<i64> {
    let available = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT
            COALESCE((SELECT SUM(amount) FROM credit_transactions WHERE user_id = $1), 0)::BIGINT
          - COALESCE((
                SELECT SUM(amount) FROM credit_reservations
                WHERE user_id = $1
                  AND status = 'pending'
                  AND (expires_at IS NULL OR expires_at > NOW())
            ), 0)::BIGINT
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(available)
}
