use super::engine::{ItemKey, PutCondition, StatusGuard, StatusUpdate, WriteOp};
use super::item::{SUBSCRIPTION_TYPE, StoredItem, build_hash_key};
use crate::core::{DocumentStatus, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Tenant and clock shared by every write parameter of one operation.
///
/// All rows and guards built from the same context see the same `now`, so
/// lock expiries and `meta.lastUpdated` agree across a transaction phase.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub tenant_id: Option<String>,
    pub now: DateTime<Utc>,
    pub lock_duration_ms: i64,
}

impl WriteContext {
    pub fn new(tenant_id: Option<&str>, lock_duration_ms: i64) -> Self {
        Self {
            tenant_id: tenant_id.map(str::to_string),
            now: Utc::now(),
            lock_duration_ms,
        }
    }

    /// Same tenant, fresh clock
    pub fn refreshed(&self) -> Self {
        Self {
            now: Utc::now(),
            ..self.clone()
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.now.timestamp_millis()
    }

    /// RFC 3339, millisecond precision, UTC
    pub fn timestamp(&self) -> String {
        self.now.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Transitional statuses are reserved for one lock TTL; settled ones are
    /// stamped with the current time.
    pub fn lock_end_for(&self, status: DocumentStatus) -> i64 {
        if status.is_transitional() {
            self.now_ms().saturating_add(self.lock_duration_ms)
        } else {
            self.now_ms()
        }
    }

    pub fn hash_key(&self, id: &str) -> Result<String> {
        build_hash_key(id, self.tenant_id.as_deref())
    }

    pub fn item_key(&self, id: &str, vid: u64) -> Result<ItemKey> {
        Ok(ItemKey::new(self.hash_key(id)?, vid))
    }
}

/// Status transition of `resource_type/id` version `vid`.
pub fn status_update(
    resource_type: &str,
    id: &str,
    vid: u64,
    new_status: DocumentStatus,
    guard: StatusGuard,
    ctx: &WriteContext,
) -> Result<StatusUpdate> {
    Ok(StatusUpdate {
        key: ctx.item_key(id, vid)?,
        resource_type: resource_type.to_string(),
        new_status,
        lock_end_ts: ctx.lock_end_for(new_status),
        guard,
        clear_subscription: resource_type == SUBSCRIPTION_TYPE
            && matches!(
                new_status,
                DocumentStatus::PendingDelete | DocumentStatus::Deleted
            ),
    })
}

/// Move `from` to `to`, also taking the row over if another writer's lock
/// on it has expired.
pub fn transition(
    resource_type: &str,
    id: &str,
    vid: u64,
    from: DocumentStatus,
    to: DocumentStatus,
    ctx: &WriteContext,
) -> Result<StatusUpdate> {
    let guard = StatusGuard::ExpectedOrExpired {
        expected: from,
        now_ms: ctx.now_ms(),
    };
    status_update(resource_type, id, vid, to, guard, ctx)
}

/// AVAILABLE -> LOCKED for the version a transaction is about to touch.
pub fn lock_update(resource_type: &str, id: &str, vid: u64, ctx: &WriteContext) -> Result<WriteOp> {
    transition(
        resource_type,
        id,
        vid,
        DocumentStatus::Available,
        DocumentStatus::Locked,
        ctx,
    )
    .map(WriteOp::UpdateStatus)
}

pub fn put_new_item(item: StoredItem) -> WriteOp {
    WriteOp::Put {
        item,
        condition: PutCondition::IfAbsent,
    }
}

pub fn delete_item(key: ItemKey) -> WriteOp {
    WriteOp::Delete { key }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> WriteContext {
        WriteContext {
            tenant_id: Some("acme".into()),
            now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            lock_duration_ms: 35_000,
        }
    }

    #[test]
    fn test_lock_update_reserves_for_ttl() {
        let context = ctx();
        let WriteOp::UpdateStatus(update) = lock_update("Patient", "p1", 4, &context).unwrap()
        else {
            panic!("lock must be a status update");
        };
        assert_eq!(update.key, ItemKey::new("acme|p1", 4));
        assert_eq!(update.new_status, DocumentStatus::Locked);
        assert_eq!(update.lock_end_ts, context.now_ms() + 35_000);
        assert_eq!(
            update.guard,
            StatusGuard::ExpectedOrExpired {
                expected: DocumentStatus::Available,
                now_ms: context.now_ms()
            }
        );
        assert!(!update.clear_subscription);
    }

    #[test]
    fn test_subscription_marker_cleared_on_delete() {
        let context = ctx();
        let deleting = transition(
            "Subscription",
            "s1",
            1,
            DocumentStatus::Locked,
            DocumentStatus::PendingDelete,
            &context,
        )
        .unwrap();
        assert!(deleting.clear_subscription);

        let committing = status_update(
            "Subscription",
            "s1",
            2,
            DocumentStatus::Available,
            StatusGuard::AnyOf(vec![DocumentStatus::Pending]),
            &context,
        )
        .unwrap();
        assert!(!committing.clear_subscription);
        assert_eq!(committing.lock_end_ts, context.now_ms());
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(ctx().timestamp(), "2024-01-01T00:00:00.000Z");
    }
}
