use chrono::{DateTime, Utc};
use common_security::ActorContext;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgConnection;
use uuid::Uuid;

/// Seconds a caller racing an in-flight twin is told to wait.
pub const RETRY_AFTER_SECS: u64 = 2;

pub const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
pub const STATUS_DONE: &str = "DONE";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub actor_type: String,
    pub actor_id: Uuid,
    pub method_path: String,
    pub key_uuid: Uuid,
    pub status: String,
    pub body_hash: String,
    pub response_status: Option<i32>,
    pub response_snapshot: Option<Value>,
    pub resource_public_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Canonical form: object keys sorted recursively, null members omitted,
/// compact separators. Two semantically identical bodies hash identically no
/// matter how the client serialized them.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                let child = &map[key];
                if child.is_null() {
                    continue;
                }
                out.insert(key.clone(), canonicalize(child));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_body_hash(body: &Value) -> String {
    let canonical = canonicalize(body);
    // serde_json::to_string is already whitespace-free
    let bytes = serde_json::to_string(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(bytes.as_bytes()))
}

pub fn is_body_conflict(record: &IdempotencyRecord, body_hash: &str) -> bool {
    record.body_hash != body_hash
}

const RECORD_COLUMNS: &str = "id, actor_type, actor_id, method_path, key_uuid, status, body_hash,
response_status, response_snapshot, resource_public_id, created_at";

/// Insert-or-load for the scope (actor_type, actor_id, method_path, key).
/// The ON CONFLICT DO NOTHING + RETURNING probe distinguishes first writer
/// from replay atomically; losing the race never double-executes.
pub async fn begin_or_load(
    conn: &mut PgConnection,
    actor: &ActorContext,
    method_path: &str,
    key_uuid: Uuid,
    body_hash: &str,
) -> Result<(IdempotencyRecord, bool), sqlx::Error> {
    let inserted = sqlx::query_as::<_, IdempotencyRecord>(&format!(
        "INSERT INTO idempotency_keys
           (id, actor_type, actor_id, method_path, key_uuid, status, body_hash, created_at)
         VALUES ($1, $2, $3, $4, $5, 'IN_PROGRESS', $6, NOW())
         ON CONFLICT (actor_type, actor_id, method_path, key_uuid) DO NOTHING
         RETURNING {RECORD_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(actor.actor_type.as_str())
    .bind(actor.actor_id)
    .bind(method_path)
    .bind(key_uuid)
    .bind(body_hash)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(record) = inserted {
        return Ok((record, true));
    }

    let existing = sqlx::query_as::<_, IdempotencyRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM idempotency_keys
         WHERE actor_type = $1 AND actor_id = $2 AND method_path = $3 AND key_uuid = $4"
    ))
    .bind(actor.actor_type.as_str())
    .bind(actor.actor_id)
    .bind(method_path)
    .bind(key_uuid)
    .fetch_one(&mut *conn)
    .await?;
    Ok((existing, false))
}

/// Flip to DONE with the canonical response snapshot so an identical retry
/// replays the original bytes instead of re-running business logic.
pub async fn complete(
    conn: &mut PgConnection,
    record_id: Uuid,
    http_status: i32,
    response_body: &Value,
    resource_public_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE idempotency_keys
         SET status = 'DONE', response_status = $2, response_snapshot = $3, resource_public_id = $4
         WHERE id = $1",
    )
    .bind(record_id)
    .bind(http_status)
    .bind(response_body)
    .bind(resource_public_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Degraded completion: the snapshot could not be serialized but the work
/// committed. Replay falls back to re-fetching the resource by public id.
pub async fn complete_without_snapshot(
    conn: &mut PgConnection,
    record_id: Uuid,
    http_status: i32,
    resource_public_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE idempotency_keys
         SET status = 'DONE', response_status = $2, resource_public_id = $3
         WHERE id = $1",
    )
    .bind(record_id)
    .bind(http_status)
    .bind(resource_public_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Drop an IN_PROGRESS record whose request died before completing, so the
/// client can retry the same key. Only ever called on the record this
/// request inserted itself.
pub async fn release(conn: &mut PgConnection, record_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM idempotency_keys WHERE id = $1 AND status = 'IN_PROGRESS'")
        .bind(record_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// What the handler should do after consulting the coordinator.
#[derive(Debug)]
pub enum Gate {
    /// First execution; run the business logic, then `complete`.
    Fresh(IdempotencyRecord),
    /// Same key, same body, already DONE with a stored snapshot.
    Replay { status: i32, body: Value },
    /// DONE but the snapshot is missing; re-fetch by resource public id.
    ReplayByResource { status: i32, resource_public_id: Option<Uuid> },
    /// Another request holds the key right now.
    InFlight,
    /// Same key, different body hash: client misuse.
    BodyConflict,
}

pub async fn gate(
    conn: &mut PgConnection,
    actor: &ActorContext,
    method_path: &str,
    key_uuid: Uuid,
    body_hash: &str,
) -> Result<Gate, sqlx::Error> {
    let (record, created) = begin_or_load(conn, actor, method_path, key_uuid, body_hash).await?;
    if created {
        return Ok(Gate::Fresh(record));
    }
    if is_body_conflict(&record, body_hash) {
        return Ok(Gate::BodyConflict);
    }
    if record.status == STATUS_IN_PROGRESS {
        return Ok(Gate::InFlight);
    }
    let status = record.response_status.unwrap_or(200);
    match record.response_snapshot {
        Some(body) => Ok(Gate::Replay { status, body }),
        None => Ok(Gate::ReplayByResource {
            status,
            resource_public_id: record.resource_public_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_hash_ignores_key_order_and_nulls() {
        let a = json!({"b": 1, "a": {"y": null, "x": [1, 2]}, "c": null});
        let b = json!({"a": {"x": [1, 2]}, "b": 1});
        assert_eq!(canonical_body_hash(&a), canonical_body_hash(&b));
    }

    #[test]
    fn test_canonical_hash_distinguishes_values() {
        let a = json!({"amount": 1000});
        let b = json!({"amount": 1001});
        assert_ne!(canonical_body_hash(&a), canonical_body_hash(&b));
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = json!({"items": [1, 2]});
        let b = json!({"items": [2, 1]});
        assert_ne!(canonical_body_hash(&a), canonical_body_hash(&b));
    }

    #[test]
    fn test_whitespace_quirks_do_not_matter() {
        let a: Value = serde_json::from_str("{\n  \"amount\": 5,\r\n  \"store\": \"s\" }").unwrap();
        let b: Value = serde_json::from_str("{\"store\":\"s\",\"amount\":5}").unwrap();
        assert_eq!(canonical_body_hash(&a), canonical_body_hash(&b));
    }

    #[test]
    fn test_body_conflict_detection() {
        let record = IdempotencyRecord {
            id: Uuid::new_v4(),
            actor_type: "MERCHANT".into(),
            actor_id: Uuid::new_v4(),
            method_path: "POST /x".into(),
            key_uuid: Uuid::new_v4(),
            status: STATUS_DONE.into(),
            body_hash: canonical_body_hash(&json!({"a": 1})),
            response_status: Some(201),
            response_snapshot: None,
            resource_public_id: None,
            created_at: Utc::now(),
        };
        assert!(!is_body_conflict(&record, &canonical_body_hash(&json!({"a": 1}))));
        assert!(is_body_conflict(&record, &canonical_body_hash(&json!({"a": 2}))));
    }
}
