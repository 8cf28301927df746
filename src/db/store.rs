//! Postgres-backed [`SprintStore`].
//!
//! The progress table name is configurable so multiple deployments can share
//! a database. The event and discovery tables are shared and scoped by
//! stage, so one sprint never reads or repairs another's rows.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use tokio_postgres::Row;

use crate::events::DomainEvent;
use crate::sprint::store::{
    DiscoveredAddress, ExecutionStatus, LeaseRecovery, RangeRecord, SprintStore, StoreError,
};

use super::pool::DbPool;
use super::types::{DbOperation, DbValue, WhereClause};

pub const EVENTS_TABLE: &str = "sprint_events";
pub const DISCOVERED_TABLE: &str = "sprint_discovered_addresses";

const RECORD_COLUMNS: &str =
    "id, stage, start_block, end_block, status, error, message, validator_passes";

pub struct PgStore {
    pool: Arc<DbPool>,
    table: String,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>, progress_table: &str) -> Self {
        Self {
            pool,
            table: progress_table.to_string(),
        }
    }

    fn record_from_row(&self, row: &Row) -> Result<RangeRecord, StoreError> {
        let status: i16 = row.get("status");
        let start_block: i64 = row.get("start_block");
        let end_block: i64 = row.get("end_block");
        Ok(RangeRecord {
            id: row.get("id"),
            stage: row.get("stage"),
            start_block: start_block as u64,
            end_block: end_block as u64,
            start_ts: None,
            end_ts: None,
            status: ExecutionStatus::from_i16(status)?,
            error: row.get("error"),
            message: row.get("message"),
            validator_passes: row.get("validator_passes"),
        })
    }

    /// Timestamps are only written when present, so validation updates (which
    /// re-read the record without its timestamps) leave the originals intact.
    fn progress_update(&self, record: &RangeRecord) -> DbOperation {
        let mut set_columns = vec![
            ("status".to_string(), DbValue::Int16(record.status.as_i16())),
            (
                "error".to_string(),
                record
                    .error
                    .clone()
                    .map(DbValue::Text)
                    .unwrap_or(DbValue::Null),
            ),
            (
                "message".to_string(),
                record
                    .message
                    .clone()
                    .map(DbValue::Text)
                    .unwrap_or(DbValue::Null),
            ),
            (
                "validator_passes".to_string(),
                DbValue::Int64(record.validator_passes),
            ),
        ];
        if let Some(start_ts) = record.start_ts {
            set_columns.push(("start_ts".to_string(), DbValue::Timestamp(start_ts)));
        }
        if let Some(end_ts) = record.end_ts {
            set_columns.push(("end_ts".to_string(), DbValue::Timestamp(end_ts)));
        }
        DbOperation::Update {
            table: self.table.clone(),
            set_columns,
            where_clause: WhereClause::Eq("id".to_string(), DbValue::Text(record.id.clone())),
        }
    }

    fn event_inserts(stage: &str, events: &[DomainEvent], ops: &mut Vec<DbOperation>) {
        for event in events {
            ops.push(DbOperation::Insert {
                table: EVENTS_TABLE.to_string(),
                columns: vec![
                    "stage".to_string(),
                    "block_number".to_string(),
                    "log_index".to_string(),
                    "name".to_string(),
                    "address".to_string(),
                    "tx_hash".to_string(),
                    "block_timestamp".to_string(),
                    "payload".to_string(),
                ],
                values: vec![
                    DbValue::Text(stage.to_string()),
                    DbValue::Uint64(event.block_number),
                    DbValue::Uint64(event.log_index),
                    DbValue::Text(event.name.clone()),
                    DbValue::Address(event.address),
                    DbValue::Hash(event.tx_hash),
                    DbValue::Uint64(event.timestamp),
                    DbValue::Json(event.payload.clone()),
                ],
                on_conflict_ignore: true,
            });
        }
    }

    fn discovery_inserts(stage: &str, discovered: &[DiscoveredAddress], ops: &mut Vec<DbOperation>) {
        for d in discovered {
            ops.push(DbOperation::Insert {
                table: DISCOVERED_TABLE.to_string(),
                columns: vec![
                    "stage".to_string(),
                    "address".to_string(),
                    "block_number".to_string(),
                ],
                values: vec![
                    DbValue::Text(stage.to_string()),
                    DbValue::Address(d.address),
                    DbValue::Uint64(d.block_number),
                ],
                on_conflict_ignore: true,
            });
        }
    }

    async fn max_end_block(&self, stage: &str, extra: &str) -> Result<Option<u64>, StoreError> {
        let sql = format!(
            "SELECT MAX(end_block) FROM {} WHERE stage = $1{}",
            self.table, extra
        );
        let rows = self.pool.query(&sql, &[&stage]).await?;
        let max: Option<i64> = rows
            .first()
            .map(|row| row.get(0))
            .unwrap_or(None);
        Ok(max.map(|v| v as u64))
    }
}

#[async_trait]
impl SprintStore for PgStore {
    async fn insert_ranges(&self, records: &[RangeRecord]) -> Result<(), StoreError> {
        let mut ops = Vec::with_capacity(records.len());
        for record in records {
            ops.push(DbOperation::Insert {
                table: self.table.clone(),
                columns: vec![
                    "id".to_string(),
                    "stage".to_string(),
                    "start_block".to_string(),
                    "end_block".to_string(),
                    "status".to_string(),
                    "validator_passes".to_string(),
                ],
                values: vec![
                    DbValue::Text(record.id.clone()),
                    DbValue::Text(record.stage.clone()),
                    DbValue::Uint64(record.start_block),
                    DbValue::Uint64(record.end_block),
                    DbValue::Int16(record.status.as_i16()),
                    DbValue::Int64(record.validator_passes),
                ],
                on_conflict_ignore: true,
            });
        }
        self.pool.execute_transaction(ops).await?;
        Ok(())
    }

    async fn max_scheduled_block(&self, stage: &str) -> Result<Option<u64>, StoreError> {
        self.max_end_block(stage, "").await
    }

    async fn max_finished_block(&self, stage: &str) -> Result<Option<u64>, StoreError> {
        self.max_end_block(stage, " AND status = 1").await
    }

    async fn claim_ranges(&self, stage: &str, limit: usize) -> Result<Vec<RangeRecord>, StoreError> {
        let sql = format!(
            "UPDATE {t} SET status = -1 \
             WHERE id IN ( \
                 SELECT id FROM {t} \
                 WHERE stage = $1 AND status = 0 \
                 ORDER BY start_block ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {cols}",
            t = self.table,
            cols = RECORD_COLUMNS,
        );
        let rows = self.pool.query(&sql, &[&stage, &(limit as i64)]).await?;
        let mut records = rows
            .iter()
            .map(|row| self.record_from_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery's order.
        records.sort_by_key(|r| r.start_block);
        Ok(records)
    }

    async fn recover_leases(&self, stage: &str) -> Result<LeaseRecovery, StoreError> {
        let claims_sql = format!(
            "UPDATE {} SET status = 0, start_ts = NULL WHERE stage = $1 AND status = -1",
            self.table
        );
        let claims_reset = self.pool.execute(&claims_sql, &[&stage]).await?;

        let leases_sql = format!(
            "UPDATE {} SET validator_passes = -validator_passes - 1 \
             WHERE stage = $1 AND validator_passes < 0",
            self.table
        );
        let validator_leases_reset = self.pool.execute(&leases_sql, &[&stage]).await?;

        Ok(LeaseRecovery {
            claims_reset,
            validator_leases_reset,
        })
    }

    async fn lease_validation_range(
        &self,
        stage: &str,
        max_end_block: u64,
    ) -> Result<Option<RangeRecord>, StoreError> {
        let sql = format!(
            "UPDATE {t} SET validator_passes = -(validator_passes + 1) \
             WHERE id = ( \
                 SELECT id FROM {t} \
                 WHERE stage = $1 AND status = 1 AND validator_passes >= 0 \
                   AND end_block <= $2 \
                 ORDER BY validator_passes ASC, start_block ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {cols}",
            t = self.table,
            cols = RECORD_COLUMNS,
        );
        let rows = self
            .pool
            .query(&sql, &[&stage, &(max_end_block as i64)])
            .await?;
        rows.first()
            .map(|row| self.record_from_row(row))
            .transpose()
    }

    async fn active_addresses(
        &self,
        stage: &str,
        as_of_block: u64,
    ) -> Result<Vec<Address>, StoreError> {
        let sql = format!(
            "SELECT address FROM {} WHERE stage = $1 AND block_number < $2",
            DISCOVERED_TABLE
        );
        let rows = self
            .pool
            .query(&sql, &[&stage, &(as_of_block as i64)])
            .await?;
        rows.iter()
            .map(|row| {
                let bytes: Vec<u8> = row.get(0);
                if bytes.len() != Address::len_bytes() {
                    return Err(StoreError::Corrupt(format!(
                        "discovered address of {} bytes",
                        bytes.len()
                    )));
                }
                Ok(Address::from_slice(&bytes))
            })
            .collect()
    }

    async fn commit_ingested(
        &self,
        record: &RangeRecord,
        events: &[DomainEvent],
        discovered: &[DiscoveredAddress],
    ) -> Result<(), StoreError> {
        let mut ops = Vec::with_capacity(events.len() + discovered.len() + 1);
        Self::event_inserts(&record.stage, events, &mut ops);
        Self::discovery_inserts(&record.stage, discovered, &mut ops);
        ops.push(self.progress_update(record));
        self.pool.execute_transaction(ops).await?;
        Ok(())
    }

    async fn mark_validated(&self, record: &RangeRecord) -> Result<(), StoreError> {
        self.pool
            .execute_transaction(vec![self.progress_update(record)])
            .await?;
        Ok(())
    }

    async fn replace_events(
        &self,
        record: &RangeRecord,
        events: &[DomainEvent],
        discovered: &[DiscoveredAddress],
    ) -> Result<(), StoreError> {
        let mut ops = Vec::with_capacity(events.len() + discovered.len() + 2);
        ops.push(DbOperation::Delete {
            table: EVENTS_TABLE.to_string(),
            where_clause: WhereClause::Raw {
                condition: "stage = $1 AND block_number >= $2 AND block_number <= $3".to_string(),
                params: vec![
                    DbValue::Text(record.stage.clone()),
                    DbValue::Uint64(record.start_block),
                    DbValue::Uint64(record.end_block),
                ],
            },
        });
        Self::event_inserts(&record.stage, events, &mut ops);
        Self::discovery_inserts(&record.stage, discovered, &mut ops);
        ops.push(self.progress_update(record));
        self.pool.execute_transaction(ops).await?;
        Ok(())
    }

    async fn list_events(
        &self,
        stage: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<DomainEvent>, StoreError> {
        let sql = format!(
            "SELECT block_number, log_index, name, address, tx_hash, block_timestamp, payload \
             FROM {} WHERE stage = $1 AND block_number >= $2 AND block_number <= $3 \
             ORDER BY block_number ASC, log_index ASC",
            EVENTS_TABLE
        );
        let rows = self
            .pool
            .query(&sql, &[&stage, &(start as i64), &(end as i64)])
            .await?;

        rows.iter()
            .map(|row| {
                let block_number: i64 = row.get(0);
                let log_index: i64 = row.get(1);
                let address: Vec<u8> = row.get(3);
                let tx_hash: Vec<u8> = row.get(4);
                let block_timestamp: i64 = row.get(5);

                if address.len() != Address::len_bytes() {
                    return Err(StoreError::Corrupt(format!(
                        "event address of {} bytes",
                        address.len()
                    )));
                }
                if tx_hash.len() != B256::len_bytes() {
                    return Err(StoreError::Corrupt(format!(
                        "event tx hash of {} bytes",
                        tx_hash.len()
                    )));
                }

                Ok(DomainEvent {
                    name: row.get(2),
                    address: Address::from_slice(&address),
                    block_number: block_number as u64,
                    log_index: log_index as u64,
                    tx_hash: B256::from_slice(&tx_hash),
                    timestamp: block_timestamp as u64,
                    payload: row.get(6),
                })
            })
            .collect()
    }
}
