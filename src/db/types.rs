use alloy::primitives::{Address, B256};

/// A typed SQL parameter. Values are converted to postgres wire types by the
/// pool; `Timestamp` carries epoch seconds and is bound through
/// `to_timestamp()`.
#[derive(Debug, Clone)]
pub enum DbValue {
    Null,
    Int16(i16),
    Int64(i64),
    Uint64(u64),
    Text(String),
    Bytes(Vec<u8>),
    Address(Address),
    Hash(B256),
    Json(serde_json::Value),
    Timestamp(u64),
}

#[derive(Debug, Clone)]
pub enum WhereClause {
    Eq(String, DbValue),
    And(Vec<(String, DbValue)>),
    Raw {
        condition: String,
        params: Vec<DbValue>,
    },
}

/// One statement inside a transactional batch.
#[derive(Debug, Clone)]
pub enum DbOperation {
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
        /// Appends `ON CONFLICT DO NOTHING`, making the insert idempotent.
        on_conflict_ignore: bool,
    },
    Update {
        table: String,
        set_columns: Vec<(String, DbValue)>,
        where_clause: WhereClause,
    },
    Delete {
        table: String,
        where_clause: WhereClause,
    },
    RawSql {
        query: String,
        params: Vec<DbValue>,
    },
}
