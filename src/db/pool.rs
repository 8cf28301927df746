use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use super::error::DbError;
use super::types::{DbOperation, DbValue, WhereClause};

pub struct DbPool {
    pool: Pool,
}

impl DbPool {
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| DbError::InvalidConnectionString(e.to_string()))?;

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);

        let pool = Pool::builder(manager)
            .max_size(16)
            .runtime(Runtime::Tokio1)
            .build()?;

        let _conn = pool.get().await?;
        tracing::info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    pub fn inner(&self) -> &Pool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        super::migrations::run(&self.pool).await
    }

    /// Execute a batch of operations inside one transaction. Either every
    /// statement commits or none do.
    pub async fn execute_transaction(&self, operations: Vec<DbOperation>) -> Result<(), DbError> {
        if operations.is_empty() {
            return Ok(());
        }

        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        for op in operations {
            let (sql, params) = build_sql(op);
            let params_refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

            if let Err(e) = transaction.execute(&sql, &params_refs[..]).await {
                let db_err: DbError = e.into();
                tracing::error!("SQL execution failed\n  SQL: {}\n  Error: {}", sql, db_err);
                return Err(db_err);
            }
        }

        transaction.commit().await?;
        Ok(())
    }

    pub async fn query(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>, DbError> {
        let client = self.pool.get().await?;
        let rows = client.query(query, params).await?;
        Ok(rows)
    }

    pub async fn execute(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, DbError> {
        let client = self.pool.get().await?;
        let affected = client.execute(query, params).await?;
        Ok(affected)
    }
}

#[derive(Debug)]
enum SqlParam {
    Null,
    Int16(i16),
    Int64(i64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Float64(f64),
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &tokio_postgres::types::Type,
        out: &mut BytesMut,
    ) -> Result<tokio_postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(tokio_postgres::types::IsNull::Yes),
            SqlParam::Int16(v) => v.to_sql(ty, out),
            SqlParam::Int64(v) => v.to_sql(ty, out),
            SqlParam::Text(v) => v.to_sql(ty, out),
            SqlParam::Bytes(v) => v.to_sql(ty, out),
            SqlParam::Json(v) => v.to_sql(ty, out),
            SqlParam::Float64(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(ty: &tokio_postgres::types::Type) -> bool {
        <i16 as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <f64 as ToSql>::accepts(ty)
            || <String as ToSql>::accepts(ty)
            || <Vec<u8> as ToSql>::accepts(ty)
            || <serde_json::Value as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}

fn convert_db_value(value: &DbValue) -> SqlParam {
    match value {
        DbValue::Null => SqlParam::Null,
        DbValue::Int16(v) => SqlParam::Int16(*v),
        DbValue::Int64(v) => SqlParam::Int64(*v),
        DbValue::Uint64(v) => SqlParam::Int64(*v as i64),
        DbValue::Text(v) => SqlParam::Text(v.clone()),
        DbValue::Bytes(v) => SqlParam::Bytes(v.clone()),
        DbValue::Address(v) => SqlParam::Bytes(v.to_vec()),
        DbValue::Hash(v) => SqlParam::Bytes(v.to_vec()),
        DbValue::Json(v) => SqlParam::Json(v.clone()),
        DbValue::Timestamp(v) => SqlParam::Float64(*v as f64),
    }
}

/// Placeholder for the value at `param_idx`. Timestamps are sent as epoch
/// seconds and cast by postgres.
fn placeholder_for(value: &DbValue, param_idx: usize) -> String {
    match value {
        DbValue::Timestamp(_) => format!("to_timestamp(${})", param_idx),
        _ => format!("${}", param_idx),
    }
}

/// Wrap an identifier in double quotes to handle reserved keywords.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

fn quote_cols(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_sql(op: DbOperation) -> (String, Vec<SqlParam>) {
    match op {
        DbOperation::Insert {
            table,
            columns,
            values,
            on_conflict_ignore,
        } => {
            let cols = quote_cols(&columns);
            let placeholders: Vec<String> = values
                .iter()
                .enumerate()
                .map(|(i, v)| placeholder_for(v, i + 1))
                .collect();

            let mut sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                cols,
                placeholders.join(", ")
            );
            if on_conflict_ignore {
                sql.push_str(" ON CONFLICT DO NOTHING");
            }
            let params = values.iter().map(convert_db_value).collect();
            (sql, params)
        }
        DbOperation::Update {
            table,
            set_columns,
            where_clause,
        } => {
            let mut params = Vec::new();
            let mut param_idx = 1;

            let sets: Vec<String> = set_columns
                .iter()
                .map(|(col, val)| {
                    let ph = placeholder_for(val, param_idx);
                    params.push(convert_db_value(val));
                    param_idx += 1;
                    format!("{} = {}", quote_ident(col), ph)
                })
                .collect();

            let where_str = build_where_sql(&where_clause, &mut params, &mut param_idx);
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                table,
                sets.join(", "),
                where_str
            );
            (sql, params)
        }
        DbOperation::Delete {
            table,
            where_clause,
        } => {
            let mut params = Vec::new();
            let mut param_idx = 1;
            let where_str = build_where_sql(&where_clause, &mut params, &mut param_idx);
            let sql = format!("DELETE FROM {} WHERE {}", table, where_str);
            (sql, params)
        }
        DbOperation::RawSql { query, params } => {
            (query, params.iter().map(convert_db_value).collect())
        }
    }
}

fn build_where_sql(
    where_clause: &WhereClause,
    params: &mut Vec<SqlParam>,
    param_idx: &mut usize,
) -> String {
    match where_clause {
        WhereClause::Eq(col, val) => {
            let ph = placeholder_for(val, *param_idx);
            params.push(convert_db_value(val));
            *param_idx += 1;
            format!("{} = {}", quote_ident(col), ph)
        }
        WhereClause::And(conditions) => {
            let parts: Vec<String> = conditions
                .iter()
                .map(|(col, val)| {
                    let ph = placeholder_for(val, *param_idx);
                    params.push(convert_db_value(val));
                    *param_idx += 1;
                    format!("{} = {}", quote_ident(col), ph)
                })
                .collect();
            parts.join(" AND ")
        }
        WhereClause::Raw { condition, params: raw_params } => {
            for p in raw_params {
                params.push(convert_db_value(p));
            }
            condition.clone()
        }
    }
}
