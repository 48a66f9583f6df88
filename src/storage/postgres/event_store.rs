//! PostgreSQL EventStore implementation.
//!
//! Queries run on the pool once [`PostgresEventStore::connect_pool`] has been
//! called; before that (or after `close`) each call opens and closes its own
//! connection.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, InsertStatement, OnConflict, Order, PostgresQueryBuilder, Query, SelectStatement, SimpleExpr};
use sea_query_binder::SqlxBinder;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Row};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::event::{Event, Payload};
use crate::storage::schema::{Events, CREATE_EVENTS_TABLE, EVENTS_TABLE};
use crate::storage::{
    EventStore, IndexStats, PerformanceReport, ReplayFilter, Result, StoreStats,
};

/// A connection borrowed from the pool or opened for a single call.
enum Conn {
    Pooled(PoolConnection<Postgres>),
    AdHoc(PgConnection),
}

impl Conn {
    fn as_mut(&mut self) -> &mut PgConnection {
        match self {
            Conn::Pooled(conn) => &mut **conn,
            Conn::AdHoc(conn) => conn,
        }
    }

    async fn release(self) {
        if let Conn::AdHoc(conn) = self {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Ad hoc connection did not close cleanly");
            }
        }
    }
}

/// PostgreSQL implementation of EventStore.
pub struct PostgresEventStore {
    options: PgConnectOptions,
    config: StorageConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresEventStore {
    /// Create a store for `config`. No connection is opened yet.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let statement_timeout = config.command_timeout().as_millis().to_string();
        let options = PgConnectOptions::from_str(&config.url)?
            .options([("statement_timeout", statement_timeout)]);

        Ok(Self {
            options,
            config: config.clone(),
            pool: RwLock::new(None),
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        let options = (*pool.connect_options()).clone();
        Self {
            options,
            config: StorageConfig::default(),
            pool: RwLock::new(Some(pool)),
        }
    }

    /// Open the connection pool. No-op if already open.
    pub async fn connect_pool(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .min_connections(self.config.pool_min)
            .max_connections(self.config.pool_max)
            .connect_with(self.options.clone())
            .await?;

        info!(
            min = self.config.pool_min,
            max = self.config.pool_max,
            "Event store pool connected"
        );
        *guard = Some(pool);
        Ok(())
    }

    async fn acquire(&self) -> Result<Conn> {
        if let Some(pool) = self.pool.read().await.as_ref() {
            return Ok(Conn::Pooled(pool.acquire().await?));
        }
        Ok(Conn::AdHoc(PgConnection::connect_with(&self.options).await?))
    }

    async fn insert(&self, statement: InsertStatement) -> Result<u64> {
        let (sql, values) = statement.build_sqlx(PostgresQueryBuilder);

        let mut conn = self.acquire().await?;
        let result = sqlx::query_with(&sql, values).execute(conn.as_mut()).await;
        conn.release().await;

        Ok(result?.rows_affected())
    }

    async fn fetch(&self, statement: SelectStatement) -> Result<Vec<PgRow>> {
        let (sql, values) = statement.build_sqlx(PostgresQueryBuilder);

        let mut conn = self.acquire().await?;
        let result = sqlx::query_with(&sql, values).fetch_all(conn.as_mut()).await;
        conn.release().await;

        Ok(result?)
    }
}

/// Build a multi-row insert for `events`.
fn insert_statement(events: &[Event], skip_existing: bool) -> Result<InsertStatement> {
    let mut statement = Query::insert();
    statement.into_table(Events::Table).columns([
        Events::EventId,
        Events::Timestamp,
        Events::EventType,
        Events::Payload,
    ]);

    for event in events {
        let row: [SimpleExpr; 4] = [
            event.id().into(),
            event.timestamp().into(),
            event.event_type().into(),
            serde_json::Value::Object(event.payload().clone()).into(),
        ];
        statement.values(row)?;
    }

    if skip_existing {
        statement.on_conflict(OnConflict::column(Events::EventId).do_nothing().to_owned());
    }

    Ok(statement)
}

fn apply_filter(statement: &mut SelectStatement, filter: &ReplayFilter) {
    if let Some(start) = filter.start {
        statement.and_where(Expr::col(Events::Timestamp).gte(start));
    }
    if let Some(end) = filter.end {
        statement.and_where(Expr::col(Events::Timestamp).lte(end));
    }
    if let Some(event_type) = &filter.event_type {
        statement.and_where(Expr::col(Events::EventType).eq(event_type.as_str()));
    }
}

fn select_events() -> SelectStatement {
    Query::select()
        .columns([
            Events::EventId,
            Events::Timestamp,
            Events::EventType,
            Events::Payload,
        ])
        .from(Events::Table)
        .to_owned()
}

/// Replay query: inclusive bounds, ordered by timestamp then identity.
fn replay_statement(filter: &ReplayFilter) -> SelectStatement {
    let mut statement = select_events();
    apply_filter(&mut statement, filter);
    statement
        .order_by(Events::Timestamp, Order::Asc)
        .order_by(Events::EventId, Order::Asc);
    if let Some(limit) = filter.limit {
        statement.limit(limit);
    }
    statement
}

fn decode_row(row: &PgRow) -> Result<Event> {
    let event_id: String = row.try_get("event_id")?;
    let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
    let event_type: String = row.try_get("event_type")?;
    let Json(payload): Json<Payload> = row.try_get("payload")?;
    Ok(Event::from_parts(event_id, timestamp, event_type, payload))
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn initialize_schema(&self) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result: Result<()> = async {
            for statement in CREATE_EVENTS_TABLE {
                sqlx::query(statement).execute(conn.as_mut()).await?;
            }
            Ok(())
        }
        .await;
        conn.release().await;

        result?;
        info!("Event store schema initialized");
        Ok(())
    }

    #[tracing::instrument(name = "store.event", skip_all, fields(event_id = %event.id()))]
    async fn store_event(&self, event: &Event) -> bool {
        let statement = match insert_statement(std::slice::from_ref(event), false) {
            Ok(statement) => statement,
            Err(e) => {
                error!(error = %e, "Failed to build insert");
                return false;
            }
        };

        match self.insert(statement).await {
            Ok(1) => {
                debug!(event_type = %event.event_type(), "Stored event");
                true
            }
            Ok(rows) => {
                warn!(rows, "Unexpected row count storing event");
                false
            }
            Err(e) => {
                error!(error = %e, "Failed to store event");
                false
            }
        }
    }

    async fn store_events(&self, events: &[Event]) -> usize {
        if events.is_empty() {
            return 0;
        }

        let inserted = match insert_statement(events, true) {
            Ok(statement) => self.insert(statement).await,
            Err(e) => Err(e),
        };

        match inserted {
            Ok(rows) => {
                let skipped = events.len() as u64 - rows;
                debug!(inserted = rows, skipped, "Stored events");
                rows as usize
            }
            Err(e) => {
                error!(count = events.len(), error = %e, "Failed to store events");
                0
            }
        }
    }

    async fn get_event_by_id(&self, event_id: &str) -> Result<Option<Event>> {
        let statement = select_events()
            .and_where(Expr::col(Events::EventId).eq(event_id))
            .to_owned();

        let rows = self.fetch(statement).await?;
        rows.first().map(decode_row).transpose()
    }

    async fn replay_events(&self, filter: &ReplayFilter) -> Result<Vec<Event>> {
        let rows = self.fetch(replay_statement(filter)).await?;
        let events = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
        debug!(count = events.len(), ?filter, "Replayed events");
        Ok(events)
    }

    async fn count_events(&self, filter: &ReplayFilter) -> Result<u64> {
        let mut statement = Query::select()
            .expr(Expr::col(Events::EventId).count())
            .from(Events::Table)
            .to_owned();
        apply_filter(&mut statement, filter);

        let rows = self.fetch(statement).await?;
        let count: i64 = match rows.first() {
            Some(row) => row.try_get(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn analyze_performance(&self) -> Result<PerformanceReport> {
        let mut conn = self.acquire().await?;
        let result: Result<PerformanceReport> = async {
            let sizes = sqlx::query(
                "SELECT pg_relation_size($1::text::regclass) AS table_size, \
                        pg_total_relation_size($1::text::regclass) AS total_size, \
                        (SELECT reltuples::bigint FROM pg_class WHERE relname = $1) AS estimated_rows, \
                        (SELECT count(*) FROM events) AS row_count",
            )
            .bind(EVENTS_TABLE)
            .fetch_one(conn.as_mut())
            .await?;

            let index_rows = sqlx::query(
                "SELECT s.indexrelname::text AS name, i.indexdef::text AS definition, \
                        s.idx_scan AS scans, pg_relation_size(s.indexrelid) AS size_bytes \
                 FROM pg_stat_user_indexes s \
                 JOIN pg_indexes i ON i.indexname = s.indexrelname AND i.tablename = s.relname \
                 WHERE s.relname = $1 \
                 ORDER BY s.indexrelname",
            )
            .bind(EVENTS_TABLE)
            .fetch_all(conn.as_mut())
            .await?;

            let indexes = index_rows
                .iter()
                .map(|row| {
                    Ok(IndexStats {
                        name: row.try_get("name")?,
                        definition: row.try_get("definition")?,
                        scans: row.try_get::<Option<i64>, _>("scans")?.unwrap_or(0),
                        size_bytes: row.try_get("size_bytes")?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(PerformanceReport {
                table: EVENTS_TABLE.to_string(),
                row_count: sizes.try_get("row_count")?,
                estimated_rows: sizes
                    .try_get::<Option<i64>, _>("estimated_rows")?
                    .unwrap_or(0),
                table_size_bytes: sizes.try_get("table_size")?,
                total_size_bytes: sizes.try_get("total_size")?,
                indexes,
            })
        }
        .await;
        conn.release().await;

        let report = result?;
        info!(
            rows = report.row_count,
            table_size_bytes = report.table_size_bytes,
            indexes = report.indexes.len(),
            "Analyzed event store"
        );
        Ok(report)
    }

    async fn stats(&self) -> StoreStats {
        match self.pool.read().await.as_ref() {
            Some(pool) => StoreStats {
                pooled: true,
                pool_size: pool.size(),
                idle_connections: pool.num_idle(),
            },
            None => StoreStats::default(),
        }
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("Event store pool closed");
        }
    }
}
