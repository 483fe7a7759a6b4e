//! SQLite storage for the roster and daily price history.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::types::{Entity, PriceRow};

/// Version written to `PRAGMA user_version` by [`Db::ensure_schema`].
pub const SCHEMA_VERSION: i32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("cannot open database: {0}")]
    Connection(#[source] rusqlite::Error),
    #[error("schema setup failed: {0}")]
    Schema(#[source] rusqlite::Error),
    #[error("write failed: {0}")]
    Write(#[source] rusqlite::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("date parse error: {0}")]
    Date(#[from] chrono::ParseError),
    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: i32, supported: i32 },
}

/// Watermark of a symbol with no persisted rows.
pub fn epoch_sentinel() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Which roster/price table pair an operation targets.
///
/// Equities and market indices share row shapes but live in separate tables,
/// so their symbol namespaces never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSeries {
    Equity,
    Index,
}

impl PriceSeries {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equity => "equity",
            Self::Index => "index",
        }
    }

    fn roster_table(self) -> &'static str {
        match self {
            Self::Equity => "company",
            Self::Index => "market_index",
        }
    }

    fn price_table(self) -> &'static str {
        match self {
            Self::Equity => "stock_price",
            Self::Index => "index_price",
        }
    }
}

impl std::fmt::Display for PriceSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A market index seeded out of band, with the last date synced for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub name: String,
    pub symbol: String,
    pub last_date: Option<NaiveDate>,
}

impl IndexRecord {
    pub fn entity(&self) -> Entity {
        Entity::new(self.name.clone(), self.symbol.clone(), "")
    }
}

/// Per-symbol coverage of the price table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolSummary {
    pub symbol: String,
    pub name: String,
    pub rows: i64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path).map_err(DbError::Connection)?;
        Self::configure(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(DbError::Connection)?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self, DbError> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(DbError::Connection)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(DbError::Connection)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection (for tests).
    #[doc(hidden)]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Create any missing tables and indexes.
    ///
    /// Safe to call on every start, including from several processes racing
    /// on a fresh file: all DDL is `IF NOT EXISTS` and runs inside an
    /// `IMMEDIATE` transaction, so initializers queue on the write lock.
    pub fn ensure_schema(&mut self) -> Result<(), DbError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::Schema)?;

        let version: i32 = tx
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(DbError::Schema)?;
        if version > SCHEMA_VERSION {
            return Err(DbError::UnsupportedVersion {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }

        let schema = include_str!("../../schema/sqlite.sql");
        tx.execute_batch(schema).map_err(DbError::Schema)?;
        if version < SCHEMA_VERSION {
            tx.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(DbError::Schema)?;
        }
        tx.commit().map_err(DbError::Schema)?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i32, DbError> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, DbError> {
        self.conn
            .query_row(
                "SELECT value FROM ingest_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(DbError::from)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn
            .execute(
                "INSERT INTO ingest_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(DbError::Write)?;
        Ok(())
    }

    /// Atomically replace the company roster.
    ///
    /// The previous roster is discarded even when the new one is a subset of
    /// it. Price history is left untouched.
    pub fn replace_entities(&mut self, entities: &[Entity]) -> Result<usize, DbError> {
        let tx = self.conn.transaction().map_err(DbError::Write)?;
        tx.execute("DELETE FROM company", []).map_err(DbError::Write)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO company (name, symbol, industry_group) VALUES (?1, ?2, ?3)")
                .map_err(DbError::Write)?;
            for entity in entities {
                stmt.execute(params![entity.name, entity.symbol.trim(), entity.group])
                    .map_err(DbError::Write)?;
            }
        }
        tx.commit().map_err(DbError::Write)?;
        Ok(entities.len())
    }

    /// The persisted company roster, in the order it was written.
    pub fn entities(&self) -> Result<Vec<Entity>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, symbol, industry_group FROM company ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Entity {
                name: row.get(0)?,
                symbol: row.get(1)?,
                group: row.get(2)?,
            })
        })?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    pub fn entity_count(&self, series: PriceSeries) -> Result<i64, DbError> {
        let sql = format!("SELECT COUNT(1) FROM {}", series.roster_table());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    /// Most recent persisted date for `symbol`, if any. Case-insensitive.
    pub fn last_price_date(
        &self,
        series: PriceSeries,
        symbol: &str,
    ) -> Result<Option<NaiveDate>, DbError> {
        let sql = format!(
            "SELECT MAX(date) FROM {} WHERE symbol = ?1",
            series.price_table()
        );
        let max_date: Option<String> =
            self.conn
                .query_row(&sql, params![symbol.trim()], |row| row.get(0))?;
        let Some(value) = max_date else {
            return Ok(None);
        };
        Ok(Some(NaiveDate::parse_from_str(&value, "%Y-%m-%d")?))
    }

    /// Watermark for a symbol in `series`: the last persisted date, or
    /// [`epoch_sentinel`] when nothing is stored yet.
    pub fn series_watermark(&self, series: PriceSeries, symbol: &str) -> Result<NaiveDate, DbError> {
        Ok(self
            .last_price_date(series, symbol)?
            .unwrap_or_else(epoch_sentinel))
    }

    /// Equity watermark. See [`Db::series_watermark`].
    pub fn watermark(&self, symbol: &str) -> Result<NaiveDate, DbError> {
        self.series_watermark(PriceSeries::Equity, symbol)
    }

    /// Insert equity price rows. See [`Db::append_series_prices`].
    pub fn append_prices(&mut self, rows: &[PriceRow]) -> Result<usize, DbError> {
        self.append_series_prices(PriceSeries::Equity, rows)
    }

    /// Insert price rows in a single transaction.
    ///
    /// Rows are expected to cover only dates not yet stored; nothing is
    /// deduplicated here. A row that collides on (symbol, date) fails the
    /// whole batch with [`DbError::Write`].
    pub fn append_series_prices(
        &mut self,
        series: PriceSeries,
        rows: &[PriceRow],
    ) -> Result<usize, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "INSERT INTO {} (date, open, high, low, close, adj_close, volume, symbol)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            series.price_table()
        );
        let tx = self.conn.transaction().map_err(DbError::Write)?;
        {
            let mut stmt = tx.prepare(&sql).map_err(DbError::Write)?;
            for row in rows {
                stmt.execute(params![
                    row.date.to_string(),
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.adj_close,
                    row.volume,
                    row.symbol,
                ])
                .map_err(DbError::Write)?;
            }
        }
        tx.commit().map_err(DbError::Write)?;
        Ok(rows.len())
    }

    pub fn price_count(&self, series: PriceSeries, symbol: &str) -> Result<i64, DbError> {
        let sql = format!(
            "SELECT COUNT(1) FROM {} WHERE symbol = ?1",
            series.price_table()
        );
        let count: i64 = self
            .conn
            .query_row(&sql, params![symbol.trim()], |row| row.get(0))?;
        Ok(count)
    }

    /// Price rows for a symbol in date order.
    pub fn prices(&self, series: PriceSeries, symbol: &str) -> Result<Vec<PriceRow>, DbError> {
        let sql = format!(
            "SELECT symbol, date, open, high, low, close, adj_close, volume
             FROM {} WHERE symbol = ?1 ORDER BY date",
            series.price_table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![symbol.trim()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut prices = Vec::new();
        for row in rows {
            let (symbol, date, open, high, low, close, adj_close, volume) = row?;
            prices.push(PriceRow {
                symbol,
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")?,
                open,
                high,
                low,
                close,
                adj_close,
                volume,
            });
        }
        Ok(prices)
    }

    /// Row count and date coverage for every symbol on the roster of `series`,
    /// in roster order. Symbols without prices report zero rows.
    pub fn roster_summaries(&self, series: PriceSeries) -> Result<Vec<SymbolSummary>, DbError> {
        let sql = format!(
            "SELECT r.symbol, r.name, COUNT(p.id), MIN(p.date), MAX(p.date)
             FROM {roster} r
             LEFT JOIN {prices} p ON p.symbol = r.symbol
             GROUP BY r.id
             ORDER BY r.id",
            roster = series.roster_table(),
            prices = series.price_table(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (symbol, name, count, first, last) = row?;
            summaries.push(SymbolSummary {
                symbol,
                name,
                rows: count,
                first_date: parse_opt_date(first)?,
                last_date: parse_opt_date(last)?,
            });
        }
        Ok(summaries)
    }

    /// Add a market index to the index roster, or rename an existing one.
    pub fn upsert_index(&self, entity: &Entity) -> Result<(), DbError> {
        self.conn
            .execute(
                "INSERT INTO market_index (name, symbol) VALUES (?1, ?2)
                 ON CONFLICT(symbol) DO UPDATE SET name = excluded.name",
                params![entity.name, entity.symbol.trim()],
            )
            .map_err(DbError::Write)?;
        Ok(())
    }

    /// Remove an index from the roster. Its price history is kept.
    pub fn remove_index(&self, symbol: &str) -> Result<bool, DbError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM market_index WHERE symbol = ?1",
                params![symbol.trim()],
            )
            .map_err(DbError::Write)?;
        Ok(removed > 0)
    }

    pub fn indices(&self) -> Result<Vec<IndexRecord>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, symbol, last_date FROM market_index ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        let mut indices = Vec::new();
        for row in rows {
            let (name, symbol, last_date) = row?;
            indices.push(IndexRecord {
                name,
                symbol,
                last_date: parse_opt_date(last_date)?,
            });
        }
        Ok(indices)
    }

    pub fn set_index_last_date(&self, symbol: &str, date: NaiveDate) -> Result<(), DbError> {
        self.conn
            .execute(
                "UPDATE market_index SET last_date = ?1 WHERE symbol = ?2",
                params![date.to_string(), symbol.trim()],
            )
            .map_err(DbError::Write)?;
        Ok(())
    }
}

fn parse_opt_date(value: Option<String>) -> Result<Option<NaiveDate>, DbError> {
    value
        .map(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d"))
        .transpose()
        .map_err(DbError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> Db {
        let mut db = Db::open_in_memory().expect("open in-memory db");
        db.ensure_schema().expect("init schema");
        db
    }

    fn has_table(db: &Db, table: &str) -> bool {
        db.conn
            .query_row(
                "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get::<_, i64>(0),
            )
            .expect("query sqlite_master")
            > 0
    }

    fn row(symbol: &str, date: &str) -> PriceRow {
        PriceRow {
            symbol: symbol.to_string(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            open: 10.0,
            high: 11.0,
            low: 9.5,
            close: 10.5,
            adj_close: 10.2,
            volume: 1_000,
        }
    }

    fn symbols(db: &Db) -> Vec<String> {
        db.entities()
            .unwrap()
            .into_iter()
            .map(|e| e.symbol)
            .collect()
    }

    #[test]
    fn ensure_schema_creates_all_tables() {
        let db = open_test_db();
        for table in ["company", "stock_price", "market_index", "index_price", "ingest_meta"] {
            assert!(has_table(&db, table), "missing table {}", table);
        }
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let mut db = open_test_db();
        db.replace_entities(&[Entity::new("BHP Group", "BHP", "Materials")])
            .unwrap();
        db.ensure_schema().expect("second init");
        db.ensure_schema().expect("third init");
        assert_eq!(symbols(&db), vec!["BHP"]);
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let mut db = open_test_db();
        db.conn.pragma_update(None, "user_version", 99).unwrap();
        let err = db.ensure_schema().unwrap_err();
        assert!(matches!(
            err,
            DbError::UnsupportedVersion { found: 99, supported: SCHEMA_VERSION }
        ));
    }

    #[test]
    fn open_missing_directory_is_connection_error() {
        let path = std::env::temp_dir()
            .join("asxsync-no-such-dir")
            .join("nested")
            .join("db.sqlite");
        let err = Db::open(path).err().expect("open should fail");
        assert!(matches!(err, DbError::Connection(_)));
    }

    #[test]
    fn concurrent_schema_setup_on_fresh_file() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "asxsync-schema-{}-{}.sqlite",
            std::process::id(),
            nanos
        ));

        let handles: Vec<_> = (0..2)
            .map(|_| Db::open(&path).expect("open file db"))
            .map(|mut db| std::thread::spawn(move || db.ensure_schema()))
            .collect();
        for handle in handles {
            handle.join().expect("thread").expect("ensure_schema");
        }

        let db = Db::open(&path).unwrap();
        assert!(has_table(&db, "stock_price"));
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);

        drop(db);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    #[test]
    fn replace_entities_is_total() {
        let mut db = open_test_db();
        db.replace_entities(&[
            Entity::new("X Ltd", "X", "Banks"),
            Entity::new("Z Ltd", "Z", "Energy"),
        ])
        .unwrap();
        db.replace_entities(&[
            Entity::new("X Ltd", "X", "Banks"),
            Entity::new("Y Ltd", "Y", "Media"),
        ])
        .unwrap();
        assert_eq!(symbols(&db), vec!["X", "Y"]);
    }

    #[test]
    fn replace_entities_keeps_roster_order() {
        let mut db = open_test_db();
        let roster = vec![
            Entity::new("Zeta", "ZZZ", ""),
            Entity::new("Alpha", "AAA", ""),
            Entity::new("Mid", "MMM", ""),
        ];
        db.replace_entities(&roster).unwrap();
        assert_eq!(db.entities().unwrap(), roster);
    }

    #[test]
    fn replace_entities_rolls_back_on_duplicate() {
        let mut db = open_test_db();
        db.replace_entities(&[Entity::new("Old", "OLD", "")]).unwrap();
        let err = db
            .replace_entities(&[Entity::new("A", "ABC", ""), Entity::new("A again", "abc", "")])
            .unwrap_err();
        assert!(matches!(err, DbError::Write(_)));
        assert_eq!(symbols(&db), vec!["OLD"]);
    }

    #[test]
    fn watermark_sentinel_when_empty() {
        let db = open_test_db();
        assert_eq!(db.watermark("ABC").unwrap(), epoch_sentinel());
    }

    #[test]
    fn watermark_is_max_date_and_case_insensitive() {
        let mut db = open_test_db();
        db.append_prices(&[
            row("BHP", "2020-05-04"),
            row("BHP", "2020-05-06"),
            row("BHP", "2020-05-05"),
            row("CBA", "2020-06-01"),
        ])
        .unwrap();
        let expected = NaiveDate::from_ymd_opt(2020, 5, 6).unwrap();
        assert_eq!(db.watermark("BHP").unwrap(), expected);
        assert_eq!(db.watermark("bhp").unwrap(), expected);
    }

    #[test]
    fn series_are_separate_namespaces() {
        let mut db = open_test_db();
        db.append_series_prices(PriceSeries::Index, &[row("XJO", "2021-01-04")])
            .unwrap();
        assert_eq!(db.watermark("XJO").unwrap(), epoch_sentinel());
        assert_eq!(
            db.series_watermark(PriceSeries::Index, "xjo").unwrap(),
            NaiveDate::from_ymd_opt(2021, 1, 4).unwrap()
        );
    }

    #[test]
    fn duplicate_append_is_a_write_error() {
        let mut db = open_test_db();
        db.append_prices(&[row("BHP", "2020-05-04")]).unwrap();
        let err = db
            .append_prices(&[row("BHP", "2020-05-05"), row("bhp", "2020-05-04")])
            .unwrap_err();
        assert!(matches!(err, DbError::Write(_)));
        // The failed batch is rolled back entirely.
        assert_eq!(db.price_count(PriceSeries::Equity, "BHP").unwrap(), 1);
    }

    #[test]
    fn append_empty_is_noop() {
        let mut db = open_test_db();
        assert_eq!(db.append_prices(&[]).unwrap(), 0);
    }

    #[test]
    fn prices_round_trip_in_date_order() {
        let mut db = open_test_db();
        db.append_prices(&[row("BHP", "2020-05-05"), row("BHP", "2020-05-04")])
            .unwrap();
        let stored = db.prices(PriceSeries::Equity, "BHP").unwrap();
        assert_eq!(stored, vec![row("BHP", "2020-05-04"), row("BHP", "2020-05-05")]);
    }

    #[test]
    fn roster_summaries_include_symbols_without_prices() {
        let mut db = open_test_db();
        db.replace_entities(&[
            Entity::new("BHP Group", "BHP", "Materials"),
            Entity::new("New Listing", "NEW", "Banks"),
        ])
        .unwrap();
        db.append_prices(&[row("BHP", "2020-05-04"), row("BHP", "2020-05-08")])
            .unwrap();

        let summaries = db.roster_summaries(PriceSeries::Equity).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].rows, 2);
        assert_eq!(
            summaries[0].first_date,
            NaiveDate::from_ymd_opt(2020, 5, 4)
        );
        assert_eq!(summaries[0].last_date, NaiveDate::from_ymd_opt(2020, 5, 8));
        assert_eq!(summaries[1].symbol, "NEW");
        assert_eq!(summaries[1].rows, 0);
        assert_eq!(summaries[1].last_date, None);
    }

    #[test]
    fn index_roster_upsert_and_remove() {
        let db = open_test_db();
        db.upsert_index(&Entity::new("All Ordinaries", "^AORD", ""))
            .unwrap();
        db.upsert_index(&Entity::new("S&P/ASX 200", "^AXJO", ""))
            .unwrap();
        db.upsert_index(&Entity::new("All Ords", "^aord", "")).unwrap();

        let indices = db.indices().unwrap();
        assert_eq!(indices.len(), 2);
        assert_eq!(indices[0].name, "All Ords");
        assert_eq!(indices[0].last_date, None);

        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        db.set_index_last_date("^AORD", date).unwrap();
        assert_eq!(db.indices().unwrap()[0].last_date, Some(date));

        assert!(db.remove_index("^axjo").unwrap());
        assert!(!db.remove_index("^AXJO").unwrap());
        assert_eq!(db.entity_count(PriceSeries::Index).unwrap(), 1);
    }

    #[test]
    fn meta_round_trip() {
        let db = open_test_db();
        assert_eq!(db.get_meta("last_run_completed_at").unwrap(), None);
        db.set_meta("last_run_completed_at", "2024-01-01T00:00:00Z")
            .unwrap();
        db.set_meta("last_run_completed_at", "2024-01-02T00:00:00Z")
            .unwrap();
        assert_eq!(
            db.get_meta("last_run_completed_at").unwrap().as_deref(),
            Some("2024-01-02T00:00:00Z")
        );
    }
}
