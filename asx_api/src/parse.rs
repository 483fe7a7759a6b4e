//! CSV parsing for the roster and price payloads.
//!
//! Both sources are treated as untrusted: a malformed row is rejected and
//! counted, only a payload whose overall shape is wrong fails the parse.

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};

use crate::types::{Entity, PriceRow};
use crate::Error;

/// Rows that parsed, plus the number of rows that were rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub rows: Vec<T>,
    pub rejected: usize,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: 0,
        }
    }
}

/// Parse the listed-companies roster.
///
/// The first `preamble_rows` lines (title, blank line, header) are skipped;
/// remaining rows map positionally to name, symbol, group. A roster with no
/// valid rows is malformed.
pub fn parse_roster(body: &str, preamble_rows: usize) -> Result<Parsed<Entity>, Error> {
    let data: String = body.split_inclusive('\n').skip(preamble_rows).collect();
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(data.as_bytes());

    let mut parsed = Parsed::default();
    for record in reader.records() {
        let result = record
            .map_err(|e| e.to_string())
            .and_then(|r| entity_from_record(&r));
        match result {
            Ok(Some(entity)) => parsed.rows.push(entity),
            Ok(None) => {}
            Err(reason) => {
                tracing::warn!(%reason, "rejected roster row");
                parsed.rejected += 1;
            }
        }
    }

    if parsed.rows.is_empty() {
        return Err(Error::Malformed(format!(
            "roster contained no entities ({} rows rejected)",
            parsed.rejected
        )));
    }
    Ok(parsed)
}

fn entity_from_record(record: &StringRecord) -> Result<Option<Entity>, String> {
    if record.iter().all(str::is_empty) {
        return Ok(None);
    }
    let name = record.get(0).unwrap_or_default();
    let symbol = record.get(1).unwrap_or_default();
    let group = record.get(2).unwrap_or_default();

    if name.is_empty() {
        return Err(format!("missing company name in {:?}", record));
    }
    if symbol.is_empty() {
        return Err(format!("missing symbol for {}", name));
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '^')
    {
        return Err(format!("invalid symbol {:?} for {}", symbol, name));
    }

    Ok(Some(Entity::new(name, symbol.to_uppercase(), group)))
}

/// Column positions located from the price payload header.
struct PriceColumns {
    date: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    adj_close: usize,
    volume: usize,
}

impl PriceColumns {
    fn locate(headers: &StringRecord) -> Result<Self, Error> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
        };
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                Error::Malformed(format!("price header missing {:?}: {:?}", name, headers))
            })
        };

        let close = require("Close")?;
        Ok(Self {
            date: require("Date")?,
            open: require("Open")?,
            high: require("High")?,
            low: require("Low")?,
            close,
            // Older payloads have no adjusted column.
            adj_close: find("Adj Close").unwrap_or(close),
            volume: require("Volume")?,
        })
    }
}

/// Parse a daily price payload, stamping every row with `symbol`.
///
/// A blank payload is an empty result. A payload without the expected header
/// is malformed. Rows with `null` or unparseable fields are rejected.
pub fn parse_prices(body: &str, symbol: &str) -> Result<Parsed<PriceRow>, Error> {
    if body.trim().is_empty() {
        return Ok(Parsed::default());
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| Error::Malformed(format!("unreadable price header: {}", e)))?
        .clone();
    let columns = PriceColumns::locate(&headers)?;

    let mut parsed = Parsed::default();
    for record in reader.records() {
        let result = record
            .map_err(|e| e.to_string())
            .and_then(|r| price_from_record(&r, &columns, symbol));
        match result {
            Ok(row) => parsed.rows.push(row),
            Err(reason) => {
                tracing::debug!(symbol, %reason, "rejected price row");
                parsed.rejected += 1;
            }
        }
    }
    Ok(parsed)
}

fn price_from_record(
    record: &StringRecord,
    columns: &PriceColumns,
    symbol: &str,
) -> Result<PriceRow, String> {
    let field = |idx: usize| record.get(idx).unwrap_or_default();

    let date = NaiveDate::parse_from_str(field(columns.date), "%Y-%m-%d")
        .map_err(|e| format!("bad date {:?}: {}", field(columns.date), e))?;
    let price = |idx: usize| -> Result<f64, String> {
        let raw = field(idx);
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(format!("bad price {:?} on {}", raw, date)),
        }
    };
    let raw_volume = field(columns.volume);
    let volume = raw_volume
        .parse::<i64>()
        .or_else(|_| raw_volume.parse::<f64>().map(|v| v as i64))
        .map_err(|_| format!("bad volume {:?} on {}", raw_volume, date))?;

    Ok(PriceRow {
        symbol: symbol.to_string(),
        date,
        open: price(columns.open)?,
        high: price(columns.high)?,
        low: price(columns.low)?,
        close: price(columns.close)?,
        adj_close: price(columns.adj_close)?,
        volume,
    })
}
