use asx_api::{qualify_symbol, PriceQuery, Query};
use chrono::{NaiveDate, TimeZone, Utc};
use url::Url;

fn base_url() -> Url {
    Url::parse("https://example.com/v7/finance/download/BHP.AX").unwrap()
}

#[test]
fn price_query_defaults() {
    let url = PriceQuery::default().add_to_url(&base_url());
    let query = url.query().unwrap();
    assert!(query.contains("interval=1d"));
    assert!(query.contains("events=history"));
    assert!(query.contains("includeAdjustedClose=true"));
}

#[test]
fn price_query_epoch_seconds() {
    let start = NaiveDate::from_ymd_opt(2010, 1, 1).unwrap();
    let end = Utc.with_ymd_and_hms(2020, 5, 11, 0, 0, 0).unwrap();
    let url = PriceQuery::default()
        .with_start_date(start)
        .with_end(end)
        .add_to_url(&base_url());
    let query = url.query().unwrap();
    assert!(query.contains("period1=1262304000"));
    assert!(query.contains("period2=1589155200"));
}

#[test]
fn qualify_appends_suffix() {
    assert_eq!(qualify_symbol("bhp", "AX"), "BHP.AX");
    assert_eq!(qualify_symbol(" cba ", ".ax"), "CBA.AX");
}

#[test]
fn qualify_leaves_indices_and_qualified_symbols() {
    assert_eq!(qualify_symbol("^aord", "AX"), "^AORD");
    assert_eq!(qualify_symbol("BTC-AUD", ""), "BTC-AUD");
    assert_eq!(qualify_symbol("BHP.L", "AX"), "BHP.L");
}
