mod client;
mod errors;
pub mod parse;
mod query;
pub mod types;
pub mod user_agent;
pub use self::client::{Client, DEFAULT_PRICE_BASE_URL, DEFAULT_ROSTER_URL, DEFAULT_ROSTER_PREAMBLE_ROWS};
pub use self::errors::Error;
pub use self::parse::Parsed;
pub use self::query::{qualify_symbol, PriceQuery, Query};
