mod common;
pub use self::common::Query;

mod price;
pub use self::price::{qualify_symbol, PriceQuery};
