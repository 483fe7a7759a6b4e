//! Typed rows produced by the roster and price sources.

mod entity;
mod price;

pub use self::entity::Entity;
pub use self::price::PriceRow;
