#![allow(dead_code)]
pub mod charger;
pub mod error;
pub mod meter;
pub mod tariff;
pub mod types;
pub mod vehicle;

pub use charger::*;
pub use error::*;
pub use meter::*;
pub use tariff::*;
pub use types::*;
pub use vehicle::*;
