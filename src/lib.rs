use anyhow::Error;

#[macro_use]
mod macros;

pub mod dating;
pub mod io;
pub mod operators;
pub mod scaled_value;
pub mod search;
pub mod species_tree;
pub mod tree;

type Result<T> = std::result::Result<T, Error>;

#[allow(non_camel_case_types)]
type f64_h = ordered_float::OrderedFloat<f64>;
