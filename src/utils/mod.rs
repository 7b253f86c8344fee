pub mod json;

pub use json::{lookup_number, number_at};
