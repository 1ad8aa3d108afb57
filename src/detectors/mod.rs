pub mod ast;
pub mod units;
