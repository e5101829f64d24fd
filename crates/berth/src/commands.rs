pub mod check;
pub mod probe;
