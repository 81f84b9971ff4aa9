pub mod offsets;
pub mod run;
pub mod symbols;
