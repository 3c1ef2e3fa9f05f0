// crates/db/src/queries/mod.rs

pub mod listener;
