//! Serde helpers shared by the data model.

pub mod time;
