//! libSQL-backed local store for Satchel

mod connection;
mod migrations;
mod records;

pub use connection::LocalDatabase;
pub use records::StoredRecord;
