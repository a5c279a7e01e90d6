//! Secretum Store - persistent storage for sealed records

pub mod sqlite;

pub use sqlite::SqliteRecordStore;
