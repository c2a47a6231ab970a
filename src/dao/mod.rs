/// Per-type entity storage.
pub mod entity_store;
/// Key-value storage with range scans.
pub mod kvdb;
/// Database model definitions.
pub mod models;
/// Shared MongoDB configuration and connection handling.
pub mod mongodb;
/// Driver-native to generic value conversion.
pub mod normalize;
/// Storage abstraction layer for database operations.
pub mod storage;
