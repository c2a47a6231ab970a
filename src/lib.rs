//! Persistence layer for a game server: a key-value engine, a per-type entity store and a
//! named-group async dispatcher that lets single-threaded logic issue database work.

pub mod dao;
pub mod services;

pub use dao::{
    entity_store::{EntityStorage, MemoryEntityStorage, MongoEntityStorage},
    kvdb::{KvEngine, KvIterator, MemoryKvEngine, MongoKvEngine},
    models::{EntityId, EntityRecord, KvItem},
    mongodb::MongoConfig,
    storage::{StorageError, StorageResult},
};
pub use services::{
    dispatcher::{AsyncDispatcher, JobError, JobHandle},
    queued_mongo::QueuedMongo,
};
