use std::io;

use mongodb::error::{Error as MongoError, ErrorKind};
use thiserror::Error;

use crate::dao::storage::StorageError;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to put key `{key}`")]
    Put {
        key: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to get key `{key}`")]
    Get {
        key: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to scan keys in [`{begin}`, `{end}`)")]
    Find {
        begin: String,
        end: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to advance cursor")]
    Cursor {
        #[source]
        source: MongoError,
    },
    #[error("failed to write entity `{id}` of type `{type_name}`")]
    WriteEntity {
        type_name: String,
        id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to read entity `{id}` of type `{type_name}`")]
    ReadEntity {
        type_name: String,
        id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to list entities of type `{type_name}`")]
    ListEntities {
        type_name: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to check existence of entity `{id}` of type `{type_name}`")]
    EntityExists {
        type_name: String,
        id: String,
        #[source]
        source: MongoError,
    },
    #[error("entity `{id}` of type `{type_name}` not found")]
    EntityNotFound { type_name: String, id: String },
    #[error("document `{id}` in `{collection}` has no usable `{field}` field")]
    MissingField {
        collection: String,
        id: String,
        field: &'static str,
    },
    #[error("`{operation}` on collection `{collection}` failed")]
    Command {
        operation: &'static str,
        collection: String,
        #[source]
        source: MongoError,
    },
}

impl MongoDaoError {
    fn driver_error(&self) -> Option<&MongoError> {
        match self {
            MongoDaoError::InvalidUri { source, .. }
            | MongoDaoError::ClientConstruction { source }
            | MongoDaoError::InitialPing { source, .. }
            | MongoDaoError::HealthPing { source }
            | MongoDaoError::Put { source, .. }
            | MongoDaoError::Get { source, .. }
            | MongoDaoError::Find { source, .. }
            | MongoDaoError::Cursor { source }
            | MongoDaoError::WriteEntity { source, .. }
            | MongoDaoError::ReadEntity { source, .. }
            | MongoDaoError::ListEntities { source, .. }
            | MongoDaoError::EntityExists { source, .. }
            | MongoDaoError::Command { source, .. } => Some(source),
            MongoDaoError::EntityNotFound { .. } | MongoDaoError::MissingField { .. } => None,
        }
    }
}

/// How a driver failure maps onto the storage error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Connection { eof: bool },
    Decode,
    Operation,
}

fn classify(err: &MongoError) -> Failure {
    match err.kind.as_ref() {
        ErrorKind::Io(io_err) => Failure::Connection {
            eof: matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
        },
        ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::Authentication { .. }
        | ErrorKind::Shutdown => Failure::Connection { eof: false },
        ErrorKind::BsonDeserialization(_) | ErrorKind::InvalidResponse { .. } => Failure::Decode,
        _ => Failure::Operation,
    }
}

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::EntityNotFound { type_name, id } => {
                StorageError::NotFound { type_name, id }
            }
            MongoDaoError::MissingField { .. } => StorageError::decode(err.to_string()),
            // Unusable connection strings are reported like unreachable servers.
            MongoDaoError::InvalidUri { .. } | MongoDaoError::ClientConstruction { .. } => {
                StorageError::connection(err.to_string(), false, err)
            }
            err => match err.driver_error().map(classify) {
                Some(Failure::Connection { eof }) => {
                    StorageError::connection(err.to_string(), eof, err)
                }
                Some(Failure::Decode) => {
                    let message = match err.driver_error() {
                        Some(source) => format!("{err}: {source}"),
                        None => err.to_string(),
                    };
                    StorageError::decode(message)
                }
                _ => StorageError::operation(err.to_string(), err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::mongodb::MongoConfig;

    #[test]
    fn not_found_keeps_its_classification() {
        let err: StorageError = MongoDaoError::EntityNotFound {
            type_name: "Player".into(),
            id: "p1".into(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!err.is_connection_error());
    }

    #[test]
    fn missing_field_is_a_decode_error() {
        let err: StorageError = MongoDaoError::MissingField {
            collection: "Player".into(),
            id: "p1".into(),
            field: "data",
        }
        .into();
        match err {
            StorageError::Decode { message } => assert!(message.contains("`data`")),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    fn get_failure(source: MongoError) -> StorageError {
        MongoDaoError::Get {
            key: "a".into(),
            source,
        }
        .into()
    }

    #[tokio::test]
    async fn invalid_uri_is_a_connection_error() {
        let err: StorageError = MongoConfig::from_uri("not-a-mongo-uri", None)
            .await
            .unwrap_err()
            .into();
        assert!(err.is_connection_error());
        assert!(!err.is_eof());
    }

    #[test]
    fn closed_stream_is_eof() {
        let err = get_failure(MongoError::from(io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(err.is_connection_error());
        assert!(err.is_eof());
    }

    #[test]
    fn refused_connection_is_connection_level_but_not_eof() {
        let err = get_failure(MongoError::from(io::Error::from(
            io::ErrorKind::ConnectionRefused,
        )));
        assert!(err.is_connection_error());
        assert!(!err.is_eof());
    }

    #[test]
    fn other_driver_failures_are_operation_errors() {
        let err = get_failure(MongoError::custom("duplicate key"));
        assert!(matches!(err, StorageError::Operation { .. }));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn document_shape_mismatch_is_a_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        struct Player {
            #[allow(dead_code)]
            hp: i32,
        }

        let source = mongodb::bson::deserialize_from_document::<Player>(mongodb::bson::doc! {"hp": "full"})
            .unwrap_err();
        let err = get_failure(MongoError::from(source));
        assert!(matches!(err, StorageError::Decode { .. }));
        assert!(!err.is_connection_error());
    }
}
