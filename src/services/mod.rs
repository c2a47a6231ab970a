/// Named-group job queue.
pub mod dispatcher;
/// MongoDB commands issued through a dispatcher group.
pub mod queued_mongo;
