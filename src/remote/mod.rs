pub mod aggregator;
pub mod connection;
pub mod datastore;
pub mod listen_registry;
pub mod mutation;
pub mod online_state;
pub mod query_data;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod transaction;
pub mod watch_change;
pub mod write_pipeline;

pub use aggregator::{TargetMetadataProvider, WatchChangeAggregator};
pub use connection::{Connection, StreamKind, UnaryMethod, WireStream};
pub use datastore::Datastore;
pub use listen_registry::ListenTargetRegistry;
pub use mutation::{
    Mutation, MutationBatch, MutationBatchResult, MutationResult, Precondition,
};
pub use online_state::{OnlineState, OnlineStateTracker};
pub use query_data::{Query, QueryData, QueryPurpose};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::{DocumentLookup, WireSerializer, WriteResponse};
pub use stream::{
    StreamStatus, WatchStream, WatchStreamEvents, WriteStream, WriteStreamEvents,
};
pub use transaction::Transaction;
pub use watch_change::{
    DocumentChange, ExistenceFilter, TargetChangeState, WatchChange, WatchTargetChange,
};
pub use write_pipeline::{WritePipeline, MAX_PENDING_WRITES};
