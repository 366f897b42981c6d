//! Client-side remote synchronization layer for a document-sync backend.
//!
//! The crate centres on [`remote::RemoteStore`], the coordinator that mediates
//! between a local mutation log / query cache and the backend over two
//! long-lived duplex streams: a *watch* stream for server-pushed target
//! changes and a *write* stream for client-originated mutation batches. Around
//! it sit the listen-target registry, the bounded write pipeline, the
//! watch-change aggregator that folds stream frames into consistent
//! [`remote::RemoteEvent`]s, and the online-state tracker that derives an
//! observable connectivity signal from stream health.
//!
//! Embedders supply three collaborators: a [`local::LocalStore`] holding the
//! durable mutation queue and resume metadata, a [`remote::RemoteSyncer`]
//! receiving remote events and write results, and a transport implementing
//! [`remote::Connection`]. Everything runs on one cooperative worker; see the
//! [`remote::RemoteStore`] docs for the threading contract.

pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;

pub use error::{SyncError, SyncErrorCode, SyncResult};
pub use local::{LocalStore, MemoryLocalStore};
pub use model::{BatchId, Document, DocumentKey, SnapshotVersion, TargetId, Timestamp};
pub use remote::{
    Connection, Datastore, Mutation, MutationBatch, MutationBatchResult, OnlineState, Query,
    QueryData, QueryPurpose, RemoteEvent, RemoteStore, RemoteSyncer, Transaction,
};
