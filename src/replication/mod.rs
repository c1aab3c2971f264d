//! Change-data-capture replication: a leader-elected logical replication
//! client, pgoutput protocol parsing, transaction assembly, and batched
//! flushes into the columnar store.

pub mod client;
pub mod flush;
pub mod protocol;
pub mod service;
pub mod stream;

pub use client::{
    LogicalReplicationClient, ReplicationClientConfig, ReplicationError, ReplicationEvent,
};
pub use flush::{ConcurrentFlushScheduler, FlushConfig, FlushHandler};
pub use protocol::{
    parse_logical_message, parse_replication_message, pg_time_to_unix_ms, version_from_lsn,
    ColumnInfo, ColumnValue, LogicalMessage, Lsn, ProtocolError, RelationInfo,
    ReplicationMessage, PG_EPOCH_OFFSET_US,
};
pub use service::{
    ColumnarSink, InMemoryColumnarSink, InsertStrategy, ReplicatedRow, RowOp,
    RunsReplicationService,
};
pub use stream::{InMemoryReplicationConnection, ReplicationConnection};
