//! tessera - distributed content-addressed object storage
//!
//! A cluster of peer nodes storing opaque blobs under 64-byte hashed
//! identifiers, with:
//! - replication across numbered groups, recovery reads across replicas
//! - plain, append, compare-and-swap and prepare/plain/commit writes
//! - bulk transfer, ordered range scans and range removal
//! - write notifications through a bucketed subscription registry
//! - an optional in-memory cache tier and string-tag inverted indexes

pub mod backend;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod index;
pub mod io_attr;
pub mod node;
pub mod notify;
pub mod routing;
pub mod session;
pub mod sort;
pub mod transport;
pub mod wire;

pub use backend::{Backend, FsBackend, IdRange, MemoryBackend, Record, RecordIter, RecordSummary};
pub use cache::CacheTier;
pub use error::{ErrorKind, Result, StoreError};
pub use id::{GroupId, ObjectId, ID_LEN};
pub use index::{FindIndexResult, FindMode, TagPayload};
pub use io_attr::{io_flags, IoAttr, IoAttrBuilder, Timestamp};
pub use node::{Node, NodeConfig};
pub use notify::{NotifyEvent, NotifyObserver, NotifyRegistry};
pub use routing::{NodeAddr, RouteEntry, RouteGraph};
pub use session::{
    BulkReadEntry, ErrorPolicy, LookupResult, NotifyStream, RangeEntry, RangeResult, ReadResult,
    Session, WriteEntry, WriteResult,
};
pub use transport::{FrameTransport, LoopbackMesh, TransactionPool};
pub use wire::{frame_flags, Command, Frame, FrameHeader};
