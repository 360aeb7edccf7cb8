//! Binlog Module
//!
//! Everything needed to pull binlog events out of a server or local files:
//! packet framing, the replica handshake, event framing/checksums and
//! row decoding.

mod client;
pub mod event;
mod file;
pub mod packet;
mod position;
pub mod rows;

#[cfg(test)]
pub(crate) mod testutil;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use client::ReplicationStream;
pub use event::{BinlogEvent, ChecksumAlg, EventDecoder, EventFramer, EventHeader, RawEvent};
pub use file::BinlogFileReader;
pub use position::{compare_file_names, Position};
pub use rows::{ColumnValue, RowsEvent, RowsKind, TableMapEvent};

/// A pull-based source of framed binlog events
///
/// `Ok(None)` is the end of the stream. `Err(Error::Timeout)` means no
/// event arrived before `deadline`; `None` waits indefinitely.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self, deadline: Option<Duration>) -> Result<Option<RawEvent>>;
}

#[async_trait]
impl<S: EventSource + ?Sized> EventSource for Box<S> {
    async fn next_event(&mut self, deadline: Option<Duration>) -> Result<Option<RawEvent>> {
        (**self).next_event(deadline).await
    }
}
