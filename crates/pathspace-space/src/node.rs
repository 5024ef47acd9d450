//! Node value queues and their wire-shippable snapshot form.
//!
//! A [`NodeData`] is the value queue of one path: a FIFO of typed, framed
//! blobs held in a [`SlidingBuffer`] alongside the per-value type names.
//! Snapshots of a queue travel inside read responses and notifications;
//! [`NodeData::deserialize_snapshot`] restores a lazily-decodable container
//! on the far side.

use std::collections::VecDeque;

use pathspace_types::{Error, Expected};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::sliding::SlidingBuffer;
use crate::type_name_of;

/// One serialized value: its registry type name plus the framed blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRecord {
    /// Stable registry name of the value's type.
    pub type_name: String,
    /// Header-framed codec bytes.
    pub bytes: Vec<u8>,
}

/// Serialized representation of a snapshot.
#[derive(Serialize, Deserialize)]
struct SnapshotRepr {
    types: Vec<String>,
    data: Vec<u8>,
}

/// The value queue of a single node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeData {
    types: VecDeque<String>,
    buffer: SlidingBuffer,
}

impl NodeData {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when no values are queued.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Type name of the front value.
    pub fn front_type_name(&self) -> Option<&str> {
        self.types.front().map(String::as_str)
    }

    /// Append an already-framed record to the back of the queue.
    pub fn push_record(&mut self, record: ValueRecord) {
        self.buffer.append(&record.bytes);
        self.types.push_back(record.type_name);
    }

    /// Encode a value and append it to the back of the queue.
    pub fn push_value<T: Serialize + 'static>(&mut self, value: &T) -> Expected<()> {
        codec::serialize_into(value, &mut self.buffer)?;
        self.types.push_back(type_name_of::<T>().to_string());
        Ok(())
    }

    /// Copy the framed bytes of the front value without consuming it.
    pub fn front_serialized_bytes(&self) -> Expected<Vec<u8>> {
        if self.is_empty() {
            return Err(Error::NoObjectFound("node has no values".into()));
        }
        let framed = codec::framed_len(self.buffer.data())?;
        Ok(self.buffer.data()[..framed].to_vec())
    }

    /// Copy the front record without consuming it.
    pub fn front_record(&self) -> Expected<ValueRecord> {
        let bytes = self.front_serialized_bytes()?;
        let type_name = self
            .front_type_name()
            .ok_or_else(|| Error::NoObjectFound("node has no values".into()))?
            .to_string();
        Ok(ValueRecord { type_name, bytes })
    }

    /// Pop the front record off the queue.
    pub fn pop_front_record(&mut self) -> Expected<ValueRecord> {
        let record = self.front_record()?;
        self.buffer.advance(record.bytes.len());
        self.types.pop_front();
        Ok(record)
    }

    /// Decode the front value, checking the stored type name first.
    pub fn deserialize_front<T: DeserializeOwned + 'static>(&self) -> Expected<T> {
        let expected = type_name_of::<T>();
        match self.front_type_name() {
            None => Err(Error::NoObjectFound("node has no values".into())),
            Some(stored) if stored != expected => Err(Error::InvalidType(format!(
                "stored type {stored} does not match requested {expected}"
            ))),
            Some(_) => codec::deserialize_value(self.buffer.data()),
        }
    }

    /// Encode the whole queue as a snapshot blob.
    pub fn serialize_snapshot(&self) -> Expected<Vec<u8>> {
        let repr = SnapshotRepr {
            types: self.types.iter().cloned().collect(),
            data: self.buffer.data().to_vec(),
        };
        codec::serialize_value(&repr)
    }

    /// Restore a queue from a snapshot blob.
    pub fn deserialize_snapshot(bytes: &[u8]) -> Expected<Self> {
        let repr: SnapshotRepr = codec::deserialize_value(bytes)
            .map_err(|e| Error::InvalidType(format!("unable to decode snapshot: {e}")))?;
        let mut buffer = SlidingBuffer::new();
        buffer.assign_raw(repr.data, 0);
        Ok(Self {
            types: repr.types.into(),
            buffer,
        })
    }
}
