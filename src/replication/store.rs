use crate::cluster::{NodeId, PartitionId};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

/// Transfers move fixed-size chunks with an offset cursor, so an interrupted
/// copy can resume instead of restarting.
pub const TRANSFER_CHUNK_SIZE: usize = 256 * 1024;

/// Byte-level storage seam for partition data, keyed by the node holding the
/// copy. The coordination core moves and verifies bytes through this trait;
/// what the bytes mean belongs to the storage adapters above us.
pub trait PartitionStore: Send + Sync {
    /// Total length of a partition's data on `node`, or None if that node
    /// holds no copy.
    fn partition_len(&self, node: &NodeId, partition: &PartitionId) -> io::Result<Option<u64>>;

    /// Read up to `max_len` bytes at `offset`. Returns an empty buffer at or
    /// past the end; errors if the node holds no copy.
    fn read_chunk(
        &self,
        node: &NodeId,
        partition: &PartitionId,
        offset: u64,
        max_len: usize,
    ) -> io::Result<Bytes>;

    /// Write a chunk at `offset`, extending the partition. Offset 0 creates
    /// the copy; writing past the current end is an error (no holes).
    fn write_chunk(
        &self,
        node: &NodeId,
        partition: &PartitionId,
        offset: u64,
        data: &[u8],
    ) -> io::Result<()>;

    /// Replace the node's copy wholesale.
    fn write_all(&self, node: &NodeId, partition: &PartitionId, data: Bytes) -> io::Result<()>;

    fn remove(&self, node: &NodeId, partition: &PartitionId) -> io::Result<()>;

    /// Full contents of a node's copy, or None if absent.
    fn read_all(&self, node: &NodeId, partition: &PartitionId) -> io::Result<Option<Bytes>> {
        let len = match self.partition_len(node, partition)? {
            Some(len) => len,
            None => return Ok(None),
        };

        let mut buffer = Vec::with_capacity(len as usize);
        let mut offset = 0u64;
        while offset < len {
            let chunk = self.read_chunk(node, partition, offset, TRANSFER_CHUNK_SIZE)?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
        }

        Ok(Some(Bytes::from(buffer)))
    }
}

/// Chunked copy of one partition from `source`'s copy onto `target`.
/// Verifies the copied length against the source length before reporting
/// success.
pub fn copy_partition(
    store: &dyn PartitionStore,
    partition: &PartitionId,
    source: &NodeId,
    target: &NodeId,
) -> io::Result<u64> {
    let expected_len = store.partition_len(source, partition)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{:?} holds no copy of {:?}", source, partition),
        )
    })?;

    // Ensure zero-length partitions still materialize on the target.
    store.write_all(target, partition, Bytes::new())?;

    let mut offset = 0u64;
    loop {
        let chunk = store.read_chunk(source, partition, offset, TRANSFER_CHUNK_SIZE)?;
        if chunk.is_empty() {
            break;
        }
        store.write_chunk(target, partition, offset, &chunk)?;
        offset += chunk.len() as u64;
    }

    if offset != expected_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Copied {} bytes of {:?} but source reported {}",
                offset, partition, expected_len
            ),
        ));
    }

    Ok(offset)
}

/// In-process store, one buffer per (node, partition). The production twin
/// is a storage-adapter-backed implementation owned by the layers above.
pub struct InMemoryPartitionStore {
    data: Mutex<HashMap<(NodeId, PartitionId), Vec<u8>>>,
}

impl InMemoryPartitionStore {
    pub fn new() -> Self {
        InMemoryPartitionStore {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl PartitionStore for InMemoryPartitionStore {
    fn partition_len(&self, node: &NodeId, partition: &PartitionId) -> io::Result<Option<u64>> {
        let data = self.data.lock().expect("InMemoryPartitionStore mutex poison");
        Ok(data
            .get(&(node.clone(), partition.clone()))
            .map(|bytes| bytes.len() as u64))
    }

    fn read_chunk(
        &self,
        node: &NodeId,
        partition: &PartitionId,
        offset: u64,
        max_len: usize,
    ) -> io::Result<Bytes> {
        let data = self.data.lock().expect("InMemoryPartitionStore mutex poison");
        let bytes = data.get(&(node.clone(), partition.clone())).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{:?} holds no copy of {:?}", node, partition),
            )
        })?;

        let start = (offset as usize).min(bytes.len());
        let end = (start + max_len).min(bytes.len());
        Ok(Bytes::copy_from_slice(&bytes[start..end]))
    }

    fn write_chunk(
        &self,
        node: &NodeId,
        partition: &PartitionId,
        offset: u64,
        chunk: &[u8],
    ) -> io::Result<()> {
        let mut data = self.data.lock().expect("InMemoryPartitionStore mutex poison");
        let bytes = data.entry((node.clone(), partition.clone())).or_default();

        let offset = offset as usize;
        if offset > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Write at {} past end {} of {:?}", offset, bytes.len(), partition),
            ));
        }

        let overlap = (bytes.len() - offset).min(chunk.len());
        bytes[offset..offset + overlap].copy_from_slice(&chunk[..overlap]);
        bytes.extend_from_slice(&chunk[overlap..]);
        Ok(())
    }

    fn write_all(&self, node: &NodeId, partition: &PartitionId, new_data: Bytes) -> io::Result<()> {
        let mut data = self.data.lock().expect("InMemoryPartitionStore mutex poison");
        data.insert((node.clone(), partition.clone()), new_data.to_vec());
        Ok(())
    }

    fn remove(&self, node: &NodeId, partition: &PartitionId) -> io::Result<()> {
        let mut data = self.data.lock().expect("InMemoryPartitionStore mutex poison");
        data.remove(&(node.clone(), partition.clone()));
        Ok(())
    }
}
