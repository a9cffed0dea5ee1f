use std::fmt::Debug;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::registry::expiring_registry::ExpiringRegistry;

/// A registry entry that can be written to a snapshot. Records are fixed size per type, which
///  allows the reader to check the overall length before parsing.
pub trait SnapshotRecord: Sized {
    const SERIALIZED_LEN: usize;

    fn ser(&self, buf: &mut impl BufMut);
    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self>;
}

const SNAPSHOT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const SNAPSHOT_FORMAT_VERSION: u8 = 1;

/// Encodes records in the snapshot format:
///
/// ```ascii
/// 0: format version (u8)
/// 1: record count (i32)
/// 5: record count * fixed-size record
/// *: CRC-32 over everything before it (u32)
/// ```
pub fn encode_snapshot<'a, R: SnapshotRecord + 'a>(records: impl IntoIterator<Item=&'a R>) -> anyhow::Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    buf.put_u8(SNAPSHOT_FORMAT_VERSION);
    buf.put_i32(0); // placeholder

    let mut count = 0usize;
    for record in records {
        record.ser(&mut buf);
        count += 1;
    }
    let count: i32 = count.try_into()
        .map_err(|_| anyhow!("too many records for a snapshot: {}", count))?;
    buf[1..5].copy_from_slice(&count.to_be_bytes());

    let checksum = SNAPSHOT_CRC.checksum(&buf);
    buf.put_u32(checksum);
    Ok(buf.to_vec())
}

pub fn decode_snapshot<R: SnapshotRecord>(raw: &[u8]) -> anyhow::Result<Vec<R>> {
    if raw.len() < 1 + 4 + 4 {
        bail!("snapshot of {} bytes is too short", raw.len());
    }

    let (content, mut checksum) = raw.split_at(raw.len() - 4);
    let checksum = checksum.get_u32();
    if checksum != SNAPSHOT_CRC.checksum(content) {
        bail!("snapshot checksum mismatch");
    }

    let mut buf = content;
    let version = buf.get_u8();
    if version != SNAPSHOT_FORMAT_VERSION {
        bail!("unsupported snapshot format version {}", version);
    }

    let count = buf.get_i32();
    let count: usize = count.try_into()
        .map_err(|_| anyhow!("negative record count {}", count))?;
    if buf.remaining() != count * R::SERIALIZED_LEN {
        bail!("snapshot with {} records has {} bytes of record data, expected {}", count, buf.remaining(), count * R::SERIALIZED_LEN);
    }

    let mut result = Vec::with_capacity(count);
    for _ in 0..count {
        result.push(R::deser(&mut buf)?);
    }
    Ok(result)
}

/// Shared store for registry snapshots, keyed by registry name. Each write fully replaces the
///  previous snapshot for that name.
///
/// NB: Readers and writers are not coordinated - a reader can see a snapshot that a different
///  process is about to replace. Readers must tolerate data that is up to one publishing interval
///  stale.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn write(&self, name: &str, data: Vec<u8>) -> anyhow::Result<()>;
    async fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// One file per registry in a shared directory
pub struct FileSnapshotStore {
    dir: PathBuf,
}
impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> FileSnapshotStore {
        FileSnapshotStore {
            dir: dir.into(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.snapshot", name))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn write(&self, name: &str, data: Vec<u8>) -> anyhow::Result<()> {
        let path = self.path(name);
        trace!("writing {} bytes of snapshot to {:?}", data.len(), path);
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<FxHashMap<String, Vec<u8>>>,
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn write(&self, name: &str, data: Vec<u8>) -> anyhow::Result<()> {
        self.snapshots.lock()
            .map_err(|_| anyhow!("poisoned lock"))?
            .insert(name.to_string(), data);
        Ok(())
    }

    async fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let snapshots = self.snapshots.lock()
            .map_err(|_| anyhow!("poisoned lock"))?;
        Ok(snapshots.get(name).cloned())
    }
}

/// An entry stored in a registry that can be reconstructed from its value alone, i.e. the key
///  is part of the serialized value
pub trait Keyed {
    type Key;
    fn key(&self) -> Self::Key;
}

impl <K: Hash + Eq + Clone + Debug, V: SnapshotRecord + Keyed<Key=K> + Clone> ExpiringRegistry<K, V> {
    pub async fn write_snapshot(&self, store: &dyn SnapshotStore) -> anyhow::Result<()> {
        let values = self.entries().into_iter()
            .map(|(_, v)| v)
            .collect::<Vec<_>>();
        let data = encode_snapshot(values.iter())?;
        store.write(self.name(), data).await
    }

    /// Replaces the registry's content with the most recent snapshot in the store, returning the
    ///  number of loaded records. A missing snapshot leaves the registry unchanged.
    pub async fn load_snapshot(&self, store: &dyn SnapshotStore, now: Instant) -> anyhow::Result<usize> {
        let Some(data) = store.read(self.name()).await? else {
            debug!(registry = self.name(), "no snapshot available");
            return Ok(0);
        };

        let values = decode_snapshot::<V>(&data)?;
        let num_loaded = values.len();
        self.replace_all(values.into_iter().map(|v| (v.key(), v)), now);
        Ok(num_loaded)
    }
}
