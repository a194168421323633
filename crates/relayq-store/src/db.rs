use crate::{Result, StoreError};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Column family names, one per data kind
const CF_KV: &str = "kv";
const CF_SETS: &str = "sets";
const CF_ZSETS: &str = "zsets";
const CF_HASHES: &str = "hashes";

/// Separator between a structure key and its member in a composite db key.
/// Store keys never contain NUL.
const SEP: u8 = 0x00;

/// Persisted form of a KV entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KvRecord {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

/// Persisted ordering metadata for an ordered-set member
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct ZMeta {
    pub score: i64,
    pub seq: u64,
}

/// Thin rocksdb wrapper: the durable mirror of the in-memory keyspace.
pub(crate) struct Db {
    db: DB,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = vec![
            ColumnFamilyDescriptor::new(CF_KV, Options::default()),
            ColumnFamilyDescriptor::new(CF_SETS, Options::default()),
            ColumnFamilyDescriptor::new(CF_ZSETS, Options::default()),
            ColumnFamilyDescriptor::new(CF_HASHES, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;
        Ok(Db { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| StoreError::Corrupt {
            key: name.to_string(),
            reason: "column family missing".to_string(),
        })
    }

    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)?;
        Ok(())
    }

    pub fn batch_put_kv(&self, batch: &mut WriteBatch, key: &str, record: &KvRecord) -> Result<()> {
        let value = serde_json::to_vec(record).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        batch.put_cf(self.cf(CF_KV)?, key.as_bytes(), value);
        Ok(())
    }

    pub fn batch_del_kv(&self, batch: &mut WriteBatch, key: &str) -> Result<()> {
        batch.delete_cf(self.cf(CF_KV)?, key.as_bytes());
        Ok(())
    }

    pub fn batch_put_set(
        &self,
        batch: &mut WriteBatch,
        key: &str,
        member: &str,
        seq: u64,
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_SETS)?, composite(key, member), seq.to_be_bytes());
        Ok(())
    }

    pub fn batch_del_set(&self, batch: &mut WriteBatch, key: &str, member: &str) -> Result<()> {
        batch.delete_cf(self.cf(CF_SETS)?, composite(key, member));
        Ok(())
    }

    pub fn batch_put_zset(
        &self,
        batch: &mut WriteBatch,
        key: &str,
        member: &str,
        meta: ZMeta,
    ) -> Result<()> {
        let value = serde_json::to_vec(&meta).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        batch.put_cf(self.cf(CF_ZSETS)?, composite(key, member), value);
        Ok(())
    }

    pub fn batch_del_zset(&self, batch: &mut WriteBatch, key: &str, member: &str) -> Result<()> {
        batch.delete_cf(self.cf(CF_ZSETS)?, composite(key, member));
        Ok(())
    }

    pub fn batch_put_hash(
        &self,
        batch: &mut WriteBatch,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_HASHES)?, composite(key, field), value.as_bytes());
        Ok(())
    }

    pub fn batch_del_hash(&self, batch: &mut WriteBatch, key: &str, field: &str) -> Result<()> {
        batch.delete_cf(self.cf(CF_HASHES)?, composite(key, field));
        Ok(())
    }

    pub fn scan_kv(&self) -> Result<Vec<(String, KvRecord)>> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_KV)?, IteratorMode::Start) {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let record: KvRecord =
                serde_json::from_slice(&value).map_err(|e| StoreError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            entries.push((key, record));
        }
        Ok(entries)
    }

    pub fn scan_sets(&self) -> Result<Vec<(String, String, u64)>> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_SETS)?, IteratorMode::Start) {
            let (raw, value) = item?;
            let (key, member) = split(&raw)?;
            let seq = u64::from_be_bytes(value.as_ref().try_into().map_err(|_| {
                StoreError::Corrupt {
                    key: key.clone(),
                    reason: "set member missing sequence".to_string(),
                }
            })?);
            entries.push((key, member, seq));
        }
        Ok(entries)
    }

    pub fn scan_zsets(&self) -> Result<Vec<(String, String, ZMeta)>> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_ZSETS)?, IteratorMode::Start) {
            let (raw, value) = item?;
            let (key, member) = split(&raw)?;
            let meta: ZMeta = serde_json::from_slice(&value).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            entries.push((key, member, meta));
        }
        Ok(entries)
    }

    pub fn scan_hashes(&self) -> Result<Vec<(String, String, String)>> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_HASHES)?, IteratorMode::Start) {
            let (raw, value) = item?;
            let (key, field) = split(&raw)?;
            entries.push((key, field, String::from_utf8_lossy(&value).into_owned()));
        }
        Ok(entries)
    }
}

fn composite(key: &str, member: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1 + member.len());
    out.extend_from_slice(key.as_bytes());
    out.push(SEP);
    out.extend_from_slice(member.as_bytes());
    out
}

fn split(raw: &[u8]) -> Result<(String, String)> {
    let pos = raw
        .iter()
        .position(|b| *b == SEP)
        .ok_or_else(|| StoreError::Corrupt {
            key: String::from_utf8_lossy(raw).into_owned(),
            reason: "composite key missing separator".to_string(),
        })?;
    Ok((
        String::from_utf8_lossy(&raw[..pos]).into_owned(),
        String::from_utf8_lossy(&raw[pos + 1..]).into_owned(),
    ))
}
