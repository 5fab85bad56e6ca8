// heed (LMDB) backed KV store, values are JSON

use anyhow::{Context, Result};
use heed::{
    Database, Env, EnvOpenOptions,
    types::{Bytes, Str},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt, marker::PhantomData, path::Path};
use tokio::fs::create_dir_all;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    MachineRequest,
    MachineState,
    MachineStatus,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::MachineRequest => f.write_str("machine-request"),
            Collection::MachineState => f.write_str("machine-state"),
            Collection::MachineStatus => f.write_str("machine-status"),
        }
    }
}

/// Full key of one value, typed by what is stored under it.
pub struct Key<D>(String, PhantomData<D>)
where
    D: Serialize + DeserializeOwned;

/// Prefix covering every key of a collection.
pub struct PartialKey<D>(String, PhantomData<D>)
where
    D: Serialize + DeserializeOwned;

impl<D> Key<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn new(collection: Collection, key: impl AsRef<str>) -> Self {
        Self(format!("{collection}/{}", key.as_ref()), PhantomData)
    }
}

impl<D> PartialKey<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn new(collection: Collection) -> Self {
        Self(format!("{collection}/"), PhantomData)
    }

    /// Strips the collection prefix off a full key.
    pub fn suffix<'a>(&self, full_key: &'a str) -> &'a str {
        full_key.strip_prefix(&self.0).unwrap_or(full_key)
    }
}

impl<D> From<&Key<D>> for Key<D>
where
    D: Serialize + DeserializeOwned,
{
    fn from(key: &Key<D>) -> Self {
        Key(key.0.clone(), PhantomData)
    }
}

impl<D> From<&PartialKey<D>> for PartialKey<D>
where
    D: Serialize + DeserializeOwned,
{
    fn from(key: &PartialKey<D>) -> Self {
        PartialKey(key.0.clone(), PhantomData)
    }
}

pub struct Store {
    db: Database<Str, Bytes>,
    env: Env,
}

impl Store {
    pub async fn new(dir_path: impl AsRef<Path>) -> Result<Self> {
        let dir_path = dir_path.as_ref();
        if !dir_path.exists() {
            create_dir_all(dir_path).await?;
        }

        let env = unsafe { EnvOpenOptions::new().open(dir_path)? };

        let db = {
            let mut wtxn = env.write_txn()?;
            let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None)?;
            wtxn.commit()?;

            db
        };

        Ok(Self { db, env })
    }

    pub async fn get<D: Serialize + DeserializeOwned>(
        &self,
        key: impl Into<Key<D>>,
    ) -> Result<Option<D>> {
        let key: Key<D> = key.into();
        let rtxn = self.env.read_txn()?;
        let Some(value) = self.db.get(&rtxn, &key.0)? else {
            return Ok(None);
        };

        let value = serde_json::from_slice(value)
            .with_context(|| format!("corrupt value under {}", key.0))?;
        Ok(Some(value))
    }

    pub async fn list_keys<D: Serialize + DeserializeOwned>(
        &self,
        key: impl Into<PartialKey<D>>,
    ) -> Result<Vec<String>> {
        let key: PartialKey<D> = key.into();
        let rtxn = self.env.read_txn()?;
        let iter = self.db.prefix_iter(&rtxn, &key.0)?;

        let mut keys = Vec::new();
        for entry in iter {
            let (k, _) = entry?;
            keys.push(key.suffix(k).to_string());
        }
        Ok(keys)
    }

    pub async fn put<D: Serialize + DeserializeOwned>(
        &self,
        key: impl Into<Key<D>>,
        value: &D,
    ) -> Result<()> {
        let key: Key<D> = key.into();
        let value = serde_json::to_string(value)?.into_bytes();

        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &key.0, &value)?;
        wtxn.commit()?;

        Ok(())
    }

    pub async fn delete<D: Serialize + DeserializeOwned>(
        &self,
        key: impl Into<Key<D>>,
    ) -> Result<()> {
        let key: Key<D> = key.into();
        let mut wtxn = self.env.write_txn()?;
        self.db.delete(&mut wtxn, &key.0)?;
        wtxn.commit()?;

        Ok(())
    }
}
