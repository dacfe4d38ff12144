//! In-process store with the same semantics as the Redis client.
//!
//! Every operation takes the single mutex once, so `batch` is atomic the
//! same way a Redis `MULTI` block is.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use super::{BatchOp, Store, StoreError};

#[derive(Debug)]
enum Entry {
    Str(String),
    Set(BTreeSet<String>),
    SortedSet(HashMap<String, i64>),
}

/// Mutex-guarded map implementing [`Store`]. Useful for tests and for
/// running the ingester without a Redis server.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(entries: &mut HashMap<String, Entry>, op: BatchOp) -> Result<(), StoreError> {
        match op {
            BatchOp::Set { key, value } => {
                entries.insert(key, Entry::Str(value));
                Ok(())
            }
            BatchOp::Zadd { key, score, member } => match entries
                .entry(key.clone())
                .or_insert_with(|| Entry::SortedSet(HashMap::new()))
            {
                Entry::SortedSet(members) => {
                    members.insert(member, score);
                    Ok(())
                }
                _ => Err(StoreError::WrongKind(key)),
            },
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongKind(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), Entry::Str(value.to_string()));
        Ok(())
    }

    async fn getset(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.insert(key.to_string(), Entry::Str(value.to_string())) {
            None => Ok(None),
            Some(Entry::Str(old)) => Ok(Some(old)),
            Some(_) => Err(StoreError::WrongKind(key.to_string())),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            _ => Err(StoreError::WrongKind(key.to_string())),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongKind(key.to_string())),
        }
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        Self::apply(
            &mut entries,
            BatchOp::Zadd {
                key: key.to_string(),
                score,
                member: member.to_string(),
            },
        )
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::SortedSet(members)) => {
                let mut in_range: Vec<(&i64, &String)> = members
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (score, member))
                    .collect();
                in_range.sort();
                Ok(in_range.into_iter().map(|(_, m)| m.clone()).collect())
            }
            Some(_) => Err(StoreError::WrongKind(key.to_string())),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let next = match entries.get(key) {
            None => 1,
            Some(Entry::Str(s)) => {
                s.parse::<i64>()
                    .map_err(|_| StoreError::WrongKind(key.to_string()))?
                    + 1
            }
            Some(_) => return Err(StoreError::WrongKind(key.to_string())),
        };
        entries.insert(key.to_string(), Entry::Str(next.to_string()));
        Ok(next)
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        for op in ops {
            Self::apply(&mut entries, op)?;
        }
        Ok(())
    }
}
