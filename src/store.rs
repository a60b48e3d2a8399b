//! Config store: JSON tables under `store_root`, addressed by key paths.
//!
//! `set("scan", &["repos", "a"], v)` writes `{"repos": {"a": v}}` into
//! `<store_root>/scan.json`, creating intermediate objects. Every write goes
//! to an in-memory cache and then to disk; there are no transactions, the
//! last write wins.
//!
//! Only the parent writes. [`StoreBus`] forwards a child's writes over
//! `STORE_CHANNEL` and reads the files directly.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::channel::{ChannelRouter, HandlerTable};
use crate::config::ShellConfig;
use crate::error::{Result, ShellError};
use crate::protocol::ChannelMessage;

pub const STORE_CHANNEL: &str = "STORE_CHANNEL";

const TABLE_EXTENSION: &str = "json";

/// Parent-side store engine
#[derive(Debug)]
pub struct ConfigStore {
    root: PathBuf,
    cache: Mutex<HashMap<String, Value>>,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ConfigStore {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::new(config.store_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, table: &str) -> Result<PathBuf> {
        if table.is_empty() || table.contains("..") || Path::new(table).is_absolute() {
            return Err(ShellError::Store(format!("invalid table name '{}'", table)));
        }
        let mut path = self.root.join(table);
        if path.extension().is_none() {
            path.set_extension(TABLE_EXTENSION);
        }
        Ok(path)
    }

    /// Value at `path` (the whole table for an empty path)
    pub fn get(&self, table: &str, path: &[&str]) -> Result<Option<Value>> {
        let data = self.read_table(table)?;
        Ok(lookup(&data, path).cloned())
    }

    /// Read straight from disk, bypassing the cache
    pub fn get_fresh(&self, table: &str, path: &[&str]) -> Result<Option<Value>> {
        let data = self.read_disk(table)?;
        Ok(lookup(&data, path).cloned())
    }

    /// Write without checking whether the key exists
    pub fn set(&self, table: &str, path: &[&str], value: Value) -> Result<()> {
        self.write_key(table, path, value, |_| Ok(()))
    }

    /// Write a key that must not exist yet
    pub fn add(&self, table: &str, path: &[&str], value: Value) -> Result<()> {
        self.write_key(table, path, value, |exists| {
            if exists {
                Err("key already exists, use update".to_string())
            } else {
                Ok(())
            }
        })
    }

    /// Write a key that must already exist
    pub fn update(&self, table: &str, path: &[&str], value: Value) -> Result<()> {
        self.write_key(table, path, value, |exists| {
            if exists {
                Ok(())
            } else {
                Err("key does not exist, use add".to_string())
            }
        })
    }

    /// Delete a key. Missing keys are not an error.
    pub fn remove(&self, table: &str, path: &[&str]) -> Result<()> {
        let (key, parents) = split_key(path)?;
        let mut data = self.read_table(table)?;
        let mut target = &mut data;
        for segment in parents {
            match target.get_mut(*segment) {
                Some(next) => target = next,
                None => return Ok(()),
            }
        }
        if let Some(object) = target.as_object_mut() {
            object.remove(key);
        }
        self.save_table(table, data)
    }

    /// Replace a whole table
    pub fn cover(&self, table: &str, data: Value) -> Result<()> {
        self.save_table(table, data)
    }

    /// Empty one table
    pub fn reset(&self, table: &str) -> Result<()> {
        self.save_table(table, Value::Object(Map::new()))
    }

    /// Delete every table
    pub fn clear(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| ShellError::io(&self.root, e))?;
        }
        cache.clear();
        info!(root = %self.root.display(), "Store cleared");
        Ok(())
    }

    /// Operations children may invoke on `STORE_CHANNEL`.
    ///
    /// argv shapes: `[table, ...path, value]` for set/add/update,
    /// `[table, ...path]` for remove, `[table, data]` for cover,
    /// `[table]` for reset, `[]` for clear.
    pub fn handler_table(self: &Arc<Self>) -> HandlerTable {
        let (set, add, update) = (Arc::clone(self), Arc::clone(self), Arc::clone(self));
        let (remove, cover, reset, clear) = (
            Arc::clone(self),
            Arc::clone(self),
            Arc::clone(self),
            Arc::clone(self),
        );
        HandlerTable::new(STORE_CHANNEL)
            .method("set", move |msg: &ChannelMessage| {
                let (table, path, value) = keyed_args(msg)?;
                set.set(table, &path, value)
            })
            .method("add", move |msg: &ChannelMessage| {
                let (table, path, value) = keyed_args(msg)?;
                add.add(table, &path, value)
            })
            .method("update", move |msg: &ChannelMessage| {
                let (table, path, value) = keyed_args(msg)?;
                update.update(table, &path, value)
            })
            .method("remove", move |msg: &ChannelMessage| {
                let table = table_arg(msg)?;
                let path = string_args(msg, &msg.argv[1..])?;
                remove.remove(table, &path)
            })
            .method("cover", move |msg: &ChannelMessage| {
                let table = table_arg(msg)?;
                let data = msg.argv.get(1).cloned().unwrap_or(Value::Null);
                cover.cover(table, data)
            })
            .method("reset", move |msg: &ChannelMessage| reset.reset(table_arg(msg)?))
            .method("clear", move |_: &ChannelMessage| clear.clear())
    }

    fn write_key<F>(&self, table: &str, path: &[&str], value: Value, check: F) -> Result<()>
    where
        F: FnOnce(bool) -> std::result::Result<(), String>,
    {
        let (key, parents) = split_key(path)?;
        let mut data = self.read_table(table)?;
        let parent = object_at(&mut data, parents)?;
        check(parent.contains_key(key))
            .map_err(|reason| ShellError::Store(format!("{}: {}", path.join("."), reason)))?;
        parent.insert(key.to_string(), value);
        self.save_table(table, data)
    }

    fn read_table(&self, table: &str) -> Result<Value> {
        if let Some(cached) = self.cache.lock().get(table) {
            return Ok(cached.clone());
        }
        self.read_disk(table)
    }

    fn read_disk(&self, table: &str) -> Result<Value> {
        let path = self.table_path(table)?;
        match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Value::Object(Map::new())),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                ShellError::Store(format!("table {} is not valid JSON: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
            Err(e) => Err(ShellError::io(path, e)),
        }
    }

    /// Disk first; the cache only ever holds what was written
    fn save_table(&self, table: &str, data: Value) -> Result<()> {
        let path = self.table_path(table)?;
        let json = serde_json::to_string_pretty(&data)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ShellError::io(parent, e))?;
        }
        fs::write(&path, json).map_err(|e| ShellError::io(&path, e))?;
        self.cache.lock().insert(table.to_string(), data);
        debug!(table = %table, path = %path.display(), "Store table saved");
        Ok(())
    }
}

fn split_key<'a, 'p>(path: &'p [&'a str]) -> Result<(&'a str, &'p [&'a str])> {
    match path.split_last() {
        Some((key, parents)) => Ok((*key, parents)),
        None => Err(ShellError::Store("a key path needs at least one key".to_string())),
    }
}

fn lookup<'v>(data: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(data, |value, segment| value.get(*segment))
}

/// Walk to the object at `path`, creating missing levels
fn object_at<'v>(data: &'v mut Value, path: &[&str]) -> Result<&'v mut Map<String, Value>> {
    let mut current = data;
    for segment in path {
        let object = current.as_object_mut().ok_or_else(|| {
            ShellError::Store(format!("cannot descend into '{}': not an object", segment))
        })?;
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current
        .as_object_mut()
        .ok_or_else(|| ShellError::Store(format!("'{}' is not an object", path.join("."))))
}

fn table_arg(msg: &ChannelMessage) -> Result<&str> {
    msg.arg_str(0).ok_or_else(|| ShellError::InvalidArgument {
        function: msg.function.clone(),
        reason: "first argument must be the table name".to_string(),
    })
}

fn string_args<'m>(msg: &ChannelMessage, values: &'m [Value]) -> Result<Vec<&'m str>> {
    values
        .iter()
        .map(|v| {
            v.as_str().ok_or_else(|| ShellError::InvalidArgument {
                function: msg.function.clone(),
                reason: format!("key path segments must be strings, got {}", v),
            })
        })
        .collect()
}

fn keyed_args(msg: &ChannelMessage) -> Result<(&str, Vec<&str>, Value)> {
    let table = table_arg(msg)?;
    if msg.argv.len() < 3 {
        return Err(ShellError::InvalidArgument {
            function: msg.function.clone(),
            reason: "expected table, key path and value".to_string(),
        });
    }
    let last = msg.argv.len() - 1;
    let path = string_args(msg, &msg.argv[1..last])?;
    Ok((table, path, msg.argv[last].clone()))
}

/// Role-aware store access: the parent executes, a child forwards writes
#[derive(Debug)]
pub struct StoreBus {
    router: Arc<ChannelRouter>,
    store: Arc<ConfigStore>,
}

impl StoreBus {
    pub fn new(router: Arc<ChannelRouter>, store: Arc<ConfigStore>) -> Self {
        StoreBus { router, store }
    }

    pub fn register_channel(&self) {
        self.router.register(self.store.handler_table());
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn get(&self, table: &str, path: &[&str]) -> Result<Option<Value>> {
        if self.router.is_parent() {
            self.store.get(table, path)
        } else {
            self.store.get_fresh(table, path)
        }
    }

    pub fn set(&self, table: &str, path: &[&str], value: Value) -> Result<()> {
        self.keyed("set", table, path, value)
    }

    pub fn add(&self, table: &str, path: &[&str], value: Value) -> Result<()> {
        self.keyed("add", table, path, value)
    }

    pub fn update(&self, table: &str, path: &[&str], value: Value) -> Result<()> {
        self.keyed("update", table, path, value)
    }

    pub fn remove(&self, table: &str, path: &[&str]) -> Result<()> {
        if self.router.is_parent() {
            return self.store.remove(table, path);
        }
        let mut argv = vec![Value::from(table)];
        argv.extend(path.iter().map(|s| Value::from(*s)));
        self.forward("remove", argv)
    }

    pub fn cover(&self, table: &str, data: Value) -> Result<()> {
        if self.router.is_parent() {
            return self.store.cover(table, data);
        }
        self.forward("cover", vec![Value::from(table), data])
    }

    pub fn reset(&self, table: &str) -> Result<()> {
        if self.router.is_parent() {
            return self.store.reset(table);
        }
        self.forward("reset", vec![Value::from(table)])
    }

    pub fn clear(&self) -> Result<()> {
        if self.router.is_parent() {
            return self.store.clear();
        }
        self.forward("clear", Vec::new())
    }

    fn keyed(&self, function: &str, table: &str, path: &[&str], value: Value) -> Result<()> {
        if self.router.is_parent() {
            return match function {
                "add" => self.store.add(table, path, value),
                "update" => self.store.update(table, path, value),
                _ => self.store.set(table, path, value),
            };
        }
        split_key(path)?;
        let mut argv = vec![Value::from(table)];
        argv.extend(path.iter().map(|s| Value::from(*s)));
        argv.push(value);
        self.forward(function, argv)
    }

    /// Fire-and-forget: a child learns about parent-side failures only from the log
    fn forward(&self, function: &str, argv: Vec<Value>) -> Result<()> {
        let report = self
            .router
            .call(STORE_CHANNEL, ChannelMessage::new(function, argv));
        if report.forwarded {
            Ok(())
        } else {
            Err(ShellError::Upstream(format!(
                "store {} could not be sent to the shell",
                function
            )))
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
