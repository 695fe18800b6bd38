// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Utilities module

use std::collections::{HashMap, HashSet};
use std::env;
use std::future::Future;
use std::hash::Hash;

use tokio::runtime::Runtime;

/// Extension trait to drive a future to completion on a freshly created
/// runtime.
///
/// The daemon is thread + channel structured; the only async surface is the
/// Docker client, which is always consumed to completion at the call site.
pub(crate) trait FutureExt: Future {
    /// Run the future to completion, blocking the current thread.
    fn sync(self) -> Self::Output;
}

impl<F: Future> FutureExt for F {
    fn sync(self) -> Self::Output {
        Runtime::new()
            .expect("failed to create tokio runtime")
            .block_on(self)
    }
}

/// Identity of this host within the shared IP directory.
///
/// `NODE_ID` takes precedence so operators can pin identities; the hostname
/// is the default.
pub fn node_id() -> String {
    if let Ok(id) = env::var("NODE_ID") {
        if !id.is_empty() {
            return id;
        }
    }
    hostname().unwrap_or_else(|| "unknown-node".to_owned())
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

/// Map from a key to a set of values.
///
/// `add` and `remove` report whether the key itself appeared or disappeared,
/// which is what gates kernel-set creation and deletion.
#[derive(Debug, Clone, Default)]
pub(crate) struct MultiMap<K, V> {
    store: HashMap<K, HashSet<V>>,
}

impl<K, V> MultiMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    pub fn new() -> MultiMap<K, V> {
        MultiMap {
            store: HashMap::new(),
        }
    }

    /// Associate `value` with `key`, returning true if the key was not
    /// previously present.
    pub fn add(&mut self, key: K, value: V) -> bool {
        let created = !self.store.contains_key(&key);
        self.store.entry(key).or_insert_with(HashSet::new).insert(value);
        created
    }

    /// Remove one association.
    ///
    /// Returns true iff the key was present and has no remaining values
    /// after the removal. An absent key returns false.
    pub fn remove(&mut self, key: &K, value: &V) -> bool {
        let emptied = match self.store.get_mut(key) {
            Some(values) => {
                values.remove(value);
                values.is_empty()
            }
            None => return false,
        };
        if emptied {
            self.store.remove(key);
        }
        emptied
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.store.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&HashSet<V>> {
        self.store.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.store.keys()
    }
}

/// Bi-directional multimap, i.e. a `MultiMap` that can also be queried by
/// value.
#[derive(Debug, Clone, Default)]
pub(crate) struct BiMultiMap<K, V> {
    left: MultiMap<K, V>,
    right: MultiMap<V, K>,
}

impl<K, V> BiMultiMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    pub fn new() -> BiMultiMap<K, V> {
        BiMultiMap {
            left: MultiMap::new(),
            right: MultiMap::new(),
        }
    }

    /// Returns true if the key was not previously present.
    pub fn add(&mut self, key: K, value: V) -> bool {
        self.right.add(value.clone(), key.clone());
        self.left.add(key, value)
    }

    /// Returns true iff the key was present and is now empty.
    pub fn remove(&mut self, key: &K, value: &V) -> bool {
        self.right.remove(value, key);
        self.left.remove(key, value)
    }

    pub fn has_key(&self, key: &K) -> bool {
        self.left.contains_key(key)
    }

    pub fn has_value(&self, value: &V) -> bool {
        self.right.contains_key(value)
    }

    pub fn get_by_key(&self, key: &K) -> Option<&HashSet<V>> {
        self.left.get(key)
    }

    pub fn get_by_value(&self, value: &V) -> Option<&HashSet<K>> {
        self.right.get(value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.left.keys()
    }
}
