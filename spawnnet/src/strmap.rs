/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An ordered string-to-string map with a stable pack format.
//!
//! Insertion order is preserved and defines the pack order; setting an
//! existing key overwrites its value in place. The packed layout is a
//! `u64` entry count followed by, per entry, a length-prefixed
//! NUL-terminated key and a length-prefixed NUL-terminated value. All
//! integers are big-endian; lengths include the NUL. The format is
//! stable: `unpack(pack(m)) == m` element for element.

use std::fmt;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use indexmap::IndexMap;

/// Errors produced when decoding a packed map.
#[derive(Debug, thiserror::Error)]
pub enum StrmapError {
    /// The buffer ended before the advertised entries did.
    #[error("packed strmap truncated")]
    Truncated,

    /// A length prefix was zero or the field was not NUL-terminated.
    #[error("malformed strmap entry")]
    Malformed,

    /// A key or value was not valid UTF-8.
    #[error("strmap entry is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// An ordered collection of unique string keys mapped to string values.
#[derive(Clone, Debug, Default)]
pub struct Strmap {
    entries: IndexMap<String, String>,
}

impl Strmap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set `key` to `value`. An existing key is overwritten and keeps
    /// its position; a new key is appended.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Look up the value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Remove `key`, preserving the order of the remaining entries.
    /// Returns the removed value, if any.
    pub fn unset(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Insert every entry of `other` in its order, overwriting values
    /// for keys already present.
    pub fn merge(&mut self, other: &Strmap) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    /// The number of bytes [`Self::pack`] will produce.
    pub fn pack_size(&self) -> usize {
        let mut size = 8;
        for (k, v) in self.iter() {
            size += 8 + k.len() + 1;
            size += 8 + v.len() + 1;
        }
        size
    }

    /// Pack the map into its stable wire form.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.pack_size());
        buf.put_u64(self.len() as u64);
        for (k, v) in self.iter() {
            for field in [k, v] {
                buf.put_u64(field.len() as u64 + 1);
                buf.put_slice(field.as_bytes());
                buf.put_u8(0);
            }
        }
        buf.freeze()
    }

    /// Decode a packed map produced by [`Self::pack`].
    pub fn unpack(mut buf: &[u8]) -> Result<Self, StrmapError> {
        if buf.remaining() < 8 {
            return Err(StrmapError::Truncated);
        }
        let count = buf.get_u64();
        let mut map = Self::new();
        for _ in 0..count {
            let key = take_field(&mut buf)?;
            let value = take_field(&mut buf)?;
            map.set(key, value);
        }
        Ok(map)
    }
}

fn take_field<'a>(buf: &mut &'a [u8]) -> Result<&'a str, StrmapError> {
    if buf.remaining() < 8 {
        return Err(StrmapError::Truncated);
    }
    let len = buf.get_u64() as usize;
    if len == 0 {
        return Err(StrmapError::Malformed);
    }
    if buf.remaining() < len {
        return Err(StrmapError::Truncated);
    }
    let slice: &'a [u8] = *buf;
    let (field, rest) = slice.split_at(len);
    *buf = rest;
    // The length includes the terminating NUL, which stays off the wire
    // string itself.
    match field.split_last() {
        Some((0, bytes)) => Ok(std::str::from_utf8(bytes)?),
        _ => Err(StrmapError::Malformed),
    }
}

// Equality is ordered: two maps with the same entries in a different
// order are not equal, matching the pack-order contract.
impl PartialEq for Strmap {
    fn eq(&self, other: &Self) -> bool {
        self.entries.iter().eq(other.entries.iter())
    }
}

impl Eq for Strmap {}

impl fmt::Display for Strmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in self.iter() {
            writeln!(f, "  {}={}", k, v)?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Strmap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}
