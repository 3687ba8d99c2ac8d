// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to property list trees.
//!
//! The XML codec itself is the `plist` crate; these helpers are the thin
//! typed facade the rest of the crate goes through. Every wrong-type access
//! is a schema error carrying the caller's context string, never a panic.

use plist::{Dictionary, Value};

use crate::Error;

pub fn as_dict<'a>(node: &'a Value, context: &str) -> Result<&'a Dictionary, Error> {
    node.as_dictionary()
        .ok_or_else(|| Error::schema(format!("{context} is not a dictionary")))
}

pub fn as_string<'a>(node: &'a Value, context: &str) -> Result<&'a str, Error> {
    node.as_string()
        .ok_or_else(|| Error::schema(format!("{context} is not a string")))
}

pub fn as_u64(node: &Value, context: &str) -> Result<u64, Error> {
    node.as_unsigned_integer()
        .ok_or_else(|| Error::schema(format!("{context} is not an unsigned integer")))
}

pub fn as_data<'a>(node: &'a Value, context: &str) -> Result<&'a [u8], Error> {
    node.as_data()
        .ok_or_else(|| Error::schema(format!("{context} is not a data blob")))
}

pub fn dict_get<'a>(
    dict: &'a Dictionary,
    key: &str,
    context: &str,
) -> Result<&'a Value, Error> {
    dict.get(key)
        .ok_or_else(|| Error::schema(format!("{context} has no `{key}` entry")))
}

/// Iterates a dictionary's entries as `(key, node)` pairs.
pub fn entries(dict: &Dictionary) -> impl Iterator<Item = (&str, &Value)> {
    dict.iter().map(|(key, node)| (key.as_str(), node))
}
