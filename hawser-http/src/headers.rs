//! Ordered header store.
//!
//! Headers are kept as an ordered list of (name, value) pairs: insertion
//! order is preserved, duplicate names are permitted, and name lookups are
//! ASCII case-insensitive. A field with multiple comma-separated values on
//! one line is treated as a single value; splitting is the caller's
//! business, which keeps single-valued fields whose values contain commas
//! (cookies, dates) intact.
//!
//! Values are trimmed of surrounding whitespace on insertion. Names never
//! are.

use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;

use crate::error::HttpError;

/// The header fields of a single HTTP message. Immutable; build with
/// [`HeadersBuilder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Headers from alternating name/value pairs, validated.
    pub fn of(pairs: &[(&str, &str)]) -> Result<Headers, HttpError> {
        let mut builder = HeadersBuilder::new();
        for (name, value) in pairs {
            builder.add(name, value)?;
        }
        Ok(builder.build())
    }

    /// The last value for `name`, or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The last value for `name` parsed as an HTTP date.
    pub fn get_date(&self, name: &str) -> Option<SystemTime> {
        self.get(name)
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// All values for `name` in insertion order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field name at `index`, or `None` if out of range.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|(n, _)| n.as_str())
    }

    /// Field value at `index`, or `None` if out of range.
    pub fn value(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|(_, v)| v.as_str())
    }

    /// The set of distinct header names, lowercased.
    pub fn names(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .map(|(n, _)| n.to_ascii_lowercase())
            .collect()
    }

    /// Group values by lowercased name. Values keep insertion order within
    /// each name.
    pub fn to_multimap(&self) -> HashMap<String, Vec<String>> {
        let mut result: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in &self.fields {
            result
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }
        result
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn new_builder(&self) -> HeadersBuilder {
        HeadersBuilder {
            fields: self.fields.clone(),
        }
    }
}

fn validate(name: &str, value: &str) -> Result<(), HttpError> {
    if name.is_empty() {
        return Err(HttpError::Request("empty header name".to_string()));
    }
    if name.contains('\0') || value.contains('\0') {
        return Err(HttpError::Request(format!(
            "unexpected NUL in header: {name}"
        )));
    }
    Ok(())
}

/// Builds an ordered [`Headers`] instance.
#[derive(Debug, Clone, Default)]
pub struct HeadersBuilder {
    fields: Vec<(String, String)>,
}

impl HeadersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, validating the name and value.
    pub fn add(&mut self, name: &str, value: &str) -> Result<&mut Self, HttpError> {
        validate(name, value)?;
        Ok(self.add_lenient(name, value))
    }

    /// Add a header line containing a name, a colon, and a value.
    pub fn add_line(&mut self, line: &str) -> Result<&mut Self, HttpError> {
        match line.find(':') {
            Some(index) => self.add(line[..index].trim(), &line[index + 1..]),
            None => Err(HttpError::Request(format!("unexpected header: {line}"))),
        }
    }

    /// Add a header line without validation. Only appropriate for input
    /// from the remote peer or the cache: tolerates empty names and names
    /// that start with a colon, as produced by broken legacy peers.
    pub fn add_lenient_line(&mut self, line: &str) -> &mut Self {
        match line[1.min(line.len())..].find(':') {
            Some(index) => {
                let index = index + 1;
                self.add_lenient(&line[..index], &line[index + 1..])
            }
            None => {
                if let Some(rest) = line.strip_prefix(':') {
                    // An empty name with a leading colon.
                    self.add_lenient("", rest)
                } else {
                    self.add_lenient("", line)
                }
            }
        }
    }

    /// Add a field without validation. Only appropriate for input from the
    /// remote peer or the cache.
    pub fn add_lenient(&mut self, name: &str, value: &str) -> &mut Self {
        self.fields.push((name.to_string(), value.trim().to_string()));
        self
    }

    /// Remove every field named `name` (case-insensitive).
    pub fn remove_all(&mut self, name: &str) -> &mut Self {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    /// Set `name` to exactly one value, replacing any existing values.
    pub fn set(&mut self, name: &str, value: &str) -> Result<&mut Self, HttpError> {
        validate(name, value)?;
        self.remove_all(name);
        Ok(self.add_lenient(name, value))
    }

    /// The last value for `name`, without building.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn build(&self) -> Headers {
        Headers {
            fields: self.fields.clone(),
        }
    }
}
