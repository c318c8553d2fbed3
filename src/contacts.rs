//! Caller name lookup.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::phone;

/// Read-only number → display name lookup.
pub trait ContactsLookup: Send + Sync {
    fn lookup_name(&self, number: &str) -> Option<String>;
}

/// Lookup that never finds anyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContacts;

impl ContactsLookup for NoContacts {
    fn lookup_name(&self, _number: &str) -> Option<String> {
        None
    }
}

/// Contacts from a `name,number` text file, e.g. a phonebook export.
///
/// Numbers are matched on their last ten digits, so `+905551234567` and
/// `05551234567` resolve to the same entry. The first entry for a key wins.
#[derive(Debug, Clone, Default)]
pub struct ContactBook {
    by_key: HashMap<String, String>,
}

impl ContactBook {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let book = Self::parse(&text);
        debug!(path = %path.display(), entries = book.len(), "contacts loaded");
        Ok(book)
    }

    pub fn parse(text: &str) -> Self {
        let mut by_key = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Names may contain commas; the number is the last field.
            let Some((name, number)) = line.rsplit_once(',') else {
                continue;
            };
            let name = name.trim().trim_matches('"').trim();
            let key = phone::match_key(number.trim());
            if name.is_empty() || key.is_empty() {
                continue;
            }
            by_key.entry(key).or_insert_with(|| name.to_string());
        }
        Self { by_key }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl ContactsLookup for ContactBook {
    fn lookup_name(&self, number: &str) -> Option<String> {
        let key = phone::match_key(number);
        if key.is_empty() {
            return None;
        }
        self.by_key.get(&key).cloned()
    }
}
