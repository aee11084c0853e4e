//! Directory of named allocations: name → (offset, length,
//! description), with an inverted offset index.  Entries keep their
//! insertion order, and both names and offsets are unique.
//! Serialized as a JSON document at close.
use std::collections::HashMap;
use std::path::Path;

use log::error;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize)]
struct Document {
    named_objects: Vec<Entry>,
}

#[derive(Default)]
pub struct NamedObjectDirectory {
    /// Entries in insertion order.  Directories are small (one entry
    /// per named root object), so erasure can afford to renumber.
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
    by_offset: HashMap<usize, usize>,
}

impl NamedObjectDirectory {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a named allocation.  Rejects duplicate names and
    /// duplicate offsets.
    pub fn insert(&mut self, name: &str, offset: usize, length: usize, description: &str) -> bool {
        if self.by_name.contains_key(name) || self.by_offset.contains_key(&offset) {
            return false;
        }

        let index = self.entries.len();
        self.entries.push(Entry {
            name: name.to_string(),
            offset,
            length,
            description: description.to_string(),
        });
        self.by_name.insert(name.to_string(), index);
        self.by_offset.insert(offset, index);
        true
    }

    pub fn find(&self, name: &str) -> Option<&Entry> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    pub fn find_by_offset(&self, offset: usize) -> Option<&Entry> {
        self.by_offset.get(&offset).map(|&index| &self.entries[index])
    }

    /// Removes the entry for `name`; returns it if it existed.
    pub fn erase(&mut self, name: &str) -> Option<Entry> {
        let index = self.by_name.remove(name)?;
        let entry = self.entries.remove(index);
        self.by_offset.remove(&entry.offset);

        // Entries after the removal point shifted down by one.
        for later in &self.entries[index..] {
            *self.by_name.get_mut(&later.name).expect("index is consistent") -= 1;
            *self.by_offset.get_mut(&later.offset).expect("index is consistent") -= 1;
        }
        Some(entry)
    }

    /// Replaces the description attribute of `name`.
    pub fn set_description(&mut self, name: &str, description: &str) -> bool {
        match self.by_name.get(name) {
            Some(&index) => {
                self.entries[index].description = description.to_string();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn serialize(&self, path: &Path) -> Result<()> {
        let document = Document {
            named_objects: self.entries.clone(),
        };
        let file = std::fs::File::create(path).map_err(|e| Error::io("create named object directory", path, e))?;
        serde_json::to_writer(std::io::BufWriter::new(file), &document).map_err(|e| {
            error!("Failed to write named object directory: {}", e);
            Error::Inconsistent(format!("named object directory: {}", e))
        })
    }

    pub fn deserialize(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path).map_err(|e| Error::io("open named object directory", path, e))?;
        let document: Document = serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
            error!("Corrupt named object directory {}: {}", path.display(), e);
            Error::Inconsistent(format!("named object directory: {}", e))
        })?;

        for entry in document.named_objects {
            if !self.insert(&entry.name, entry.offset, entry.length, &entry.description) {
                return Err(Error::Inconsistent(format!(
                    "named object directory: duplicate entry for {:?}",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}
