//! Cache entries and their diagnostic snapshot

use crate::fingerprint::{FileKind, Fingerprint, SignedFile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The memoized result of one call plus the manifest needed to decide whether
/// it is still valid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Identity of the memoized function
    pub function: String,
    /// Canonical JSON encoding of the call arguments
    pub args: String,
    /// bincode encoding of the returned value
    pub value: Vec<u8>,
    /// Declared and discovered files with their signatures when cached
    pub files: Vec<SignedFile>,
    /// Memoized calls this call depended on
    pub calls: Vec<Fingerprint>,
}

/// Read-only view of the whole store, printed by `--dump-state`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDump {
    pub entries: Vec<EntryDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDump {
    pub fingerprint: Fingerprint,
    pub function: String,
    pub args: String,
    pub value_size: usize,
    pub files: Vec<FileDump>,
    pub calls: Vec<Fingerprint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDump {
    pub path: PathBuf,
    pub kind: FileKind,
    pub signature: String,
}

impl StateDump {
    pub(crate) fn from_entries(entries: &BTreeMap<Fingerprint, CacheEntry>) -> Self {
        let entries = entries
            .iter()
            .map(|(fingerprint, entry)| EntryDump {
                fingerprint: *fingerprint,
                function: entry.function.clone(),
                args: entry.args.clone(),
                value_size: entry.value.len(),
                files: entry
                    .files
                    .iter()
                    .map(|file| FileDump {
                        path: file.path.clone(),
                        kind: file.kind,
                        signature: file.signature.to_string(),
                    })
                    .collect(),
                calls: entry.calls.clone(),
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of one function
    pub fn for_function<'a>(&'a self, function: &'a str) -> impl Iterator<Item = &'a EntryDump> {
        self.entries.iter().filter(move |e| e.function == function)
    }
}

impl std::fmt::Display for StateDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{} {}({})", entry.fingerprint.short(), entry.function, entry.args)?;
            writeln!(f, "    value: {} bytes", entry.value_size)?;
            for file in &entry.files {
                let kind = match file.kind {
                    FileKind::Input => "in ",
                    FileKind::Output => "out",
                };
                writeln!(f, "    {kind} {} [{}]", file.path.display(), file.signature)?;
            }
            for call in &entry.calls {
                writeln!(f, "    calls {}", call.short())?;
            }
        }
        write!(f, "{} entries", self.entries.len())
    }
}
