//! Symbol dictionaries and the per-I/O-worker table caches built on them.
//!
//! A SYMBOL column keeps its dictionary in `<col>.sym` at the table root:
//! a packed sequence of `[u32 len][utf8 bytes]` entries whose ordinal is the
//! dictionary id. The table writer appends entries; everyone else only reads.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::table::{ColumnType, Engine};

pub const SYM_NOT_FOUND: i32 = -1;

pub fn sym_file(table_dir: &Path, column: &str) -> PathBuf {
    table_dir.join(format!("{column}.sym"))
}

/// Read every dictionary entry of a symbol column.
pub fn read_dictionary(path: &Path) -> anyhow::Result<Vec<String>> {
    let mut buf = Vec::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_end(&mut buf)
                .with_context(|| format!("could not read [file={}]", path.display()))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("could not open [file={}]", path.display()))
        }
    }
    decode_entries(&buf, path)
}

fn decode_entries(buf: &[u8], path: &Path) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= buf.len() {
        let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        anyhow::ensure!(
            pos + len <= buf.len(),
            "truncated symbol file [file={}]",
            path.display()
        );
        let value = std::str::from_utf8(&buf[pos..pos + len])
            .with_context(|| format!("invalid UTF8 in symbol file [file={}]", path.display()))?;
        out.push(value.to_string());
        pos += len;
    }
    Ok(out)
}

pub fn encode_entry(value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + value.len());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf
}

/// Read-only symbol lookup cache for one column, refreshed from the
/// dictionary file when a miss might be stale.
#[derive(Debug, Default)]
pub struct SymbolCache {
    path: PathBuf,
    known: HashMap<String, i32>,
}

impl SymbolCache {
    pub fn attach(&mut self, table_dir: &Path, column: &str) {
        self.path = sym_file(table_dir, column);
        self.known.clear();
    }

    /// Resolve a symbol value to its dictionary id, re-reading the file on a
    /// miss so recently written symbols are picked up.
    pub fn lookup(&mut self, value: &str) -> i32 {
        if let Some(&id) = self.known.get(value) {
            return id;
        }
        self.refresh();
        self.known.get(value).copied().unwrap_or(SYM_NOT_FOUND)
    }

    fn refresh(&mut self) {
        let Ok(entries) = read_dictionary(&self.path) else {
            return;
        };
        if entries.len() > self.known.len() {
            for (id, value) in entries.into_iter().enumerate() {
                self.known.entry(value).or_insert(id as i32);
            }
        }
    }

    pub fn reset(&mut self) {
        self.path.clear();
        self.known.clear();
    }
}

/// Per-(table, I/O-worker) lookup state: the column-name → index cache plus
/// one symbol cache per SYMBOL column.
#[derive(Debug, Default)]
pub struct IoLocalTable {
    column_index_by_name: HashMap<String, i32>,
    columns: Vec<(String, ColumnType)>,
    symbol_caches: Vec<Option<SymbolCache>>,
}

impl IoLocalTable {
    /// Resolve a column name, re-reading the table metadata on a miss so a
    /// column the writer just created becomes visible. All names re-cache at
    /// once instead of one at a time.
    pub fn column_index(&mut self, engine: &Engine, table: &str, name: &str) -> i32 {
        if let Some(&idx) = self.column_index_by_name.get(name) {
            return idx;
        }
        let Ok(meta) = engine.reader_meta(table) else {
            return -1;
        };
        self.column_index_by_name.clear();
        self.columns = meta
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.col_type))
            .collect();
        for (i, (name, _)) in self.columns.iter().enumerate() {
            self.column_index_by_name.insert(name.clone(), i as i32);
        }
        self.column_index_by_name.get(name).copied().unwrap_or(-1)
    }

    /// Resolve a symbol value through this worker's cache for the column.
    pub fn symbol_index(
        &mut self,
        table_dir: &Path,
        col_index: i32,
        value: &str,
        unused_caches: &mut Vec<SymbolCache>,
    ) -> i32 {
        if col_index < 0 {
            return SYM_NOT_FOUND;
        }
        let idx = col_index as usize;
        let Some((col_name, col_type)) = self.columns.get(idx) else {
            return SYM_NOT_FOUND;
        };
        if *col_type != ColumnType::Symbol {
            return SYM_NOT_FOUND;
        }
        if self.symbol_caches.len() <= idx {
            self.symbol_caches.resize_with(idx + 1, || None);
        }
        let cache = self.symbol_caches[idx].get_or_insert_with(|| {
            let mut cache = unused_caches.pop().unwrap_or_default();
            cache.attach(table_dir, col_name);
            cache
        });
        cache.lookup(value)
    }

    /// Drop cached state, returning symbol caches to the worker's reuse pool.
    pub fn clear(&mut self, unused_caches: &mut Vec<SymbolCache>) {
        self.column_index_by_name.clear();
        self.columns.clear();
        for mut cache in self.symbol_caches.drain(..).flatten() {
            cache.reset();
            unused_caches.push(cache);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn dictionary_round_trip() {
        let dir = std::env::temp_dir().join(format!("strata-sym-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = sym_file(&dir, "loc");
        let mut f = File::create(&path).unwrap();
        f.write_all(&encode_entry("eu")).unwrap();
        f.write_all(&encode_entry("us")).unwrap();

        assert_eq!(read_dictionary(&path).unwrap(), vec!["eu", "us"]);

        let mut cache = SymbolCache::default();
        cache.attach(&dir, "loc");
        assert_eq!(cache.lookup("us"), 1);
        assert_eq!(cache.lookup("apac"), SYM_NOT_FOUND);

        // New entries become visible on the next miss.
        f.write_all(&encode_entry("apac")).unwrap();
        assert_eq!(cache.lookup("apac"), 2);

        std::fs::remove_dir_all(&dir).ok();
    }
}
