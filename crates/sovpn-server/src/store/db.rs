use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use constant_time_eq::constant_time_eq;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

/// One row per client: slug -> current share hash. Exactly one live hash per
/// slug at any time; rotation replaces rows, it never appends.
const CLIENTS: TableDefinition<&str, &str> = TableDefinition::new("clients");

/// Thread-safe handle to the share-hash index.
#[derive(Clone)]
pub struct Index {
    db: Arc<Database>,
}

impl Index {
    /// Open (or create) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open index database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(CLIENTS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert or overwrite the share hash for a slug.
    pub fn insert(&self, slug: &str, share_hash: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CLIENTS)?;
            table.insert(slug, share_hash)?;
        }
        write_txn.commit()?;

        debug!(slug = %slug, "registered share hash");
        Ok(())
    }

    /// Replace a slug's share hash. Same upsert as [`Index::insert`]; named
    /// separately because rotation must fully replace, never merge.
    pub fn replace(&self, slug: &str, new_hash: &str) -> Result<()> {
        self.insert(slug, new_hash)
    }

    /// Remove a slug's record. Returns true if it existed.
    pub fn remove(&self, slug: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(CLIENTS)?;
            let existed = table.remove(slug)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Current share hash for a slug, if registered.
    pub fn find_hash_by_slug(&self, slug: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CLIENTS)?;
        Ok(table.get(slug)?.map(|guard| guard.value().to_owned()))
    }

    /// Resolve a presented token back to its slug.
    ///
    /// Scans the whole table and compares each stored hash in constant time,
    /// without breaking early on a match, so the lookup cost does not depend
    /// on where (or whether) the token matches.
    pub fn find_slug_by_hash(&self, share_hash: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CLIENTS)?;

        let mut found: Option<String> = None;
        for item in table.iter()? {
            let (slug, stored) = item?;
            if constant_time_eq(stored.value().as_bytes(), share_hash.as_bytes()) {
                found = Some(slug.value().to_owned());
            }
        }
        Ok(found)
    }

    /// All registered slugs, in storage order.
    pub fn all_slugs(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CLIENTS)?;

        let mut slugs = Vec::new();
        for item in table.iter()? {
            let (slug, _hash) = item?;
            slugs.push(slug.value().to_owned());
        }
        Ok(slugs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_index() -> (Index, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let index = Index::open(&dir.path().join("test.db")).unwrap();
        (index, dir)
    }

    #[test]
    fn insert_and_find_both_ways() {
        let (idx, _dir) = make_index();
        idx.insert("alice", "abc123").unwrap();

        assert_eq!(idx.find_hash_by_slug("alice").unwrap().as_deref(), Some("abc123"));
        assert_eq!(idx.find_slug_by_hash("abc123").unwrap().as_deref(), Some("alice"));
        assert_eq!(idx.find_slug_by_hash("xyz999").unwrap(), None);
        assert_eq!(idx.find_hash_by_slug("bob").unwrap(), None);
    }

    #[test]
    fn replace_overwrites_single_record() {
        let (idx, _dir) = make_index();
        idx.insert("alice", "old-hash").unwrap();
        idx.replace("alice", "new-hash").unwrap();

        // Old token is dead, new one resolves; still exactly one record.
        assert_eq!(idx.find_slug_by_hash("old-hash").unwrap(), None);
        assert_eq!(idx.find_slug_by_hash("new-hash").unwrap().as_deref(), Some("alice"));
        assert_eq!(idx.all_slugs().unwrap(), vec!["alice".to_owned()]);
    }

    #[test]
    fn remove_deletes_record() {
        let (idx, _dir) = make_index();
        idx.insert("alice", "abc123").unwrap();
        assert!(idx.remove("alice").unwrap());
        assert!(!idx.remove("alice").unwrap());
        assert_eq!(idx.find_slug_by_hash("abc123").unwrap(), None);
    }

    #[test]
    fn inverse_lookup_consistency() {
        let (idx, _dir) = make_index();
        for (slug, hash) in [("alice", "h-alice"), ("bob", "h-bob"), ("carol", "h-carol")] {
            idx.insert(slug, hash).unwrap();
        }
        for slug in idx.all_slugs().unwrap() {
            let hash = idx.find_hash_by_slug(&slug).unwrap().unwrap();
            assert_eq!(idx.find_slug_by_hash(&hash).unwrap().as_deref(), Some(slug.as_str()));
        }
    }
}
