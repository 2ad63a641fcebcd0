//! Peer Store
//!
//! Durable peer records backed by SQLite. Identity and address are both
//! unique at the schema level, so a bug upstream can never persist two
//! peers on one address.

use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// One registered peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    pub identity: Identity,
    pub address: Ipv4Addr,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(identity: Identity, address: Ipv4Addr, at: DateTime<Utc>) -> Self {
        Self {
            identity,
            address,
            registered_at: at,
            last_seen: at,
        }
    }
}

/// Raw row as stored, before parsing
struct RawRow {
    identity: String,
    address: String,
    registered_at: String,
    last_seen: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identity: row.get(0)?,
            address: row.get(1)?,
            registered_at: row.get(2)?,
            last_seen: row.get(3)?,
        })
    }

    fn parse(self) -> Result<PeerRecord> {
        let identity = Identity::parse(&self.identity)
            .map_err(|e| Error::Store(format!("corrupt identity '{}': {}", self.identity, e)))?;
        let address = self
            .address
            .parse::<Ipv4Addr>()
            .map_err(|e| Error::Store(format!("corrupt address '{}': {}", self.address, e)))?;
        Ok(PeerRecord {
            identity,
            address,
            registered_at: parse_time(&self.registered_at)?,
            last_seen: parse_time(&self.last_seen)?,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("corrupt timestamp '{}': {}", s, e)))
}

/// SQLite-backed peer table
pub struct PeerStore {
    conn: Connection,
}

impl PeerStore {
    /// Create or open the peer store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL + FULL: a committed registration survives power loss
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn)
    }

    /// Store that lives only as long as the process (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                identity TEXT PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                registered_at TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    /// All records, ordered by registration time
    pub fn list_all(&self) -> Result<Vec<PeerRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT identity, address, registered_at, last_seen FROM peers ORDER BY registered_at, identity",
        )?;
        let rows = stmt.query_map([], RawRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.parse()?);
        }
        Ok(records)
    }

    pub fn find(&self, identity: &Identity) -> Result<Option<PeerRecord>> {
        let raw = self
            .conn
            .query_row(
                "SELECT identity, address, registered_at, last_seen FROM peers WHERE identity = ?1",
                params![identity.to_base64()],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::parse).transpose()
    }

    /// Insert `record` unless its identity is already present.
    ///
    /// Runs as one transaction. Returns the existing record when there was
    /// one, `None` when `record` was written and committed.
    pub fn insert_if_absent(&mut self, record: &PeerRecord) -> Result<Option<PeerRecord>> {
        let tx = self.conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT identity, address, registered_at, last_seen FROM peers WHERE identity = ?1",
                params![record.identity.to_base64()],
                RawRow::from_row,
            )
            .optional()?;
        if let Some(raw) = existing {
            return raw.parse().map(Some);
        }

        tx.execute(
            "INSERT INTO peers (identity, address, registered_at, last_seen) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.identity.to_base64(),
                record.address.to_string(),
                record.registered_at.to_rfc3339(),
                record.last_seen.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(None)
    }

    /// Refresh `last_seen`; the address is never rewritten
    pub fn touch(&self, identity: &Identity, at: DateTime<Utc>) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE peers SET last_seen = ?2 WHERE identity = ?1",
            params![identity.to_base64(), at.to_rfc3339()],
        )?;
        Ok(updated > 0)
    }

    pub fn delete(&self, identity: &Identity) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM peers WHERE identity = ?1",
            params![identity.to_base64()],
        )?;
        Ok(deleted > 0)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM peers", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    #[test]
    fn test_insert_and_find() {
        let mut store = PeerStore::open_in_memory().unwrap();
        let rec = PeerRecord::new(id(1), Ipv4Addr::new(10, 0, 0, 2), Utc::now());

        assert!(store.find(&id(1)).unwrap().is_none());
        assert!(store.insert_if_absent(&rec).unwrap().is_none());

        let found = store.find(&id(1)).unwrap().unwrap();
        assert_eq!(found.address, rec.address);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let mut store = PeerStore::open_in_memory().unwrap();
        let first = PeerRecord::new(id(1), Ipv4Addr::new(10, 0, 0, 2), Utc::now());
        let second = PeerRecord::new(id(1), Ipv4Addr::new(10, 0, 0, 3), Utc::now());

        store.insert_if_absent(&first).unwrap();
        let existing = store.insert_if_absent(&second).unwrap().unwrap();
        assert_eq!(existing.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_address_uniqueness_enforced() {
        let mut store = PeerStore::open_in_memory().unwrap();
        let addr = Ipv4Addr::new(10, 0, 0, 2);
        store.insert_if_absent(&PeerRecord::new(id(1), addr, Utc::now())).unwrap();

        let clash = store.insert_if_absent(&PeerRecord::new(id(2), addr, Utc::now()));
        assert!(matches!(clash, Err(Error::Store(_))));
        // Rolled back: nothing partial left behind
        assert!(store.find(&id(2)).unwrap().is_none());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_touch_and_delete() {
        let mut store = PeerStore::open_in_memory().unwrap();
        let t0 = Utc::now() - chrono::Duration::hours(1);
        store
            .insert_if_absent(&PeerRecord::new(id(1), Ipv4Addr::new(10, 0, 0, 2), t0))
            .unwrap();

        let t1 = Utc::now();
        assert!(store.touch(&id(1), t1).unwrap());
        let rec = store.find(&id(1)).unwrap().unwrap();
        assert!(rec.last_seen > rec.registered_at);
        assert_eq!(rec.address, Ipv4Addr::new(10, 0, 0, 2));

        assert!(!store.touch(&id(9), t1).unwrap());
        assert!(store.delete(&id(1)).unwrap());
        assert!(!store.delete(&id(1)).unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.db");
        {
            let mut store = PeerStore::open(&path).unwrap();
            for n in 1..=3u8 {
                store
                    .insert_if_absent(&PeerRecord::new(id(n), Ipv4Addr::new(10, 0, 0, n + 1), Utc::now()))
                    .unwrap();
            }
        }

        let store = PeerStore::open(&path).unwrap();
        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 3);
        let mut addrs: Vec<_> = all.iter().map(|r| r.address).collect();
        addrs.sort();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 4)
            ]
        );
    }
}
