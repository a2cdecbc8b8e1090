//! Durable provisioner-info store: one row per `kernel_id`, upserted, surviving a gateway
//! restart so `load_provisioner_info` can resume polling/signaling an already-placed kernel.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kprov_core::prelude::*;
use metrics::{counter, histogram};

pub trait Store: Send + Sync {
    fn put_info(&self, info: &ProvisionerInfo) -> Result<()>;
    fn get_info(&self, kernel_id: &str) -> Result<Option<ProvisionerInfo>>;
    fn delete_info(&self, kernel_id: &str) -> Result<()>;
    fn list_info(&self) -> Result<Vec<ProvisionerInfo>>;
}

/// SQLite-backed store. Simple, synchronous; the CLI/daemon aren't latency sensitive here.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KPROV_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS provisioner_info (
                kernel_id      TEXT PRIMARY KEY,
                pid            INTEGER NOT NULL,
                pgid           INTEGER NOT NULL,
                ip             TEXT NOT NULL,
                assigned_ip    TEXT NOT NULL,
                assigned_host  TEXT NOT NULL,
                comm_ip        TEXT,
                comm_port      INTEGER,
                placement_json TEXT,
                updated_ts     INTEGER NOT NULL
            )",
            [],
        )
        .context("creating provisioner_info table")?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

impl Store for SqliteStore {
    fn put_info(&self, info: &ProvisionerInfo) -> Result<()> {
        let started = std::time::Instant::now();
        let placement_json = info
            .placement
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("encoding placement handle")?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO provisioner_info
                (kernel_id, pid, pgid, ip, assigned_ip, assigned_host, comm_ip, comm_port, placement_json, updated_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(kernel_id) DO UPDATE SET
                pid = excluded.pid,
                pgid = excluded.pgid,
                ip = excluded.ip,
                assigned_ip = excluded.assigned_ip,
                assigned_host = excluded.assigned_host,
                comm_ip = excluded.comm_ip,
                comm_port = excluded.comm_port,
                placement_json = excluded.placement_json,
                updated_ts = excluded.updated_ts",
            rusqlite::params![
                info.kernel_id,
                info.pid,
                info.pgid,
                info.ip,
                info.assigned_ip,
                info.assigned_host,
                info.comm_ip,
                info.comm_port,
                placement_json,
                now_ts(),
            ],
        )
        .context("upserting provisioner_info row")?;
        histogram!("persist_put_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total").increment(1);
        Ok(())
    }

    fn get_info(&self, kernel_id: &str) -> Result<Option<ProvisionerInfo>> {
        let started = std::time::Instant::now();
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare(
                "SELECT kernel_id, pid, pgid, ip, assigned_ip, assigned_host, comm_ip, comm_port, placement_json
                 FROM provisioner_info WHERE kernel_id = ?1",
            )
            .context("preparing provisioner_info select")?;
        let mut rows = stmt.query([kernel_id])?;
        let out = match rows.next()? {
            Some(row) => Some(row_to_info(row)?),
            None => None,
        };
        histogram!("persist_get_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn delete_info(&self, kernel_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM provisioner_info WHERE kernel_id = ?1", [kernel_id])
            .context("deleting provisioner_info row")?;
        Ok(())
    }

    fn list_info(&self) -> Result<Vec<ProvisionerInfo>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT kernel_id, pid, pgid, ip, assigned_ip, assigned_host, comm_ip, comm_port, placement_json
             FROM provisioner_info ORDER BY updated_ts DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_info(row)?);
        }
        Ok(out)
    }
}

fn row_to_info(row: &rusqlite::Row) -> Result<ProvisionerInfo> {
    let placement_json: Option<String> = row.get(8)?;
    let placement = placement_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .context("decoding placement handle")?;
    Ok(ProvisionerInfo {
        kernel_id: row.get(0)?,
        pid: row.get(1)?,
        pgid: row.get(2)?,
        ip: row.get(3)?,
        assigned_ip: row.get(4)?,
        assigned_host: row.get(5)?,
        comm_ip: row.get(6)?,
        comm_port: row.get::<_, Option<i64>>(7)?.map(|p| p as u16),
        placement,
    })
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kprov");
        let _ = std::fs::create_dir_all(&p);
        p.push("provisioner.db");
        return p.to_string_lossy().to_string();
    }
    "kprov.db".to_string()
}

fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "kprov-test-{}.db",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    fn sample(kernel_id: &str) -> ProvisionerInfo {
        ProvisionerInfo {
            kernel_id: kernel_id.to_string(),
            pid: 1234,
            pgid: 1234,
            ip: "10.0.0.5".to_string(),
            assigned_ip: "10.0.0.5".to_string(),
            assigned_host: "worker-1".to_string(),
            comm_ip: Some("10.0.0.5".to_string()),
            comm_port: Some(54321),
            placement: Some(PlacementHandle::Ssh { host: "worker-1".to_string() }),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = SqliteStore::open(&temp_db()).unwrap();
        let info = sample("k1");
        store.put_info(&info).unwrap();
        let back = store.get_info("k1").unwrap().unwrap();
        assert_eq!(back.kernel_id, "k1");
        assert_eq!(back.pid, 1234);
        assert_eq!(back.comm_port, Some(54321));
        matches!(back.placement, Some(PlacementHandle::Ssh { .. }));
    }

    #[test]
    fn put_upserts_rather_than_duplicates() {
        let store = SqliteStore::open(&temp_db()).unwrap();
        let mut info = sample("k1");
        store.put_info(&info).unwrap();
        info.assigned_host = "worker-2".to_string();
        store.put_info(&info).unwrap();
        assert_eq!(store.list_info().unwrap().len(), 1);
        assert_eq!(store.get_info("k1").unwrap().unwrap().assigned_host, "worker-2");
    }

    #[test]
    fn delete_removes_row() {
        let store = SqliteStore::open(&temp_db()).unwrap();
        store.put_info(&sample("k1")).unwrap();
        store.delete_info("k1").unwrap();
        assert!(store.get_info("k1").unwrap().is_none());
    }

    #[test]
    fn get_missing_kernel_is_none() {
        let store = SqliteStore::open(&temp_db()).unwrap();
        assert!(store.get_info("nope").unwrap().is_none());
    }
}
