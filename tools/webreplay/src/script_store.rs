use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::errors::ReplayError;
use crate::event::{Annotation, Capture, Event, Script};
use crate::logging::append_run_log;
use crate::runtime::{KeyValueStore, ScriptStore};

type StoreResult<T> = Result<T, ReplayError>;

const MIGRATIONS: [(i64, &str); 2] = [
    (
        1,
        "CREATE TABLE scripts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            tag TEXT NOT NULL,
            source_id INTEGER,
            notes TEXT NOT NULL DEFAULT '',
            events_json TEXT NOT NULL,
            captures_json TEXT NOT NULL,
            params_json TEXT,
            digest TEXT NOT NULL,
            event_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX idx_scripts_name ON scripts(name, id);",
    ),
    (
        2,
        "CREATE TABLE kv (
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );",
    ),
];

/// Arguments of a script save: a new named variant of some source script.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaveScriptRequest {
    pub name: String,
    pub events: Vec<Event>,
    pub source_id: Option<i64>,
    /// Comma separated labels, e.g. `replay,add_trigger_event4_event2,true`.
    pub tag: String,
    pub captures: Vec<Capture>,
    pub notes: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptVariant {
    pub id: i64,
    pub name: String,
    pub tag: String,
    pub source_id: Option<i64>,
    pub notes: String,
    pub digest: String,
    pub events: Vec<Event>,
    pub captures: Vec<Capture>,
    pub created_at: i64,
}

impl ScriptVariant {
    pub fn from_request(id: i64, request: SaveScriptRequest) -> Self {
        Self {
            id,
            digest: content_digest(&request.events),
            name: request.name,
            tag: request.tag,
            source_id: request.source_id,
            notes: request.notes,
            events: request.events,
            captures: request.captures,
            created_at: system_time_unix(),
        }
    }

    pub fn to_script(&self) -> Script {
        let mut annotations = vec![Annotation {
            key: "tag".to_string(),
            value: self.tag.clone(),
        }];
        if !self.notes.is_empty() {
            annotations.push(Annotation {
                key: "notes".to_string(),
                value: self.notes.clone(),
            });
        }
        if let Some(source) = self.source_id {
            annotations.push(Annotation {
                key: "source".to_string(),
                value: source.to_string(),
            });
        }
        Script {
            id: Some(self.id),
            name: self.name.clone(),
            events: self.events.clone(),
            annotations,
        }
    }
}

/// Hex SHA-256 of the canonical JSON of a script's events.
pub fn content_digest(events: &[Event]) -> String {
    let rendered = serde_json::to_string(events).unwrap_or_default();
    let digest = Sha256::digest(rendered.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug)]
enum WriteCmd {
    SaveScript {
        request: SaveScriptRequest,
        now: i64,
        reply: oneshot::Sender<StoreResult<i64>>,
    },
    SetValue {
        key: String,
        value: Value,
        now: i64,
        reply: oneshot::Sender<StoreResult<()>>,
    },
}

/// Script storage and small key/value state in one SQLite file. Writes go
/// through a single writer thread; reads use their own connection.
pub struct SqliteScriptStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    reader: Mutex<Connection>,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
}

impl Drop for SqliteScriptStore {
    fn drop(&mut self) {
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl SqliteScriptStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "script_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ReplayError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| ReplayError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(ReplayError::Database(format!(
                    "script database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(ReplayError::Database(format!(
                    "script database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(64);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::SaveScript {
                        request,
                        now,
                        reply,
                    } => {
                        let _ = reply.send(insert_script(&write_conn, &request, now));
                    }
                    WriteCmd::SetValue {
                        key,
                        value,
                        now,
                        reply,
                    } => {
                        let _ = reply.send(upsert_value(&write_conn, &key, &value, now));
                    }
                }
            }
        });

        let reader = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(db_err)?;
        reader
            .busy_timeout(std::time::Duration::from_secs(3))
            .map_err(db_err)?;

        Ok(Self {
            write_tx: Some(write_tx),
            reader: Mutex::new(reader),
            writer_join: Some(writer_join),
            db_path: path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn send<T>(&self, build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> WriteCmd) -> StoreResult<T> {
        let sender = self
            .write_tx
            .as_ref()
            .ok_or_else(|| ReplayError::Database("store is closed".to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .blocking_send(build(reply_tx))
            .map_err(|e| ReplayError::Database(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| ReplayError::Database(e.to_string()))?
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self
            .reader
            .lock()
            .map_err(|_| ReplayError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

impl ScriptStore for SqliteScriptStore {
    fn get_script(&self, name: &str) -> StoreResult<Script> {
        let variant = self.with_reader(|conn| {
            conn.query_row(
                &format!("{SELECT_VARIANT} WHERE name = ?1 ORDER BY id DESC LIMIT 1"),
                [name],
                row_to_variant,
            )
            .optional()
            .map_err(db_err)
        })?;
        let variant = variant.ok_or_else(|| ReplayError::ScriptNotFound(name.to_string()))?;
        Ok(variant?.to_script())
    }

    fn save_script(&self, request: SaveScriptRequest) -> StoreResult<i64> {
        append_run_log(
            "debug",
            "script_store.save",
            json!({
                "name": request.name,
                "tag": request.tag,
                "events": request.events.len(),
                "captures": request.captures.len(),
            }),
        );
        let now = system_time_unix();
        let id = self.send(|reply| WriteCmd::SaveScript {
            request,
            now,
            reply,
        })?;
        append_run_log("info", "script_store.saved", json!({ "id": id }));
        Ok(id)
    }

    fn list_variants(&self, name: &str) -> StoreResult<Vec<ScriptVariant>> {
        self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(&format!("{SELECT_VARIANT} WHERE name = ?1 ORDER BY id ASC"))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([name], row_to_variant)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().collect()
        })
    }
}

impl KeyValueStore for SqliteScriptStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let raw: Option<String> = self.with_reader(|conn| {
            conn.query_row("SELECT value_json FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)
        })?;
        raw.map(|text| serde_json::from_str(&text).map_err(|e| ReplayError::Database(e.to_string())))
            .transpose()
    }

    fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let now = system_time_unix();
        self.send(|reply| WriteCmd::SetValue {
            key: key.to_string(),
            value,
            now,
            reply,
        })
    }
}

const SELECT_VARIANT: &str = "SELECT id, name, tag, source_id, notes, digest, events_json, captures_json, created_at FROM scripts";

fn row_to_variant(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<ScriptVariant>> {
    let events_json: String = row.get(6)?;
    let captures_json: String = row.get(7)?;
    let id: i64 = row.get(0)?;
    let decoded = serde_json::from_str::<Vec<Event>>(&events_json).and_then(|events| {
        serde_json::from_str::<Vec<Capture>>(&captures_json).map(|captures| (events, captures))
    });
    let (events, captures) = match decoded {
        Ok(parts) => parts,
        Err(err) => {
            return Ok(Err(ReplayError::Database(format!(
                "script {id} has undecodable content: {err}"
            ))))
        }
    };
    Ok(Ok(ScriptVariant {
        id,
        name: row.get(1)?,
        tag: row.get(2)?,
        source_id: row.get(3)?,
        notes: row.get(4)?,
        digest: row.get(5)?,
        events,
        captures,
        created_at: row.get(8)?,
    }))
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in MIGRATIONS {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "script_store.migration.applied",
            json!({ "version": version }),
        );
    }
    Ok(())
}

fn insert_script(conn: &Connection, request: &SaveScriptRequest, now: i64) -> StoreResult<i64> {
    let events_json =
        serde_json::to_string(&request.events).map_err(|e| ReplayError::Database(e.to_string()))?;
    let captures_json = serde_json::to_string(&request.captures)
        .map_err(|e| ReplayError::Database(e.to_string()))?;
    let params_json = request
        .params
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| ReplayError::Database(e.to_string()))?;
    conn.execute(
        "INSERT INTO scripts(name, tag, source_id, notes, events_json, captures_json, params_json, digest, event_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            request.name,
            request.tag,
            request.source_id,
            request.notes,
            events_json,
            captures_json,
            params_json,
            content_digest(&request.events),
            request.events.len() as i64,
            now,
        ],
    )
    .map_err(db_err)?;
    Ok(conn.last_insert_rowid())
}

fn upsert_value(conn: &Connection, key: &str, value: &Value, now: i64) -> StoreResult<()> {
    let text = serde_json::to_string(value).map_err(|e| ReplayError::Database(e.to_string()))?;
    conn.execute(
        "INSERT INTO kv(key, value_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        params![key, text, now],
    )
    .map_err(db_err)?;
    Ok(())
}

fn db_err(error: rusqlite::Error) -> ReplayError {
    ReplayError::Database(error.to_string())
}

pub fn system_time_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use tempfile::TempDir;

    fn temp_store() -> (SqliteScriptStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("scripts.sqlite");
        (SqliteScriptStore::open(&db).expect("open store"), dir)
    }

    fn events() -> Vec<Event> {
        let mut click = Event::new(EventKind::Dom, 10);
        click.meta.id = "event0".to_string();
        vec![click]
    }

    #[test]
    fn newest_variant_wins_and_variants_keep_their_tags() {
        let (store, _dir) = temp_store();
        let first = store
            .save_script(SaveScriptRequest {
                name: "login".to_string(),
                events: events(),
                tag: "original".to_string(),
                ..SaveScriptRequest::default()
            })
            .expect("save original");
        store
            .save_script(SaveScriptRequest {
                name: "login".to_string(),
                events: Vec::new(),
                source_id: Some(first),
                tag: "final".to_string(),
                notes: "trimmed".to_string(),
                ..SaveScriptRequest::default()
            })
            .expect("save final");

        let script = store.get_script("login").expect("get");
        assert!(script.events.is_empty());
        assert!(script
            .annotations
            .iter()
            .any(|a| a.key == "notes" && a.value == "trimmed"));

        let tags = store
            .list_variants("login")
            .expect("list")
            .into_iter()
            .map(|v| v.tag)
            .collect::<Vec<_>>();
        assert_eq!(tags, vec!["original", "final"]);
    }

    #[test]
    fn missing_script_is_reported_by_name() {
        let (store, _dir) = temp_store();
        let err = store.get_script("nope").expect_err("missing");
        assert!(matches!(err, ReplayError::ScriptNotFound(name) if name == "nope"));
    }

    #[test]
    fn key_values_overwrite_and_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("scripts.sqlite");
        {
            let store = SqliteScriptStore::open(&db).expect("open");
            store.set("scriptName", json!("login")).expect("set");
            store.set("scriptName", json!("checkout")).expect("overwrite");
        }
        let reopened = SqliteScriptStore::open(&db).expect("reopen");
        assert_eq!(reopened.get("scriptName").expect("get"), Some(json!("checkout")));
        assert_eq!(reopened.get("missing").expect("get"), None);
    }

    #[test]
    fn digest_tracks_event_content() {
        let a = events();
        let mut b = events();
        assert_eq!(content_digest(&a), content_digest(&b));
        b[0].timing.wait_time = 5;
        assert_ne!(content_digest(&a), content_digest(&b));
        assert_eq!(content_digest(&a).len(), 64);
    }

    #[test]
    fn open_rejects_zero_byte_file() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("scripts.sqlite");
        std::fs::write(&db, b"").expect("create zero-byte file");
        match SqliteScriptStore::open(&db) {
            Err(ReplayError::Database(msg)) => assert!(msg.contains("0 bytes"), "unexpected: {msg}"),
            Err(e) => panic!("expected Database error, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }
}
