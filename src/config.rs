//! Persistent typed key/value configuration backed by sqlite.
//!
//! Keys are dot-separated namespaces (`irc.server`, `bot.prefix`). Values
//! are stored as strings; arrays are encoded `a;;b;;c` and maps as JSON.
//! Reads never fail — a missing key yields the caller's default — and
//! writes persist synchronously. Scoped app passwords (admin HTTP gate,
//! CLI connector) live in a separate bcrypt-hashed table and never flow
//! through the read API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ConfigError;

/// Delimiter for array-valued config entries.
pub const ARRAY_SEP: &str = ";;";

/// Current schema version, stored under `db.version`.
const SCHEMA_VERSION: i64 = 1;

/// Default bcrypt cost for scoped passwords.
const DEFAULT_BCRYPT_COST: u32 = 10;

/// Typed config store over `config(key, value)`.
pub struct Config {
    conn: Mutex<Connection>,
}

impl Config {
    /// Open (creating if needed) the config database at `path` and apply
    /// migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let conn = Connection::open(path)?;
        let cfg = Self {
            conn: Mutex::new(conn),
        };
        cfg.migrate()?;
        Ok(cfg)
    }

    /// In-memory store, used by tests and the mock connector harness.
    pub fn open_in_memory() -> Result<Self, ConfigError> {
        let cfg = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        cfg.migrate()?;
        Ok(cfg)
    }

    fn migrate(&self) -> Result<(), ConfigError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS apppass (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                scope        TEXT NOT NULL,
                encoded_pass TEXT NOT NULL,
                cost         INTEGER NOT NULL
            );",
        )?;
        let version: i64 = conn
            .query_row(
                "SELECT value FROM config WHERE key = 'db.version'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        match version {
            0 => {
                conn.execute(
                    "INSERT OR REPLACE INTO config (key, value) VALUES ('db.version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            SCHEMA_VERSION => {}
            other => return Err(ConfigError::SchemaVersion(other)),
        }
        Ok(())
    }

    /// Keys that gate privileged surfaces are write-only.
    fn is_secret(key: &str) -> bool {
        key.ends_with(".password") || key == "password"
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        if Self::is_secret(key) {
            return None;
        }
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }

    /// String value of `key`, or `default` when absent.
    pub fn get(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_raw(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get_raw(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_raw(key)
            .and_then(|v| match v.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            })
            .unwrap_or(default)
    }

    /// Array value split on `;;`. An empty stored string is an empty array.
    pub fn get_array(&self, key: &str, default: Vec<String>) -> Vec<String> {
        match self.get_raw(key) {
            Some(v) if v.is_empty() => Vec::new(),
            Some(v) => v.split(ARRAY_SEP).map(str::to_string).collect(),
            None => default,
        }
    }

    /// Map value stored as JSON. Malformed entries fall back to the default.
    pub fn get_map(&self, key: &str, default: HashMap<String, String>) -> HashMap<String, String> {
        self.get_raw(key)
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or(default)
    }

    /// Durably write `key`. The only config operation that can fail.
    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn set_int(&self, key: &str, value: i64) -> Result<(), ConfigError> {
        self.set(key, &value.to_string())
    }

    pub fn set_array(&self, key: &str, value: &[String]) -> Result<(), ConfigError> {
        self.set(key, &value.join(ARRAY_SEP))
    }

    pub fn set_map(&self, key: &str, value: &HashMap<String, String>) -> Result<(), ConfigError> {
        self.set(key, &serde_json::to_string(value).unwrap_or_default())
    }

    /// Delete `key`; removing an absent key is not an error.
    pub fn unset(&self, key: &str) -> Result<(), ConfigError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Store a bcrypt-hashed password for `scope`, replacing any previous
    /// entry for that scope.
    pub fn set_password(&self, scope: &str, plain: &str) -> Result<(), ConfigError> {
        let cost = self.get_int("bot.bcrypt_cost", DEFAULT_BCRYPT_COST as i64) as u32;
        let encoded = bcrypt::hash(plain, cost)?;
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM apppass WHERE scope = ?1", params![scope])?;
        conn.execute(
            "INSERT INTO apppass (scope, encoded_pass, cost) VALUES (?1, ?2, ?3)",
            params![scope, encoded, cost],
        )?;
        Ok(())
    }

    /// Verify `candidate` against any stored password for `scope`.
    pub fn check_password(&self, scope: &str, candidate: &str) -> bool {
        let hashes: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = match conn.prepare("SELECT encoded_pass FROM apppass WHERE scope = ?1")
            {
                Ok(stmt) => stmt,
                Err(_) => return false,
            };
            let collected = match stmt.query_map(params![scope], |row| row.get(0)) {
                Ok(rows) => rows.flatten().collect(),
                Err(_) => return false,
            };
            collected
        };
        hashes
            .iter()
            .any(|h| bcrypt::verify(candidate, h).unwrap_or(false))
    }

    /// Run a plugin-owned statement against the shared database. Plugins
    /// own their namespaced tables; the kernel does not read them.
    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}
