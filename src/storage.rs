use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::model::{Code, Config, ErrorReport, TestCase};

/// Persistent records behind the dispatcher.
pub trait RecordStore: Send + Sync {
    fn get_config(&self, config_id: &str) -> Result<Option<Config>>;

    fn get_code(&self, code_id: &str) -> Result<Option<Code>>;

    fn get_test_case(&self, test_id: &str) -> Result<Option<TestCase>>;

    /// Append `report` to the code's error history and bump its error count.
    ///
    /// The code is marked broken once the count exceeds `threshold` and stays
    /// broken. Returns the updated code record.
    fn record_error(&self, code_id: &str, report: &ErrorReport, threshold: u32) -> Result<Code>;

    fn put_config(&self, config: &Config) -> Result<()>;

    fn put_code(&self, code: &Code) -> Result<()>;

    fn put_test_case(&self, test_case: &TestCase) -> Result<()>;
}

fn trips_breaker(error_count: u32, threshold: u32) -> bool {
    error_count > threshold
}

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open record database {db_path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS config (
              config_id TEXT PRIMARY KEY,
              code_release TEXT NOT NULL,
              code_unittest TEXT NOT NULL DEFAULT '',
              code_gray TEXT NOT NULL DEFAULT '',
              percentage INTEGER NOT NULL DEFAULT 0,
              status TEXT NOT NULL,
              secret TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS code (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              code_id TEXT NOT NULL UNIQUE,
              lang TEXT NOT NULL,
              rules TEXT NOT NULL DEFAULT '[]',
              params TEXT NOT NULL DEFAULT '[]',
              content TEXT NOT NULL,
              is_broken INTEGER NOT NULL DEFAULT 0,
              err_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS unittest (
              test_id TEXT PRIMARY KEY,
              input TEXT NOT NULL,
              output TEXT NOT NULL,
              code_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS error_report (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              code_ref INTEGER NOT NULL REFERENCES code(id),
              err_time INTEGER NOT NULL,
              message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_error_report_code ON error_report(code_ref);
            "#,
        )?;
        Ok(())
    }

    /// Error reports for a code version, oldest first.
    pub fn error_reports(&self, code_id: &str) -> Result<Vec<ErrorReport>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT r.err_time, r.message FROM error_report r
            JOIN code c ON c.id = r.code_ref
            WHERE c.code_id = ?1 ORDER BY r.id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![code_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ErrorReport {
                time: row.get(0)?,
                message: row.get(1)?,
            });
        }
        Ok(out)
    }
}

const CODE_COLUMNS: &str = "code_id, lang, rules, params, content, is_broken, err_count";

fn code_from_row(row: &Row<'_>) -> Result<Code> {
    let code_id: String = row.get(0)?;
    let rules: String = row.get(2)?;
    let params: String = row.get(3)?;
    let err_count: i64 = row.get(6)?;
    Ok(Code {
        rules: serde_json::from_str(&rules)
            .with_context(|| format!("corrupt rules for code {code_id}"))?,
        params: serde_json::from_str(&params)
            .with_context(|| format!("corrupt params for code {code_id}"))?,
        lang: row.get(1)?,
        content: row.get(4)?,
        is_broken: row.get(5)?,
        error_count: u32::try_from(err_count)
            .map_err(|_| anyhow!("corrupt error count for code {code_id}"))?,
        code_id,
    })
}

fn select_code(conn: &Connection, code_id: &str) -> Result<Option<Code>> {
    let mut stmt = conn.prepare(&format!("SELECT {CODE_COLUMNS} FROM code WHERE code_id = ?1"))?;
    let mut rows = stmt.query(params![code_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(code_from_row(row)?)),
        None => Ok(None),
    }
}

impl RecordStore for SqliteRecordStore {
    fn get_config(&self, config_id: &str) -> Result<Option<Config>> {
        let conn = self.lock();
        let config = conn
            .query_row(
                r#"
                SELECT config_id, code_release, code_unittest, code_gray, percentage, status, secret
                FROM config WHERE config_id = ?1
                "#,
                params![config_id],
                |row| {
                    Ok(Config {
                        config_id: row.get(0)?,
                        released_code: row.get(1)?,
                        test_code: row.get(2)?,
                        gray_release_code: row.get(3)?,
                        percentage: row.get(4)?,
                        status: row.get(5)?,
                        secret: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    fn get_code(&self, code_id: &str) -> Result<Option<Code>> {
        select_code(&self.lock(), code_id)
    }

    fn get_test_case(&self, test_id: &str) -> Result<Option<TestCase>> {
        let conn = self.lock();
        let test_case = conn
            .query_row(
                "SELECT test_id, input, output, code_id FROM unittest WHERE test_id = ?1",
                params![test_id],
                |row| {
                    Ok(TestCase {
                        test_id: row.get(0)?,
                        input: row.get(1)?,
                        output: row.get(2)?,
                        code_id: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(test_case)
    }

    fn record_error(&self, code_id: &str, report: &ErrorReport, threshold: u32) -> Result<Code> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let (code_ref, err_count, was_broken): (i64, i64, bool) = tx
            .query_row(
                "SELECT id, err_count, is_broken FROM code WHERE code_id = ?1",
                params![code_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| anyhow!("code record {code_id} does not exist"))?;

        let err_count = u32::try_from(err_count + 1)
            .map_err(|_| anyhow!("corrupt error count for code {code_id}"))?;
        let is_broken = was_broken || trips_breaker(err_count, threshold);

        tx.execute(
            "INSERT INTO error_report(code_ref, err_time, message) VALUES (?1, ?2, ?3)",
            params![code_ref, report.time, report.message],
        )?;
        tx.execute(
            "UPDATE code SET err_count = ?1, is_broken = ?2 WHERE id = ?3",
            params![err_count, is_broken, code_ref],
        )?;

        let code = select_code(&tx, code_id)?
            .ok_or_else(|| anyhow!("code record {code_id} vanished"))?;
        tx.commit()?;
        Ok(code)
    }

    fn put_config(&self, config: &Config) -> Result<()> {
        self.lock().execute(
            r#"
            INSERT OR REPLACE INTO config(
                config_id, code_release, code_unittest, code_gray, percentage, status, secret
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                config.config_id,
                config.released_code,
                config.test_code,
                config.gray_release_code,
                config.percentage,
                config.status,
                config.secret
            ],
        )?;
        Ok(())
    }

    fn put_code(&self, code: &Code) -> Result<()> {
        let rules = serde_json::to_string(&code.rules)?;
        let params_json = serde_json::to_string(&code.params)?;
        self.lock().execute(
            r#"
            INSERT INTO code(code_id, lang, rules, params, content, is_broken, err_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(code_id) DO UPDATE SET
              lang = excluded.lang,
              rules = excluded.rules,
              params = excluded.params,
              content = excluded.content,
              is_broken = excluded.is_broken,
              err_count = excluded.err_count
            "#,
            params![
                code.code_id,
                code.lang,
                rules,
                params_json,
                code.content,
                code.is_broken,
                code.error_count
            ],
        )?;
        Ok(())
    }

    fn put_test_case(&self, test_case: &TestCase) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO unittest(test_id, input, output, code_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                test_case.test_id,
                test_case.input,
                test_case.output,
                test_case.code_id
            ],
        )?;
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryRecords {
    configs: HashMap<String, Config>,
    codes: HashMap<String, Code>,
    test_cases: HashMap<String, TestCase>,
    reports: Vec<(String, ErrorReport)>,
}

/// Map-backed store for tests and the script runner.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<InMemoryRecords>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryRecords> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn error_reports(&self, code_id: &str) -> Vec<ErrorReport> {
        self.lock()
            .reports
            .iter()
            .filter(|(id, _)| id == code_id)
            .map(|(_, report)| report.clone())
            .collect()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get_config(&self, config_id: &str) -> Result<Option<Config>> {
        Ok(self.lock().configs.get(config_id).cloned())
    }

    fn get_code(&self, code_id: &str) -> Result<Option<Code>> {
        Ok(self.lock().codes.get(code_id).cloned())
    }

    fn get_test_case(&self, test_id: &str) -> Result<Option<TestCase>> {
        Ok(self.lock().test_cases.get(test_id).cloned())
    }

    fn record_error(&self, code_id: &str, report: &ErrorReport, threshold: u32) -> Result<Code> {
        let mut records = self.lock();
        let code = records
            .codes
            .get_mut(code_id)
            .ok_or_else(|| anyhow!("code record {code_id} does not exist"))?;
        code.error_count = code.error_count.saturating_add(1);
        code.is_broken = code.is_broken || trips_breaker(code.error_count, threshold);
        let updated = code.clone();
        records.reports.push((code_id.to_string(), report.clone()));
        Ok(updated)
    }

    fn put_config(&self, config: &Config) -> Result<()> {
        self.lock()
            .configs
            .insert(config.config_id.clone(), config.clone());
        Ok(())
    }

    fn put_code(&self, code: &Code) -> Result<()> {
        self.lock().codes.insert(code.code_id.clone(), code.clone());
        Ok(())
    }

    fn put_test_case(&self, test_case: &TestCase) -> Result<()> {
        self.lock()
            .test_cases
            .insert(test_case.test_id.clone(), test_case.clone());
        Ok(())
    }
}
