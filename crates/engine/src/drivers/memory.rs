//! In-process driver
//!
//! Keeps tables, records and the statement log in memory. Clones share the
//! same state, so a test can keep a handle while the runner owns the driver.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use strata_core::{MigrationError, MigrationResult};

use super::{Dialect, Driver};
use crate::definitions::ExecutionRecord;
use crate::diff::SchemaSnapshot;

#[derive(Debug, Clone, Default)]
struct Store {
    tables: BTreeSet<String>,
    records: Vec<ExecutionRecord>,
    statements: Vec<String>,
    schema: SchemaSnapshot,
    set_up: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    store: Store,
    /// Copy of the store taken at `BEGIN`
    savepoint: Option<Store>,
    locked: bool,
    fail_on: Vec<String>,
}

/// Driver backed by process memory
///
/// `CREATE TABLE <name>` and `DROP TABLE <name>` statements are tracked so
/// tests can observe their effects; every other statement is only logged.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
    transactional: bool,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// A driver with transactional DDL, like PostgreSQL
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            transactional: true,
        }
    }

    /// A driver whose schema changes commit immediately, like MySQL
    pub fn non_transactional() -> Self {
        Self {
            transactional: false,
            ..Self::new()
        }
    }

    /// Make every statement containing `fragment` fail
    pub fn fail_on(self, fragment: impl Into<String>) -> Self {
        self.state().fail_on.push(fragment.into());
        self
    }

    pub fn clear_failures(&self) {
        self.state().fail_on.clear();
    }

    /// Live schema reported to the diff generator
    pub fn with_schema(self, schema: SchemaSnapshot) -> Self {
        self.state().store.schema = schema;
        self
    }

    pub fn tables(&self) -> Vec<String> {
        self.state().store.tables.iter().cloned().collect()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state().store.tables.contains(name)
    }

    /// Statements that took effect, in order
    pub fn statements(&self) -> Vec<String> {
        self.state().store.statements.clone()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.state().store.records.clone()
    }

    /// Insert a record directly, bypassing a run
    pub fn insert_record(&self, record: ExecutionRecord) {
        let mut state = self.state();
        state.store.set_up = true;
        state.store.records.push(record);
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock only happens inside a failing test
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Table name following `keyword`, e.g. `CREATE TABLE IF NOT EXISTS "a"`
fn table_after(statement: &str, keyword: &[&str]) -> Option<String> {
    let mut words = statement.split_whitespace();
    for expected in keyword {
        if !words.next()?.eq_ignore_ascii_case(expected) {
            return None;
        }
    }
    let mut name = words.next()?;
    if name.eq_ignore_ascii_case("if") {
        for word in words.by_ref() {
            if word.eq_ignore_ascii_case("exists") {
                break;
            }
        }
        name = words.next()?;
    }
    let name = name
        .split('(')
        .next()
        .unwrap_or(name)
        .trim_matches(|c| c == '"' || c == '`' || c == ';');
    (!name.is_empty()).then(|| name.to_string())
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn setup(&mut self) -> MigrationResult<()> {
        self.state().store.set_up = true;
        Ok(())
    }

    async fn lock(&mut self) -> MigrationResult<()> {
        let mut state = self.state();
        if state.locked {
            return Err(MigrationError::driver("migration lock is held by another run"));
        }
        state.locked = true;
        Ok(())
    }

    async fn unlock(&mut self) -> MigrationResult<()> {
        self.state().locked = false;
        Ok(())
    }

    async fn empty_database(&mut self) -> MigrationResult<()> {
        let mut state = self.state();
        let schema = std::mem::take(&mut state.store.schema);
        state.store = Store {
            schema,
            ..Store::default()
        };
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> MigrationResult<u64> {
        let mut state = self.state();
        if let Some(fragment) = state.fail_on.iter().find(|f| statement.contains(f.as_str())) {
            return Err(MigrationError::driver(format!(
                "statement rejected (matched '{}')",
                fragment
            )));
        }

        if let Some(table) = table_after(statement, &["create", "table"]) {
            if !state.store.tables.insert(table.clone()) && !statement.to_lowercase().contains("if not exists") {
                return Err(MigrationError::driver(format!(
                    "relation \"{}\" already exists",
                    table
                )));
            }
        } else if let Some(table) = table_after(statement, &["drop", "table"]) {
            state.store.tables.remove(&table);
        }

        state.store.statements.push(statement.to_string());
        Ok(0)
    }

    async fn applied_migrations(&mut self) -> MigrationResult<Vec<ExecutionRecord>> {
        let state = self.state();
        if !state.store.set_up {
            return Err(MigrationError::driver("migration table does not exist"));
        }
        Ok(state.store.records.clone())
    }

    async fn record_started(&mut self, record: &ExecutionRecord) -> MigrationResult<()> {
        let mut state = self.state();
        if state
            .store
            .records
            .iter()
            .any(|r| r.group == record.group && r.version == record.version)
        {
            return Err(MigrationError::driver(format!(
                "duplicate record for {}/{}",
                record.group, record.version
            )));
        }
        state.store.records.push(record.clone());
        Ok(())
    }

    async fn mark_applied(&mut self, group: &str, version: &str) -> MigrationResult<()> {
        let mut state = self.state();
        let record = state
            .store
            .records
            .iter_mut()
            .find(|r| r.group == group && r.version == version)
            .ok_or_else(|| {
                MigrationError::driver(format!("no record for {}/{}", group, version))
            })?;
        record.ready = true;
        Ok(())
    }

    async fn begin_transaction(&mut self) -> MigrationResult<()> {
        let mut state = self.state();
        if state.savepoint.is_some() {
            return Err(MigrationError::driver("transaction already open"));
        }
        state.savepoint = Some(state.store.clone());
        Ok(())
    }

    async fn commit(&mut self) -> MigrationResult<()> {
        self.state()
            .savepoint
            .take()
            .map(|_| ())
            .ok_or_else(|| MigrationError::driver("no open transaction"))
    }

    async fn rollback(&mut self) -> MigrationResult<()> {
        let mut state = self.state();
        let savepoint = state
            .savepoint
            .take()
            .ok_or_else(|| MigrationError::driver("no open transaction"))?;
        if self.transactional {
            state.store = savepoint;
        } else {
            // Only the record table is transactional; schema changes stay
            let records = savepoint.records;
            state.store.records = records;
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn describe_schema(&mut self) -> MigrationResult<SchemaSnapshot> {
        Ok(self.state().store.schema.clone())
    }

    fn dialect(&self) -> Dialect {
        Dialect::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_extraction() {
        assert_eq!(table_after("CREATE TABLE a (id INT)", &["create", "table"]), Some("a".into()));
        assert_eq!(table_after("create table \"b\"(id int)", &["create", "table"]), Some("b".into()));
        assert_eq!(
            table_after("CREATE TABLE IF NOT EXISTS c (id INT)", &["create", "table"]),
            Some("c".into())
        );
        assert_eq!(table_after("DROP TABLE IF EXISTS d", &["drop", "table"]), Some("d".into()));
        assert_eq!(table_after("INSERT INTO a VALUES (1)", &["create", "table"]), None);
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let mut driver = MemoryDriver::new();
        driver.begin_transaction().await.unwrap();
        driver.execute("CREATE TABLE a (id INT)").await.unwrap();
        assert!(driver.has_table("a"));
        driver.rollback().await.unwrap();
        assert!(!driver.has_table("a"));
        assert!(driver.statements().is_empty());
    }

    #[tokio::test]
    async fn test_non_transactional_rollback_keeps_schema_changes() {
        let mut driver = MemoryDriver::non_transactional();
        driver.begin_transaction().await.unwrap();
        driver.execute("CREATE TABLE a (id INT)").await.unwrap();
        driver.rollback().await.unwrap();
        assert!(driver.has_table("a"));
    }

    #[tokio::test]
    async fn test_failure_injection_and_shared_state() {
        let handle = MemoryDriver::new().fail_on("CREATE TABLE b");
        let mut driver = handle.clone();

        driver.execute("CREATE TABLE a (id INT)").await.unwrap();
        let err = driver.execute("CREATE TABLE b (id INT)").await.unwrap_err();
        assert!(matches!(err, MigrationError::Driver { .. }));

        assert_eq!(handle.tables(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let mut first = MemoryDriver::new();
        let mut second = first.clone();
        first.lock().await.unwrap();
        assert!(second.lock().await.is_err());
        first.unlock().await.unwrap();
        second.lock().await.unwrap();
    }

    #[tokio::test]
    async fn test_records_require_setup() {
        let mut driver = MemoryDriver::new();
        assert!(driver.applied_migrations().await.is_err());
        driver.setup().await.unwrap();
        assert!(driver.applied_migrations().await.unwrap().is_empty());
    }
}
