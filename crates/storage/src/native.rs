use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use rusqlite::{params_from_iter, Connection};
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, trace};

use crate::migrate::migrate;
use crate::value::{FromRow, Row, SqlValue, ToSql};
use crate::{Database, Statement, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_READERS: usize = 4;
const WRITER_THREAD: &str = "perch-storage-writer";

enum Job {
    Execute {
        statement: Statement,
        reply: oneshot::Sender<Result<u64, StorageError>>,
    },
    Transaction {
        statements: Vec<Statement>,
        reply: oneshot::Sender<Result<u64, StorageError>>,
    },
}

/// SQLite behind one writer thread and a small pool of reader connections.
///
/// Every write goes through the writer thread in submission order, so writes
/// never contend with each other for the database lock. Reads run on the
/// blocking pool and may proceed concurrently with a write (WAL mode).
#[derive(Debug)]
pub struct NativeDatabase {
    path: PathBuf,
    writer: Sender<Job>,
    readers: Arc<ReaderPool>,
}

impl NativeDatabase {
    pub(crate) async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let setup_path = path.clone();

        let connection = task::spawn_blocking(move || {
            let mut connection = connect(&setup_path)?;
            connection
                .pragma_update(None, "journal_mode", "WAL")
                .map_err(|error| open_failed(&setup_path, error))?;
            migrate(&mut connection)?;
            Ok::<_, StorageError>(connection)
        })
        .await
        .map_err(|error| open_failed(&path, error))??;

        let (writer, jobs) = mpsc::channel();
        let writer_path = path.clone();
        thread::Builder::new()
            .name(WRITER_THREAD.to_string())
            .spawn(move || run_writer(writer_path, connection, jobs))
            .map_err(|error| open_failed(&path, error))?;

        debug!(path = %path.display(), "database opened");
        Ok(Self {
            readers: Arc::new(ReaderPool::new(path.clone())),
            path,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn submit(
        &self,
        job: impl FnOnce(oneshot::Sender<Result<u64, StorageError>>) -> Job,
    ) -> Result<u64, StorageError> {
        let (reply, response) = oneshot::channel();
        self.writer
            .send(job(reply))
            .map_err(|_| StorageError::WriterClosed)?;
        response.await.map_err(|_| StorageError::WriterClosed)?
    }
}

impl Database for NativeDatabase {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError> {
        let statement = Statement::new(sql, params);
        self.submit(|reply| Job::Execute { statement, reply }).await
    }

    async fn transaction(&self, statements: Vec<Statement>) -> Result<u64, StorageError> {
        if statements.is_empty() {
            return Ok(0);
        }
        self.submit(|reply| Job::Transaction { statements, reply })
            .await
    }

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError> {
        let statement = Statement::new(sql, params);
        let readers = self.readers.clone();
        let rows = task::spawn_blocking(move || {
            readers.with(|connection| select(connection, &statement))
        })
        .await
        .map_err(|error| StorageError::Query(format!("read task failed: {error}")))??;

        rows.iter().map(T::from_row).collect()
    }

    async fn query_one<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError> {
        self.query(sql, params)
            .await?
            .into_iter()
            .next()
            .ok_or(StorageError::NotFound)
    }
}

fn run_writer(path: PathBuf, mut connection: Connection, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Execute { statement, reply } => {
                let _ = reply.send(run(&connection, &statement));
            }
            Job::Transaction { statements, reply } => {
                let _ = reply.send(run_all(&mut connection, &statements));
            }
        }
    }
    debug!(path = %path.display(), "storage writer stopped");
}

fn run(connection: &Connection, statement: &Statement) -> Result<u64, StorageError> {
    trace!(sql = %statement.sql, "execute");
    connection
        .execute(&statement.sql, params_from_iter(rusqlite_params(statement)))
        .map(|changed| changed as u64)
        .map_err(query_failed)
}

fn run_all(connection: &mut Connection, statements: &[Statement]) -> Result<u64, StorageError> {
    let tx = connection.transaction().map_err(query_failed)?;
    let mut changed = 0;
    for statement in statements {
        changed += run(&tx, statement)?;
    }
    tx.commit().map_err(query_failed)?;
    Ok(changed)
}

fn select(connection: &Connection, statement: &Statement) -> Result<Vec<Row>, StorageError> {
    let mut prepared = connection
        .prepare_cached(&statement.sql)
        .map_err(query_failed)?;
    let columns = prepared.column_count();
    let mut rows = prepared
        .query(params_from_iter(rusqlite_params(statement)))
        .map_err(query_failed)?;

    let mut output = Vec::new();
    while let Some(row) = rows.next().map_err(query_failed)? {
        let values = (0..columns)
            .map(|index| row.get_ref(index).map(SqlValue::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_failed)?;
        output.push(Row::new(values));
    }
    Ok(output)
}

fn rusqlite_params(statement: &Statement) -> Vec<rusqlite::types::Value> {
    statement
        .params
        .iter()
        .cloned()
        .map(SqlValue::into_rusqlite)
        .collect()
}

fn connect(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| open_failed(path, error))?;
    }
    let connection = Connection::open(path).map_err(|error| open_failed(path, error))?;
    connection
        .busy_timeout(BUSY_TIMEOUT)
        .map_err(|error| open_failed(path, error))?;
    Ok(connection)
}

fn open_failed(path: &Path, error: impl ToString) -> StorageError {
    StorageError::Open {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

fn query_failed(error: rusqlite::Error) -> StorageError {
    StorageError::Query(error.to_string())
}

/// Idle read connections, reused across queries.
#[derive(Debug)]
struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let pooled = self.idle().pop();
        let connection = match pooled {
            Some(connection) => connection,
            None => connect(&self.path)?,
        };
        let result = f(&connection);

        let mut idle = self.idle();
        if idle.len() < MAX_IDLE_READERS {
            idle.push(connection);
        }
        result
    }
}
