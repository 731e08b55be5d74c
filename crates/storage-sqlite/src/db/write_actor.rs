//! Single writer thread. Every write job runs inside an immediate
//! transaction on one dedicated connection, so writes never interleave.

use diesel::sqlite::SqliteConnection;
use log::error;
use tokio::sync::{mpsc, oneshot};

use sitesync_core::errors::{DatabaseError, Error, Result};

use super::DbPool;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<Job>,
}

enum TxError {
    Job(Error),
    Diesel(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Diesel(err)
    }
}

fn run_in_transaction<F, T>(conn: &mut SqliteConnection, job: F) -> Result<T>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T>,
{
    conn.immediate_transaction::<T, TxError, _>(|tx| job(tx).map_err(TxError::Job))
        .map_err(|err| match err {
            TxError::Job(err) => err,
            TxError::Diesel(err) => StorageError::from(err).into(),
        })
}

fn writer_stopped() -> Error {
    Error::Database(DatabaseError::Internal(
        "Database writer is not running".to_string(),
    ))
}

impl WriteHandle {
    /// Run `job` on the writer connection inside one transaction. An `Err`
    /// from the job rolls everything back.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: Job = Box::new(move |conn| {
            let _ = reply_tx.send(run_in_transaction(conn, job));
        });
        self.tx.send(wrapped).map_err(|_| writer_stopped())?;
        reply_rx.await.map_err(|_| writer_stopped())?
    }
}

pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let spawned = std::thread::Builder::new()
        .name("sitesync-db-writer".to_string())
        .spawn(move || {
            let mut conn = match pool.get() {
                Ok(conn) => conn,
                Err(err) => {
                    error!("[Storage] Writer could not acquire a connection: {}", err);
                    return;
                }
            };
            while let Some(job) = rx.blocking_recv() {
                job(&mut *conn);
            }
        });
    if let Err(err) = spawned {
        error!("[Storage] Failed to start writer thread: {}", err);
    }
    WriteHandle { tx }
}
