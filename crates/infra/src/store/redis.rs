//! Redis-backed store (optional, feature `redis`).
//!
//! One `redis::Connection` per store, i.e. per coordinator. The connection is
//! opened lazily and dropped after any transient failure so the next call
//! reconnects; fatal failures leave it to the coordinator to halt.

use redis::{Connection, ErrorKind, RedisError, Script};
use tracing::{debug, info, instrument};

use relq_core::keys::{NODES_KEY, node_queues_key};

use super::scripts::{LPOP_RPUSH_SRC_DEST, MRPOP_LPUSH_SRC_DEST};
use super::{DrainBatch, QueueStore, ScheduledEntry, StoreError, Transfer};
use crate::config::RedisOptions;

/// SHA1 digests the scripts are registered under.
#[derive(Debug, Clone)]
struct ScriptHashes {
    transfer: String,
    drain: String,
}

impl ScriptHashes {
    fn compute() -> Self {
        Self {
            transfer: Script::new(MRPOP_LPUSH_SRC_DEST).get_hash().to_string(),
            drain: Script::new(LPOP_RPUSH_SRC_DEST).get_hash().to_string(),
        }
    }
}

pub struct RedisStore {
    client: redis::Client,
    options: RedisOptions,
    conn: Option<Connection>,
    scripts: ScriptHashes,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.options.redacted_url())
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl RedisStore {
    /// Create a store for `options`. No connection is made until first use.
    pub fn open(options: RedisOptions) -> Result<Self, StoreError> {
        let client = redis::Client::open(options.connection_url())
            .map_err(|e| StoreError::fatal(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client,
            options,
            conn: None,
            scripts: ScriptHashes::compute(),
        })
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = match self.options.connect_timeout {
            Some(timeout) => self.client.get_connection_with_timeout(timeout),
            None => self.client.get_connection(),
        };
        conn.map_err(|e| classify("connect", &e))
    }

    /// Run `f` on the live connection, reconnecting first if needed.
    fn exec<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut Connection, &ScriptHashes) -> redis::RedisResult<T>,
    ) -> Result<T, StoreError> {
        if self.conn.is_none() {
            self.conn = Some(self.connect()?);
            debug!(url = %self.options.redacted_url(), "redis connection established");
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(StoreError::transient("redis connection unavailable"));
        };

        match f(conn, &self.scripts) {
            Ok(value) => Ok(value),
            Err(err) => {
                let err = classify(op, &err);
                if !err.is_fatal() {
                    self.conn = None;
                }
                Err(err)
            }
        }
    }
}

/// Map a Redis error onto the transient/fatal split.
fn classify(op: &str, err: &RedisError) -> StoreError {
    let transient = err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || matches!(
            err.kind(),
            ErrorKind::BusyLoadingError
                | ErrorKind::TryAgain
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
        );

    if transient {
        StoreError::transient(format!("{op} failed: {err}"))
    } else {
        StoreError::fatal(format!("{op} failed: {err}"))
    }
}

impl QueueStore for RedisStore {
    fn bootstrap(&mut self) -> Result<(), StoreError> {
        let loaded = self.exec("SCRIPT LOAD", |conn, _| {
            let transfer: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(MRPOP_LPUSH_SRC_DEST)
                .query(conn)?;
            let drain: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(LPOP_RPUSH_SRC_DEST)
                .query(conn)?;
            Ok((transfer, drain))
        })?;

        if loaded.0 != self.scripts.transfer || loaded.1 != self.scripts.drain {
            return Err(StoreError::fatal(format!(
                "script digest mismatch: server returned {} / {}",
                loaded.0, loaded.1
            )));
        }

        info!(url = %self.options.redacted_url(), "redis scripts registered");
        Ok(())
    }

    #[instrument(
        level = "debug",
        skip(self, transfer),
        fields(source = transfer.source, count = transfer.count),
        err
    )]
    fn atomic_transfer(&mut self, transfer: &Transfer<'_>) -> Result<Vec<String>, StoreError> {
        self.exec("dequeue", |conn, scripts| {
            let mut evalsha = redis::cmd("EVALSHA");
            evalsha
                .arg(&scripts.transfer)
                .arg(2)
                .arg(transfer.source)
                .arg(transfer.destination)
                .arg(transfer.count);

            match transfer.presence {
                None => evalsha.query(conn),
                Some(presence) => {
                    // MULTI/EXEC: presence and the move land together or not at all.
                    let (moved,): (Vec<String>,) = redis::pipe()
                        .atomic()
                        .cmd("SADD")
                        .arg(NODES_KEY)
                        .arg(presence.node_id.as_str())
                        .ignore()
                        .cmd("SADD")
                        .arg(node_queues_key(presence.node_id))
                        .arg(presence.queue.as_str())
                        .ignore()
                        .add_command(evalsha)
                        .query(conn)?;
                    Ok(moved)
                }
            }
        })
    }

    fn remove_last(&mut self, list: &str, value: &str) -> Result<usize, StoreError> {
        self.exec("LREM", |conn, _| {
            redis::cmd("LREM").arg(list).arg(-1).arg(value).query(conn)
        })
    }

    #[instrument(level = "debug", skip(self), err)]
    fn drain_batch(
        &mut self,
        source: &str,
        destination: &str,
        limit: usize,
    ) -> Result<DrainBatch, StoreError> {
        let (remaining, moved): (usize, usize) = self.exec("enqueue in-progress", |conn, scripts| {
            redis::cmd("EVALSHA")
                .arg(&scripts.drain)
                .arg(2)
                .arg(source)
                .arg(destination)
                .arg(limit)
                .query(conn)
        })?;

        Ok(DrainBatch { remaining, moved })
    }

    #[instrument(
        level = "debug",
        skip(self, entry),
        fields(set = entry.set, score = entry.score),
        err
    )]
    fn schedule(&mut self, entry: &ScheduledEntry<'_>) -> Result<(), StoreError> {
        self.exec("schedule", |conn, _| {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("ZADD")
                .arg(entry.set)
                .arg(entry.score)
                .arg(entry.member)
                .ignore();

            if let Some(trim) = entry.trim {
                pipe.cmd("ZREMRANGEBYSCORE")
                    .arg(entry.set)
                    .arg("-inf")
                    .arg(format!("({}", trim.min_score))
                    .ignore();
                pipe.cmd("ZREMRANGEBYRANK")
                    .arg(entry.set)
                    .arg(0)
                    .arg(-(trim.max_len as i64) - 1)
                    .ignore();
            }

            if let Some((list, value)) = entry.release {
                pipe.cmd("LREM").arg(list).arg(-1).arg(value).ignore();
            }

            pipe.query::<()>(conn)
        })
    }
}
