//! Redis list client over TCP or a Unix socket.
//!
//! One connection, one request pipeline at a time. Connect and every round
//! trip are bounded by `redis.timeout_ms`. Errors that leave the stream in
//! an unknown state drop the connection; the next call reconnects.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::resp::{self, Decoder, RespValue};
use super::{QueueBroker, QueueLengths};
use crate::Item;
use crate::config::{NetworkMode, RedisConfig};
use crate::error::BrokerError;

const READ_CHUNK: usize = 8 * 1024;

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

struct Connection {
    stream: Box<dyn Transport>,
    read_buf: Vec<u8>,
    decoder: Decoder,
}

impl Connection {
    fn new(stream: Box<dyn Transport>) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            decoder: Decoder::default(),
        }
    }

    /// Write all commands, then read exactly one reply per command.
    async fn round_trip(&mut self, commands: &[Vec<u8>]) -> Result<Vec<RespValue>, BrokerError> {
        let request = commands.concat();
        self.stream.write_all(&request).await?;
        self.stream.flush().await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_reply().await?);
        }
        Ok(replies)
    }

    /// Bytes already in `read_buf` are parsed once; large replies are not
    /// rescanned on every read.
    async fn read_reply(&mut self) -> Result<RespValue, BrokerError> {
        loop {
            if let Some((value, used)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.drain(..used);
                return Ok(value);
            }

            self.read_buf.reserve(READ_CHUNK);
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(BrokerError::Disconnected);
            }
        }
    }
}

/// [`QueueBroker`] backed by a Redis server.
pub struct RedisBroker {
    config: RedisConfig,
    conn: Option<Connection>,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("network", &self.config.network)
            .field("host", &self.config.host)
            .field("db", &self.config.db)
            .field("connected", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect and authenticate. Fails if the server is unreachable or
    /// rejects `AUTH`/`SELECT`/`PING`.
    pub async fn connect(config: RedisConfig) -> Result<Self, BrokerError> {
        let conn = open(&config).await?;
        info!(
            network = %config.network,
            host = %config.host,
            db = config.db,
            "Connected to Redis"
        );
        Ok(Self {
            config,
            conn: Some(conn),
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Round-trip `PING`.
    pub async fn ping(&mut self) -> Result<(), BrokerError> {
        let mut replies = self.execute(vec![command(&[b"PING"])]).await?;
        take_reply(&mut replies)?.into_status()?;
        Ok(())
    }

    async fn execute(&mut self, commands: Vec<Vec<u8>>) -> Result<Vec<RespValue>, BrokerError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = open(&self.config).await?;
                info!(host = %self.config.host, "Reconnected to Redis");
                conn
            }
        };

        let timeout_ms = self.config.timeout_ms;
        let result = timeout(self.config.timeout(), conn.round_trip(&commands))
            .await
            .unwrap_or(Err(BrokerError::Timeout { timeout_ms }));

        match &result {
            Err(err) if err.is_connection_lost() => {
                warn!(error = %err, "Dropping Redis connection");
            }
            _ => self.conn = Some(conn),
        }
        result
    }

    /// Run `body` inside `MULTI`/`EXEC` and return the `EXEC` results.
    async fn transaction(&mut self, body: Vec<Vec<u8>>) -> Result<Vec<RespValue>, BrokerError> {
        let queued = body.len();
        let mut commands = Vec::with_capacity(queued + 2);
        commands.push(command(&[b"MULTI"]));
        commands.extend(body);
        commands.push(command(&[b"EXEC"]));

        let mut replies = self.execute(commands).await?;
        let exec = replies.pop();
        for reply in replies {
            reply.into_result()?;
        }
        let results = match exec {
            Some(RespValue::Array(None)) => {
                return Err(BrokerError::Server("transaction aborted".to_string()));
            }
            Some(value) => value.into_array()?,
            None => return Err(BrokerError::Protocol("missing EXEC reply".to_string())),
        };
        if results.len() != queued {
            return Err(BrokerError::Protocol(format!(
                "EXEC returned {} results for {queued} commands",
                results.len()
            )));
        }
        Ok(results)
    }

    async fn pop_range(
        &mut self,
        key: &str,
        stop: i64,
        trim_start: i64,
    ) -> Result<Vec<Item>, BrokerError> {
        let stop = stop.to_string();
        let trim_start = trim_start.to_string();
        let results = self
            .transaction(vec![
                command(&[b"LRANGE", key.as_bytes(), b"0", stop.as_bytes()]),
                command(&[b"LTRIM", key.as_bytes(), trim_start.as_bytes(), b"-1"]),
            ])
            .await?;
        let mut results = results.into_iter();
        let items = take_next(&mut results)?.into_items()?;
        take_next(&mut results)?.into_status()?;
        Ok(items)
    }

    async fn push(&mut self, verb: &[u8], key: &str, items: &[&[u8]]) -> Result<(), BrokerError> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(items.len() + 2);
        args.push(verb);
        args.push(key.as_bytes());
        args.extend_from_slice(items);
        let mut replies = self.execute(vec![command(&args)]).await?;
        take_reply(&mut replies)?.into_integer()?;
        Ok(())
    }
}

impl QueueBroker for RedisBroker {
    async fn lengths(&mut self, in_key: &str, out_key: &str) -> Result<QueueLengths, BrokerError> {
        let replies = self
            .execute(vec![
                command(&[b"LLEN", in_key.as_bytes()]),
                command(&[b"LLEN", out_key.as_bytes()]),
            ])
            .await?;
        let mut replies = replies.into_iter();
        Ok(QueueLengths {
            in_len: take_next(&mut replies)?.into_integer()?,
            out_len: take_next(&mut replies)?.into_integer()?,
        })
    }

    async fn pop_front(&mut self, key: &str, count: u64) -> Result<Vec<Item>, BrokerError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let count = count.min(i64::MAX as u64) as i64;
        let items = self.pop_range(key, count - 1, count).await?;
        debug!(items = items.len(), "Popped from head");
        Ok(items)
    }

    async fn pop_all(&mut self, key: &str) -> Result<Vec<Item>, BrokerError> {
        // LTRIM with start past stop empties the list.
        let results = self
            .transaction(vec![
                command(&[b"LRANGE", key.as_bytes(), b"0", b"-1"]),
                command(&[b"LTRIM", key.as_bytes(), b"1", b"0"]),
            ])
            .await?;
        let mut results = results.into_iter();
        let items = take_next(&mut results)?.into_items()?;
        take_next(&mut results)?.into_status()?;
        Ok(items)
    }

    async fn push_back(&mut self, key: &str, items: &[Item]) -> Result<(), BrokerError> {
        if items.is_empty() {
            return Ok(());
        }
        let args: Vec<&[u8]> = items.iter().map(Vec::as_slice).collect();
        self.push(b"RPUSH", key, &args).await
    }

    async fn push_front(&mut self, key: &str, items: &[Item]) -> Result<(), BrokerError> {
        if items.is_empty() {
            return Ok(());
        }
        // LPUSH inserts one by one at the head, so feed it the batch reversed.
        let args: Vec<&[u8]> = items.iter().rev().map(Vec::as_slice).collect();
        self.push(b"LPUSH", key, &args).await
    }
}

async fn open(config: &RedisConfig) -> Result<Connection, BrokerError> {
    let addr = config.host.clone();
    let stream: Box<dyn Transport> = match config.network {
        NetworkMode::Tcp => {
            let stream = timeout(config.timeout(), TcpStream::connect(&addr))
                .await
                .map_err(|_| BrokerError::ConnectTimeout(addr.clone()))?
                .map_err(|source| BrokerError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
        #[cfg(unix)]
        NetworkMode::Unix => {
            let stream = timeout(config.timeout(), UnixStream::connect(&addr))
                .await
                .map_err(|_| BrokerError::ConnectTimeout(addr.clone()))?
                .map_err(|source| BrokerError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            Box::new(stream)
        }
        #[cfg(not(unix))]
        NetworkMode::Unix => {
            return Err(BrokerError::Connect {
                addr,
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                ),
            });
        }
    };

    let mut conn = Connection::new(stream);
    let mut handshake = Vec::new();
    if !config.pass.is_empty() {
        handshake.push(command(&[b"AUTH", config.pass.as_bytes()]));
    }
    if config.db != 0 {
        let db = config.db.to_string();
        handshake.push(command(&[b"SELECT", db.as_bytes()]));
    }
    handshake.push(command(&[b"PING"]));

    let replies = timeout(config.timeout(), conn.round_trip(&handshake))
        .await
        .map_err(|_| BrokerError::ConnectTimeout(addr))??;
    for reply in replies {
        reply.into_status()?;
    }
    Ok(conn)
}

fn command(args: &[&[u8]]) -> Vec<u8> {
    resp::encode_command(args)
}

fn take_reply(replies: &mut Vec<RespValue>) -> Result<RespValue, BrokerError> {
    replies
        .pop()
        .ok_or_else(|| BrokerError::Protocol("missing reply".to_string()))
}

fn take_next(replies: &mut impl Iterator<Item = RespValue>) -> Result<RespValue, BrokerError> {
    replies
        .next()
        .ok_or_else(|| BrokerError::Protocol("missing reply".to_string()))
}
