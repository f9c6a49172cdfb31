//! In-memory backend used by unit tests

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use super::{BackendConnection, Connector, DialTarget, PacketSink};
use crate::error::{Error, Result};
use crate::protocol::{self, Command, SERVER_STATUS_AUTOCOMMIT};

/// Counts dials and closes so tests can check pool accounting
#[derive(Default)]
pub struct MockConnector {
    next_id: AtomicU64,
    dialed: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail: AtomicBool,
    /// (statement, connection charset) for every relayed query, across connections
    statements: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dials(&self) -> usize {
        self.dialed.load(Ordering::SeqCst)
    }

    pub fn fail_dials(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn statements(&self) -> Vec<(String, String)> {
        self.statements.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Dialed minus closed
    pub fn open_connections(&self) -> usize {
        self.dials() - self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockConn;

    async fn connect(&self, target: &DialTarget) -> Result<MockConn> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                address: target.address.clone(),
                reason: "refused".into(),
            });
        }
        self.dialed.fetch_add(1, Ordering::SeqCst);
        Ok(MockConn {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            in_transaction: false,
            autocommit: true,
            charset: target.charset.clone(),
            schema: target.schema.clone(),
            fail_ping: false,
            fail_rollback: false,
            fail_admin: false,
            fail_set_charset: false,
            error: None,
            rollbacks: 0,
            admin_statements: Vec::new(),
            relayed: Vec::new(),
            closed: Arc::new(AtomicBool::new(false)),
            close_counter: Arc::clone(&self.closed),
            statements: Arc::clone(&self.statements),
        })
    }
}

/// Scriptable backend connection
pub struct MockConn {
    pub id: u64,
    pub in_transaction: bool,
    pub autocommit: bool,
    pub charset: String,
    pub schema: String,
    pub fail_ping: bool,
    pub fail_rollback: bool,
    pub fail_admin: bool,
    pub fail_set_charset: bool,
    pub error: Option<Error>,
    pub rollbacks: usize,
    pub admin_statements: Vec<String>,
    pub relayed: Vec<Bytes>,
    closed: Arc<AtomicBool>,
    close_counter: Arc<AtomicUsize>,
    statements: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockConn {
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn status(&self) -> u16 {
        let mut status = 0;
        if self.in_transaction {
            status |= protocol::SERVER_STATUS_IN_TRANS;
        }
        if self.autocommit {
            status |= SERVER_STATUS_AUTOCOMMIT;
        }
        status
    }
}

#[async_trait]
impl BackendConnection for MockConn {
    async fn ping(&mut self) -> Result<()> {
        if self.fail_ping {
            return Err(Error::Network("ping failed".into()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.fail_rollback {
            return Err(Error::Network("rollback failed".into()));
        }
        self.rollbacks += 1;
        self.in_transaction = false;
        Ok(())
    }

    fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    async fn set_charset(&mut self, charset: &str) -> Result<()> {
        if self.fail_set_charset {
            return Err(Error::Network("SET NAMES failed".into()));
        }
        self.charset = charset.to_string();
        Ok(())
    }

    fn charset(&self) -> &str {
        &self.charset
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    async fn select_schema(&mut self, schema: &str) -> Result<()> {
        self.schema = schema.to_string();
        Ok(())
    }

    async fn execute_admin(&mut self, sql: &str) -> Result<()> {
        if self.fail_admin {
            return Err(Error::Network(format!("{} failed", sql)));
        }
        if sql.eq_ignore_ascii_case("SET autocommit = 1") {
            self.autocommit = true;
        }
        self.admin_statements.push(sql.to_string());
        Ok(())
    }

    /// Answers `SHOW ...` with a one-row result set and every other query
    /// with an OK packet; `BEGIN` opens a transaction and `SET NAMES`
    /// switches the charset
    async fn relay_command(&mut self, command: Bytes, sink: &mut dyn PacketSink) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(Error::Network(err.to_string()));
        }
        if command.first().map(|&b| Command::from(b)) == Some(Command::Query) {
            let sql = String::from_utf8_lossy(&command[1..]).trim().to_string();
            let upper = sql.to_ascii_uppercase();
            if upper == "BEGIN" {
                self.in_transaction = true;
            } else if upper == "COMMIT" || upper == "ROLLBACK" {
                self.in_transaction = false;
            } else if let Some(charset) = protocol::parse_set_names(&sql) {
                self.charset = charset;
            }
            if let Ok(mut log) = self.statements.lock() {
                log.push((sql, self.charset.clone()));
            }
        }
        let show = command.len() > 5 && command[1..5].eq_ignore_ascii_case(b"SHOW");
        self.relayed.push(command);
        if show {
            // One column, one row
            let [lo, hi] = self.status().to_le_bytes();
            let eof = Bytes::copy_from_slice(&[0xfe, 0, 0, lo, hi]);
            sink.deliver(Bytes::from_static(b"\x01")).await?;
            sink.deliver(Bytes::from_static(b"\x03def\x00\x00\x00\x01t")).await?;
            sink.deliver(eof.clone()).await?;
            sink.deliver(Bytes::from_static(b"\x06orders")).await?;
            return sink.deliver(eof).await;
        }
        let ok = protocol::ok_packet(1, 0, 0, self.status());
        sink.deliver(ok.payload).await
    }

    fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}
