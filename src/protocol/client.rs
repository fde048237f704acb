// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
    time::Duration,
};

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{
    common::io_with_timeout,
    package::{
        ExtractError, FAF_DUMP, Package, PUSH_SET_ASSETS, PUSH_UNSET_ASSETS,
        PUSH_UPSERT_ASSET, REQ_ANNOUNCE, RESPONSE_BIT,
    },
};

const READ_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BUF_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("disconnected")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("failed to encode package: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// One of the three unsolicited push message types, still carrying its raw
/// body — the assignment reconciler (C4) is responsible for interpreting its
/// shape.
#[derive(Debug, Clone)]
pub enum PushMessage {
    SetAssets(Value),
    UpsertAsset(Value),
    UnsetAssets(Value),
}

/// A persistent, framed connection to the agentcore. One instance per TCP
/// connection; the supervisor constructs a fresh instance on every reconnect.
pub struct ProtocolClient {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<DashMap<u16, oneshot::Sender<Result<Value, ProtocolError>>>>,
    next_pid: AtomicU16,
    connected: AtomicBool,
    cancel: CancellationToken,
    push_tx: mpsc::UnboundedSender<PushMessage>,
}

impl ProtocolClient {
    /// Opens a TCP connection and starts its read loop. Callers that want a
    /// connect timeout (per the supervisor's 10-second budget) should wrap
    /// this call in `tokio::time::timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        cancel: CancellationToken,
        push_tx: mpsc::UnboundedSender<PushMessage>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();

        let client = Arc::new(Self {
            reader: tokio::sync::Mutex::new(r),
            writer: tokio::sync::Mutex::new(w),
            pending: Arc::new(DashMap::new()),
            next_pid: AtomicU16::new(0),
            connected: AtomicBool::new(true),
            cancel,
            push_tx,
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move { reader.read_loop().await });

        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    fn next_pid(&self) -> u16 {
        self.next_pid.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    async fn write_frame(&self, pkg: &Package) -> Result<(), ProtocolError> {
        use tokio::io::AsyncWriteExt;

        let bytes = pkg.to_bytes()?;
        let mut w = self.writer.lock().await;
        io_with_timeout("write frame", w.write_all(&bytes), WRITE_TIMEOUT, &self.cancel)
            .await
            .map_err(|e| ProtocolError::Other(e.to_string()))
    }

    /// Sends a request, assigning it a fresh `pid`, and awaits its response.
    pub async fn request(
        &self,
        mut pkg: Package,
        timeout: Option<Duration>,
    ) -> Result<Value, ProtocolError> {
        let pid = self.next_pid();
        pkg.pid = pid;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(pid, tx);

        if let Some(d) = timeout {
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                sleep(d).await;
                if let Some((_, tx)) = pending.remove(&pid) {
                    let _ = tx.send(Err(ProtocolError::Timeout));
                }
            });
        }

        if let Err(e) = self.write_frame(&pkg).await {
            self.pending.remove(&pid);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Disconnected),
        }
    }

    /// Fire-and-forget write; no `pid` tracking, no completion signal.
    pub async fn send(&self, pkg: Package) -> Result<(), ProtocolError> {
        self.write_frame(&pkg).await
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_CAPACITY);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            while buf.len() < Package::HEADER_SIZE {
                if !self.fill_buf(&mut buf).await {
                    self.on_disconnect();
                    return;
                }
                if self.cancel.is_cancelled() {
                    return;
                }
            }

            let Some((total, partial)) = Package::parse_header(&buf) else {
                unreachable!("checked buffer length above")
            };

            while buf.len() < total {
                if !self.fill_buf(&mut buf).await {
                    self.on_disconnect();
                    return;
                }
                if self.cancel.is_cancelled() {
                    return;
                }
            }

            match partial.extract_body(&buf[..total]) {
                Ok(data) => {
                    buf.advance(total);
                    self.dispatch(partial.into_package(data));
                },
                Err(ExtractError::UnknownType(tp)) => {
                    warn!("unsupported package type received: {tp}");
                    buf.advance(total);
                },
                Err(ExtractError::Decode(e)) => {
                    warn!("failed to decode package body, resyncing: {e}");
                    buf.clear();
                },
            }
        }
    }

    /// Reads whatever bytes are available into `buf`. Returns `false` on EOF
    /// or I/O failure (connection is considered lost).
    async fn fill_buf(&self, buf: &mut BytesMut) -> bool {
        let mut scratch = [0u8; 4096];
        let mut r = self.reader.lock().await;
        match io_with_timeout("read", r.read(&mut scratch), READ_TIMEOUT, &self.cancel).await {
            Ok(0) => false,
            Ok(n) => {
                buf.extend_from_slice(&scratch[..n]);
                true
            },
            Err(_) => false,
        }
    }

    fn dispatch(&self, pkg: Package) {
        if pkg.tp & RESPONSE_BIT != 0 {
            match self.pending.remove(&pkg.pid) {
                Some((_, tx)) => {
                    let _ = tx.send(Ok(pkg.data));
                },
                None => {
                    warn!("got a response for pid {} but the request already timed out", pkg.pid);
                },
            }
            return;
        }

        let base = pkg.tp & !RESPONSE_BIT;
        let msg = match base {
            PUSH_SET_ASSETS => PushMessage::SetAssets(pkg.data),
            PUSH_UPSERT_ASSET => PushMessage::UpsertAsset(pkg.data),
            PUSH_UNSET_ASSETS => PushMessage::UnsetAssets(pkg.data),
            REQ_ANNOUNCE | FAF_DUMP => {
                warn!("unexpected unsolicited package of type {base}");
                return;
            },
            _ => return,
        };

        if self.push_tx.send(msg).is_err() {
            debug!("push message dropped, receiver gone");
        }
    }

    fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let pending_pids: Vec<u16> = self.pending.iter().map(|e| *e.key()).collect();
        for pid in pending_pids {
            if let Some((_, tx)) = self.pending.remove(&pid) {
                let _ = tx.send(Err(ProtocolError::Disconnected));
            }
        }
        self.cancel.cancel();
    }
}

/// Latest live connection, if any. The supervisor replaces it on every
/// reconnect; the scheduler only ever reads the current value before a send.
#[derive(Default)]
pub struct SharedClient(tokio::sync::RwLock<Option<Arc<ProtocolClient>>>);

impl SharedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<Arc<ProtocolClient>> {
        self.0.read().await.clone()
    }

    pub async fn set(&self, client: Option<Arc<ProtocolClient>>) {
        *self.0.write().await = client;
    }
}
