use std::collections::VecDeque;
use std::future::Future;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;

use super::checksum::{remote_sha256, sha256_file};
use super::{IntegrityCheck, TransferDirection, TransferInner, TransferState};
use crate::connections::errors::SftpError;
use crate::core::session::Session;
use crate::events::TransferEvent;
use crate::protocol::{FileAttrs, OpenFlags, Request, Response, StatusCode};

struct ChunkDone {
    offset: u64,
    len: u64,
    result: Result<Response, SftpError>,
}

type ChunkFuture<'a> = Pin<Box<dyn Future<Output = ChunkDone> + Send + 'a>>;

/// Hands out the byte ranges still to be sent, skipping acknowledged ones.
struct Planner {
    cursor: u64,
    requeued: VecDeque<(u64, u64)>,
    chunk: u64,
}

impl Planner {
    fn next(&mut self, inner: &TransferInner) -> Option<(u64, u64)> {
        if let Some(range) = self.requeued.pop_front() {
            return Some(range);
        }
        inner.with_progress(|p| {
            let offset = p.acks.next_unacked(self.cursor);
            if offset >= p.total {
                return None;
            }
            let limit = p.acks.next_acked_after(offset).unwrap_or(p.total).min(p.total);
            let len = self.chunk.min(limit - offset);
            self.cursor = offset + len;
            Some((offset, len))
        })
    }
}

/// One run of a transfer, from Queued until it settles.
pub(super) async fn run(inner: Arc<TransferInner>, session: Arc<Session>) {
    let start = inner.with_progress(|p| (p.acks.resumable_offset(), p.total));
    inner.set_state(TransferState::Active);
    inner.emit(TransferEvent::Started {
        transfer_id: inner.id.clone(),
        profile_id: inner.profile_id.clone(),
        direction: inner.direction,
        name: inner.name(),
        total: start.1,
        resumable_offset: start.0,
    });
    debug!("transfer {} active from offset {}", inner.id, start.0);

    let outcome = match inner.direction {
        TransferDirection::Upload => upload(&inner, &session).await,
        TransferDirection::Download => download(&inner, &session).await,
    };
    inner.in_flight.store(0, Ordering::SeqCst);
    settle(&inner, outcome);
}

/// How a run ended, before cancel/pause requests are taken into account.
enum Outcome {
    Done,
    Stopped,
    Failed(SftpError),
}

fn settle(inner: &TransferInner, outcome: Result<Outcome, SftpError>) {
    let outcome = outcome.unwrap_or_else(Outcome::Failed);
    let id = inner.id.clone();

    if inner.cancelling() {
        info!("transfer {} cancelled", id);
        inner.set_state(TransferState::Cancelled);
        inner.emit(TransferEvent::Cancelled { transfer_id: id });
        return;
    }

    match outcome {
        Outcome::Done => {
            let total = inner.with_progress(|p| p.total);
            info!("transfer {} completed ({} bytes)", id, total);
            inner.set_state(TransferState::Completed);
            inner.emit(TransferEvent::Completed {
                transfer_id: id,
                name: inner.name(),
                total,
            });
        }
        Outcome::Stopped => {
            let offset = inner.with_progress(|p| p.acks.resumable_offset());
            info!("transfer {} paused at {}", id, offset);
            inner.set_state(TransferState::Paused);
            inner.emit(TransferEvent::Paused {
                transfer_id: id,
                resumable_offset: offset,
            });
        }
        Outcome::Failed(reason) => {
            if matches!(reason.root_cause(), SftpError::Integrity { .. }) {
                inner.resumable.store(false, Ordering::SeqCst);
            }
            let offset = inner.with_progress(|p| p.acks.resumable_offset());
            let err = SftpError::TransferFailed {
                profile_id: inner.profile_id.clone(),
                transfer_id: id.clone(),
                offset,
                reason: Box::new(reason),
            };
            error!("{}", err);
            let message = err.to_string();
            inner.with_progress(|p| p.error = Some(err));
            inner.set_state(TransferState::Failed);
            inner.emit(TransferEvent::Failed {
                transfer_id: id,
                profile_id: inner.profile_id.clone(),
                offset,
                reason: message,
            });
        }
    }
}

/// Send a chunk request, retrying only when it times out.
async fn send_with_retry(
    inner: &TransferInner,
    session: &Session,
    request: Request,
) -> Result<Response, SftpError> {
    let timeout = inner.options.request_timeout();
    let mut attempt = 0;
    loop {
        let result = match session.send(&request) {
            Ok(pending) => pending.wait(timeout).await,
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.is_timeout() && attempt < inner.options.max_retries && !inner.cancelling() => {
                attempt += 1;
                warn!(
                    "transfer {}: {} (retry {}/{})",
                    inner.id, e, attempt, inner.options.max_retries
                );
            }
            other => return other,
        }
    }
}

/// Minimum gap between two progress events of one transfer.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Rate limit for progress events. The first and the final ack always
/// report.
#[derive(Debug, Default)]
pub(super) struct ProgressThrottle {
    last: Option<Instant>,
}

impl ProgressThrottle {
    fn due(&mut self, now: Instant, finished: bool) -> bool {
        let due = finished
            || self
                .last
                .map_or(true, |last| now.duration_since(last) >= PROGRESS_INTERVAL);
        if due {
            self.last = Some(now);
        }
        due
    }
}

fn record_ack(inner: &TransferInner, offset: u64, len: u64) {
    let event = inner.with_progress(|p| {
        p.acks.ack(offset, len);
        let acknowledged = p.acks.acknowledged();
        if !p.throttle.due(Instant::now(), acknowledged >= p.total) {
            return None;
        }
        Some(TransferEvent::Progress {
            transfer_id: inner.id.clone(),
            name: inner.name(),
            bytes_transferred: acknowledged,
            total: p.total,
            resumable_offset: p.acks.resumable_offset(),
        })
    });
    if let Some(event) = event {
        inner.emit(event);
    }
}

async fn open_remote(
    session: &Session,
    path: &str,
    flags: OpenFlags,
) -> Result<Bytes, SftpError> {
    session
        .request(&Request::Open {
            path: path.to_string(),
            flags,
            attrs: FileAttrs::default(),
        })
        .await?
        .into_handle()
}

async fn upload(inner: &TransferInner, session: &Session) -> Result<Outcome, SftpError> {
    let (resume_from, total) = inner.with_progress(|p| (p.acks.acknowledged(), p.total));
    let mut local = File::open(&inner.local_path).await?;

    let mut flags = OpenFlags::WRITE | OpenFlags::CREATE;
    if resume_from == 0 {
        flags = flags | OpenFlags::TRUNCATE;
    }
    let handle = open_remote(session, &inner.remote_path, flags).await?;

    let mut planner = Planner {
        cursor: 0,
        requeued: VecDeque::new(),
        chunk: u64::from(inner.options.chunk_size),
    };
    let mut window: FuturesUnordered<ChunkFuture<'_>> = FuturesUnordered::new();
    let mut failure: Option<SftpError> = None;

    loop {
        while failure.is_none() && inner.running() && window.len() < inner.options.window {
            let Some((offset, len)) = planner.next(inner) else {
                break;
            };
            let data = match read_chunk(&mut local, offset, len).await {
                Ok(data) => data,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let request = Request::Write {
                handle: handle.clone(),
                offset,
                data,
            };
            window.push(Box::pin(async move {
                ChunkDone {
                    offset,
                    len,
                    result: send_with_retry(inner, session, request).await,
                }
            }));
            inner.in_flight.store(window.len(), Ordering::SeqCst);
        }

        let Some(done) = window.next().await else {
            break;
        };
        inner.in_flight.store(window.len(), Ordering::SeqCst);
        match done.result.and_then(Response::into_ok) {
            Ok(()) => record_ack(inner, done.offset, done.len),
            Err(e) => {
                debug!("transfer {}: chunk at {} failed: {}", inner.id, done.offset, e);
                failure.get_or_insert(e);
            }
        }
    }
    drop(window);
    session.close_handle(handle).await;

    if let Some(e) = failure {
        return Ok(Outcome::Failed(e));
    }
    if !inner.with_progress(|p| p.acks.is_complete(p.total)) {
        return Ok(Outcome::Stopped);
    }
    if inner.cancelling() {
        return Ok(Outcome::Stopped);
    }

    if inner.options.integrity != IntegrityCheck::Off {
        let remote = match open_remote(session, &inner.remote_path, OpenFlags::READ).await {
            Ok(handle) => {
                let digest = remote_sha256(session, &handle).await;
                session.close_handle(handle).await;
                digest
            }
            Err(e) if e.status_code() == Some(StatusCode::PermissionDenied) => Ok(None),
            Err(e) => Err(e),
        };
        if let Err(e) = verify(inner, remote).await {
            return Ok(Outcome::Failed(e));
        }
    }
    debug!("transfer {}: {} bytes uploaded", inner.id, total);
    Ok(Outcome::Done)
}

async fn read_chunk(file: &mut File, offset: u64, len: u64) -> Result<Bytes, SftpError> {
    let mut buf = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn download(inner: &TransferInner, session: &Session) -> Result<Outcome, SftpError> {
    let resume_from = inner.with_progress(|p| p.acks.acknowledged());
    if let Some(parent) = inner.local_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut local = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(resume_from == 0)
        .open(&inner.local_path)
        .await?;
    let handle = open_remote(session, &inner.remote_path, OpenFlags::READ).await?;

    let mut planner = Planner {
        cursor: 0,
        requeued: VecDeque::new(),
        chunk: u64::from(inner.options.chunk_size),
    };
    let mut window: FuturesUnordered<ChunkFuture<'_>> = FuturesUnordered::new();
    let mut failure: Option<SftpError> = None;

    loop {
        while failure.is_none() && inner.running() && window.len() < inner.options.window {
            let Some((offset, len)) = planner.next(inner) else {
                break;
            };
            let request = Request::Read {
                handle: handle.clone(),
                offset,
                len: len as u32,
            };
            window.push(Box::pin(async move {
                ChunkDone {
                    offset,
                    len,
                    result: send_with_retry(inner, session, request).await,
                }
            }));
            inner.in_flight.store(window.len(), Ordering::SeqCst);
        }

        let Some(done) = window.next().await else {
            break;
        };
        inner.in_flight.store(window.len(), Ordering::SeqCst);
        let written = match done.result {
            Ok(Response::Data(data)) if !data.is_empty() && data.len() as u64 <= done.len => {
                write_chunk(&mut local, done.offset, &data).await.map(|()| data.len() as u64)
            }
            Ok(Response::Status {
                code: StatusCode::Eof,
                ..
            }) => Err(SftpError::Protocol(format!(
                "unexpected end of file at {} of {}",
                done.offset,
                inner.with_progress(|p| p.total)
            ))),
            Ok(other) => {
                let kind = other.kind();
                Err(match other.check() {
                    Err(e) => e,
                    Ok(_) => SftpError::Protocol(format!(
                        "unexpected {kind} reply to read at {}",
                        done.offset
                    )),
                })
            }
            Err(e) => Err(e),
        };
        match written {
            Ok(n) => {
                record_ack(inner, done.offset, n);
                if n < done.len {
                    planner.requeued.push_back((done.offset + n, done.len - n));
                }
            }
            Err(e) => {
                debug!("transfer {}: chunk at {} failed: {}", inner.id, done.offset, e);
                failure.get_or_insert(e);
            }
        }
    }
    drop(window);
    local.flush().await?;

    let complete = failure.is_none()
        && !inner.cancelling()
        && inner.with_progress(|p| p.acks.is_complete(p.total));
    let remote = if complete && inner.options.integrity != IntegrityCheck::Off {
        Some(remote_sha256(session, &handle).await)
    } else {
        None
    };
    session.close_handle(handle).await;

    if let Some(e) = failure {
        return Ok(Outcome::Failed(e));
    }
    if !complete {
        return Ok(Outcome::Stopped);
    }
    local.sync_all().await?;
    if let Some(remote) = remote {
        if let Err(e) = verify(inner, remote).await {
            return Ok(Outcome::Failed(e));
        }
    }
    Ok(Outcome::Done)
}

async fn write_chunk(file: &mut File, offset: u64, data: &[u8]) -> Result<(), SftpError> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    Ok(())
}

/// Compare the local file digest with what the server reported.
async fn verify(
    inner: &TransferInner,
    remote: Result<Option<String>, SftpError>,
) -> Result<(), SftpError> {
    let remote = match remote {
        Ok(Some(digest)) => digest,
        Ok(None) | Err(SftpError::Status {
            code: StatusCode::OpUnsupported,
            ..
        }) => {
            if inner.options.integrity == IntegrityCheck::Required {
                return Err(SftpError::Integrity {
                    transfer_id: inner.id.clone(),
                    local: "n/a".into(),
                    remote: "unsupported by server".into(),
                });
            }
            warn!("transfer {}: server cannot report a digest, skipping verification", inner.id);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let local = sha256_file(&inner.local_path).await?;
    if local != remote {
        return Err(SftpError::Integrity {
            transfer_id: inner.id.clone(),
            local,
            remote,
        });
    }
    debug!("transfer {}: sha256 {} verified", inner.id, local);
    Ok(())
}
