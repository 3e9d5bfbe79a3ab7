use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connections::errors::SftpError;
use crate::connections::transport::Transport;
use crate::core::session::SessionStatus;
use crate::protocol::{decode_response, encode_request, Request, Response};

type Reply = oneshot::Sender<Result<Response, SftpError>>;

enum IoEvent {
    Submit {
        id: u32,
        packet: Bytes,
        reply: Reply,
    },
    /// Forget a slot. `done` fires once the slot is gone from the table.
    Abandon {
        id: u32,
        done: Option<oneshot::Sender<()>>,
    },
    /// `None` is an orderly close, `Some` fails the session.
    Shutdown { reason: Option<SftpError> },
}

/// Request/response multiplexer of one session.
///
/// The request-id table lives inside the I/O task and is touched by nothing
/// else. Callers talk to the task over a command channel, in the same way
/// that a `ConnectionHandle` talks to its connection's I/O task. Cloning is
/// cheap and every clone feeds the same task.
#[derive(Clone)]
pub struct Multiplexer {
    label: Arc<str>,
    next_id: Arc<AtomicU32>,
    events_tx: mpsc::UnboundedSender<IoEvent>,
    pending: Arc<AtomicUsize>,
    activity: Arc<AtomicU64>,
    failure: Arc<OnceLock<SftpError>>,
}

/// Handle to one outstanding request.
///
/// Dropping it without waiting abandons the slot.
pub struct PendingResponse {
    id: u32,
    rx: oneshot::Receiver<Result<Response, SftpError>>,
    mux: Multiplexer,
    settled: bool,
}

impl Multiplexer {
    /// Take ownership of a connected transport and spawn its I/O task.
    ///
    /// `status_tx` is moved between Idle and Busy while the session is open,
    /// and set to Closed or Failed when the task ends.
    pub fn spawn(
        label: impl Into<Arc<str>>,
        transport: Box<dyn Transport>,
        status_tx: Arc<watch::Sender<SessionStatus>>,
        first_id: u32,
    ) -> (Multiplexer, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel::<IoEvent>();
        let mux = Multiplexer {
            label: label.into(),
            next_id: Arc::new(AtomicU32::new(first_id)),
            events_tx,
            pending: Arc::new(AtomicUsize::new(0)),
            activity: Arc::new(AtomicU64::new(0)),
            failure: Arc::new(OnceLock::new()),
        };

        let io = IoLoop {
            label: mux.label.clone(),
            transport,
            events_rx,
            slots: HashMap::new(),
            pending: mux.pending.clone(),
            activity: mux.activity.clone(),
            failure: mux.failure.clone(),
            status_tx,
        };
        let task = tokio::spawn(io.run());
        (mux, task)
    }

    /// Encode `request` under a fresh id and queue it for the wire.
    pub fn send(&self, request: &Request) -> Result<PendingResponse, SftpError> {
        // fetch_add wraps at u32::MAX; a still-pending old id is caught by the I/O task.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        debug!("[{}] -> #{} {}", self.label, id, request.kind());
        self.events_tx
            .send(IoEvent::Submit {
                id,
                packet: encode_request(id, request),
                reply,
            })
            .map_err(|_| self.closed_error())?;
        Ok(PendingResponse {
            id,
            rx,
            mux: self.clone(),
            settled: false,
        })
    }

    /// Fail the session. Every outstanding request completes with `reason`.
    pub fn fail(&self, reason: SftpError) {
        let _ = self.events_tx.send(IoEvent::Shutdown {
            reason: Some(reason),
        });
    }

    /// Orderly shutdown.
    pub fn shutdown(&self) {
        let _ = self.events_tx.send(IoEvent::Shutdown { reason: None });
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Counter bumped on every inbound packet.
    pub fn activity(&self) -> u64 {
        self.activity.load(Ordering::SeqCst)
    }

    /// Why the I/O task stopped, if it failed.
    pub fn failure(&self) -> Option<SftpError> {
        self.failure.get().cloned()
    }

    fn closed_error(&self) -> SftpError {
        self.failure().unwrap_or(SftpError::SessionClosed)
    }

    async fn abandon(&self, id: u32) {
        let (done, wait) = oneshot::channel();
        if self
            .events_tx
            .send(IoEvent::Abandon {
                id,
                done: Some(done),
            })
            .is_ok()
        {
            let _ = wait.await;
        }
    }
}

impl PendingResponse {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the matching response. On timeout the slot is removed before
    /// this returns, so a late response is treated as an anomaly.
    pub async fn wait(mut self, deadline: Duration) -> Result<Response, SftpError> {
        let outcome = tokio::time::timeout(deadline, &mut self.rx).await;
        self.settled = true;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.mux.closed_error()),
            Err(_) => {
                self.mux.abandon(self.id).await;
                Err(SftpError::RequestTimeout {
                    request_id: self.id,
                    after: deadline,
                })
            }
        }
    }

    /// Give up on the request and release its slot.
    pub async fn abort(mut self) {
        self.settled = true;
        self.mux.abandon(self.id).await;
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.mux.events_tx.send(IoEvent::Abandon {
                id: self.id,
                done: None,
            });
        }
    }
}

struct IoLoop {
    label: Arc<str>,
    transport: Box<dyn Transport>,
    events_rx: mpsc::UnboundedReceiver<IoEvent>,
    slots: HashMap<u32, Reply>,
    pending: Arc<AtomicUsize>,
    activity: Arc<AtomicU64>,
    failure: Arc<OnceLock<SftpError>>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
}

impl IoLoop {
    async fn run(mut self) {
        info!("I/O task started for session '{}'.", self.label);
        let outcome = loop {
            // Concurrently wait for a command from the session and for the
            // next packet from the server.
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(IoEvent::Submit { id, packet, reply }) => {
                        if self.slots.contains_key(&id) {
                            let _ = reply.send(Err(SftpError::Protocol(format!(
                                "request id {id} still pending after wrap-around"
                            ))));
                            break Some(SftpError::Protocol(format!("request id collision on {id}")));
                        }
                        self.slots.insert(id, reply);
                        if let Err(e) = self.transport.write_packet(packet).await {
                            error!("Write error on '{}': {}", self.label, e);
                            break Some(e);
                        }
                    }
                    Some(IoEvent::Abandon { id, done }) => {
                        if self.slots.remove(&id).is_some() {
                            debug!("[{}] abandoned #{}", self.label, id);
                        }
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                    Some(IoEvent::Shutdown { reason }) => {
                        info!("Shutdown received for '{}'.", self.label);
                        break reason;
                    }
                    // Every handle is gone; nobody can submit anymore.
                    None => break None,
                },
                packet = self.transport.read_packet() => {
                    self.activity.fetch_add(1, Ordering::SeqCst);
                    match packet.and_then(|body| decode_response(&body)) {
                        Ok((id, response)) => match self.slots.remove(&id) {
                            Some(reply) => {
                                debug!("[{}] <- #{}", self.label, id);
                                let _ = reply.send(Ok(response));
                            }
                            None => warn!(
                                "[{}] dropping response #{} with no outstanding request",
                                self.label, id
                            ),
                        },
                        Err(e) => {
                            error!("Read error on '{}': {}", self.label, e);
                            break Some(e);
                        }
                    }
                }
            }
            self.publish_load();
        };
        self.finish(outcome).await;
    }

    fn publish_load(&self) {
        self.pending.store(self.slots.len(), Ordering::SeqCst);
        let next = if self.slots.is_empty() {
            SessionStatus::Idle
        } else {
            SessionStatus::Busy
        };
        self.status_tx.send_if_modified(|status| {
            if status.is_open() && *status != next {
                *status = next;
                true
            } else {
                false
            }
        });
    }

    async fn finish(mut self, outcome: Option<SftpError>) {
        let reason = outcome.clone().unwrap_or(SftpError::SessionClosed);
        if let Some(e) = &outcome {
            let _ = self.failure.set(e.clone());
        }

        // Nothing may wait forever: fail every slot and anything still queued.
        self.events_rx.close();
        for (_, reply) in self.slots.drain() {
            let _ = reply.send(Err(reason.clone()));
        }
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                IoEvent::Submit { reply, .. } => {
                    let _ = reply.send(Err(reason.clone()));
                }
                IoEvent::Abandon { done: Some(done), .. } => {
                    let _ = done.send(());
                }
                _ => {}
            }
        }
        self.pending.store(0, Ordering::SeqCst);

        let _ = self.transport.disconnect().await;
        let terminal = if outcome.is_some() {
            SessionStatus::Failed
        } else {
            SessionStatus::Closed
        };
        self.status_tx.send_replace(terminal);
        info!("I/O task ended for '{}' ({:?}).", self.label, terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::transport::Credential;
    use async_trait::async_trait;

    /// Accepts every packet and never answers.
    struct Mute;

    #[async_trait]
    impl Transport for Mute {
        async fn open(&mut self) -> Result<(), SftpError> {
            Ok(())
        }
        async fn handshake(&mut self) -> Result<(), SftpError> {
            Ok(())
        }
        async fn authenticate(&mut self, _: &str, _: &Credential) -> Result<(), SftpError> {
            Ok(())
        }
        async fn start_subsystem(&mut self) -> Result<(), SftpError> {
            Ok(())
        }
        async fn write_packet(&mut self, _packet: Bytes) -> Result<(), SftpError> {
            Ok(())
        }
        async fn read_packet(&mut self) -> Result<Bytes, SftpError> {
            std::future::pending().await
        }
        async fn disconnect(&mut self) -> Result<(), SftpError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn wrapped_id_colliding_with_a_pending_request_fails_the_session() {
        let status_tx = Arc::new(watch::channel(SessionStatus::Idle).0);
        let mut status = status_tx.subscribe();
        let (mux, task) = Multiplexer::spawn("wrap", Box::new(Mute), status_tx, u32::MAX);

        let first = mux.send(&Request::Realpath { path: ".".into() }).unwrap();
        assert_eq!(first.id(), u32::MAX);
        assert_eq!(mux.next_id.load(Ordering::Relaxed), 0, "counter wraps to zero");

        // Stand-in for 2^32 further requests bringing the counter round again.
        mux.next_id.store(u32::MAX, Ordering::Relaxed);
        let second = mux.send(&Request::Realpath { path: ".".into() }).unwrap();
        assert_eq!(second.id(), first.id());

        let wait = Duration::from_secs(5);
        for pending in [second, first] {
            let err = pending.wait(wait).await.unwrap_err();
            assert!(matches!(err, SftpError::Protocol(_)), "{err:?}");
        }
        task.await.unwrap();
        assert_eq!(*status.borrow_and_update(), SessionStatus::Failed);
        assert!(matches!(mux.failure(), Some(SftpError::Protocol(_))));
        assert_eq!(mux.pending_count(), 0);
        assert!(mux.send(&Request::Realpath { path: ".".into() }).is_err());
    }
}
