//! DAP protocol client
//!
//! Owns one framed connection to an adapter:
//! - monotonic sequence numbers for outgoing requests
//! - request/response correlation by `request_seq`
//! - in-order fan-out of events to registered listeners
//!
//! A single reader task consumes the adapter's output. It applies events to the
//! listeners synchronously before it looks at the next message, so anything a
//! listener records is visible by the time a later response is handed back.

use crate::framing::{encode_frame, FrameReader};
use crate::protocol::{Event, ProtocolMessage, Request, Response};
use crate::traffic::{Direction, TrafficLog};
use crate::{DapError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Callback for adapter events. An `Err` is logged and never reaches other listeners.
pub type EventListener = Arc<dyn Fn(&Event) -> std::result::Result<(), String> + Send + Sync>;

type ResponseSender = oneshot::Sender<Result<Response>>;
type ResponseReceiver = oneshot::Receiver<Result<Response>>;

struct PendingRequest {
    command: String,
    created_at: Instant,
    tx: ResponseSender,
}

/// Why the connection stopped delivering messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    pub reason: String,
    pub framing: bool,
}

impl Closure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            framing: false,
        }
    }

    pub fn to_error(&self) -> DapError {
        if self.framing {
            DapError::Framing(self.reason.clone())
        } else {
            DapError::transport_closed(self.reason.clone())
        }
    }
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    closed: Option<Closure>,
}

pub struct DapClient {
    next_seq: AtomicU64,
    pending: Arc<Mutex<PendingTable>>,
    listeners: Arc<RwLock<Vec<EventListener>>>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    closed_tx: Arc<watch::Sender<Option<Closure>>>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    traffic: Option<Arc<TrafficLog>>,
}

impl DapClient {
    pub fn new<R, W>(reader: R, writer: W, traffic: Option<Arc<TrafficLog>>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let listeners = Arc::new(RwLock::new(Vec::new()));
        let (closed_tx, _) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);

        let reader_task = tokio::spawn(read_loop(
            FrameReader::new(reader),
            pending.clone(),
            listeners.clone(),
            closed_tx.clone(),
            traffic.clone(),
        ));

        Self {
            next_seq: AtomicU64::new(1),
            pending,
            listeners,
            writer: Mutex::new(Box::new(writer)),
            closed_tx,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
            traffic,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a listener; listeners run in registration order.
    pub fn on_event(&self, listener: EventListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Write a request without waiting for its response.
    pub async fn send_request_begin(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<(u64, ResponseReceiver)> {
        let seq = self.next_sequence();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.pending.lock().await;
            if let Some(closure) = &table.closed {
                return Err(closure.to_error());
            }
            table.entries.insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    created_at: Instant::now(),
                    tx,
                },
            );
        }

        let request = ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        });
        if let Err(e) = self.write_message(&request).await {
            self.pending.lock().await.entries.remove(&seq);
            return Err(e);
        }

        debug!(seq, command, "Sent DAP request");
        Ok((seq, rx))
    }

    pub async fn await_response(
        &self,
        command: &str,
        seq: u64,
        rx: ResponseReceiver,
        wait_timeout: Duration,
    ) -> Result<Response> {
        match tokio::time::timeout(wait_timeout, rx).await {
            Ok(Ok(result)) => result?.into_result(),
            Ok(Err(_)) => Err(self
                .closure()
                .unwrap_or_else(|| Closure::new(format!("response channel for '{command}' dropped")))
                .to_error()),
            Err(_) => {
                self.pending.lock().await.entries.remove(&seq);
                warn!(
                    seq,
                    command,
                    timeout_ms = wait_timeout.as_millis() as u64,
                    "DAP request timed out"
                );
                Err(DapError::RequestTimeout {
                    command: command.to_string(),
                    seq: Some(seq),
                })
            }
        }
    }

    /// Send a request and wait for its (successful) response.
    #[tracing::instrument(skip(self, arguments, wait_timeout))]
    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<Value>,
        wait_timeout: Duration,
    ) -> Result<Response> {
        let (seq, rx) = self.send_request_begin(command, arguments).await?;
        self.await_response(command, seq, rx, wait_timeout).await
    }

    /// Fail every pending request and refuse new ones.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        close_pending(&self.pending, &self.closed_tx, Closure::new(reason)).await;
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    pub fn closure(&self) -> Option<Closure> {
        self.closed_tx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    /// Resolves once the connection is closed for any reason.
    pub async fn wait_closed(&self) -> Closure {
        let mut rx = self.closed_tx.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|closure| closure.clone())
            .unwrap_or_else(|| Closure::new("client dropped"))
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.entries.len()
    }

    async fn write_message(&self, message: &ProtocolMessage) -> Result<()> {
        let framed = encode_frame(message)?;
        if let Some(traffic) = &self.traffic {
            traffic
                .record(Direction::Outbound, &serde_json::to_value(message)?)
                .await;
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&framed)
            .await
            .map_err(|e| DapError::transport_closed(format!("failed to write to adapter: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| DapError::transport_closed(format!("failed to flush adapter input: {e}")))?;
        trace!(seq = message.seq(), "Wrote {} byte DAP frame", framed.len());
        Ok(())
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn read_loop<R>(
    mut frames: FrameReader<R>,
    pending: Arc<Mutex<PendingTable>>,
    listeners: Arc<RwLock<Vec<EventListener>>>,
    closed_tx: Arc<watch::Sender<Option<Closure>>>,
    traffic: Option<Arc<TrafficLog>>,
) where
    R: AsyncRead + Unpin,
{
    debug!("DAP reader task started");
    let closure = loop {
        match frames.read_next().await {
            Ok(Some(message)) => {
                if let Some(traffic) = &traffic {
                    if let Ok(payload) = serde_json::to_value(&message) {
                        traffic.record(Direction::Inbound, &payload).await;
                    }
                }
                dispatch(message, &pending, &listeners).await;
            }
            Ok(None) => break Closure::new("adapter closed its output stream"),
            Err(e) => {
                warn!("DAP reader stopped: {}", e);
                break Closure {
                    reason: e.to_string(),
                    framing: matches!(e, DapError::Framing(_)),
                };
            }
        }
    };

    if let Some(traffic) = &traffic {
        traffic
            .record(
                Direction::Internal,
                &json!({ "type": "reader_closed", "message": closure.reason }),
            )
            .await;
    }
    close_pending(&pending, &closed_tx, closure).await;
}

async fn dispatch(
    message: ProtocolMessage,
    pending: &Arc<Mutex<PendingTable>>,
    listeners: &Arc<RwLock<Vec<EventListener>>>,
) {
    match message {
        ProtocolMessage::Response(response) => {
            let entry = pending.lock().await.entries.remove(&response.request_seq);
            match entry {
                Some(entry) => {
                    debug!(
                        request_seq = response.request_seq,
                        command = %entry.command,
                        success = response.success,
                        elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                        "DAP response received"
                    );
                    if entry.tx.send(Ok(response)).is_err() {
                        debug!("Response receiver dropped before delivery");
                    }
                }
                None => warn!(
                    request_seq = response.request_seq,
                    command = %response.command,
                    "Discarding response for unknown request seq"
                ),
            }
        }
        ProtocolMessage::Event(event) => deliver_event(&event, listeners),
        ProtocolMessage::Request(request) => warn!(
            command = %request.command,
            "Ignoring reverse request from adapter"
        ),
    }
}

fn deliver_event(event: &Event, listeners: &Arc<RwLock<Vec<EventListener>>>) {
    let snapshot: Vec<EventListener> = listeners
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    trace!(
        "Delivering event '{}' to {} listener(s)",
        event.event,
        snapshot.len()
    );

    for (index, listener) in snapshot.iter().enumerate() {
        match std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                listener = index,
                event = %event.event,
                "Event listener failed: {}", e
            ),
            Err(_) => warn!(
                listener = index,
                event = %event.event,
                "Event listener panicked"
            ),
        }
    }
}

async fn close_pending(
    pending: &Arc<Mutex<PendingTable>>,
    closed_tx: &watch::Sender<Option<Closure>>,
    closure: Closure,
) {
    let (closure, drained) = {
        let mut table = pending.lock().await;
        let closure = table.closed.get_or_insert(closure).clone();
        let drained: Vec<(u64, PendingRequest)> = table.entries.drain().collect();
        (closure, drained)
    };

    if !drained.is_empty() {
        debug!(
            "Failing {} pending request(s): {}",
            drained.len(),
            closure.reason
        );
    }
    for (_, entry) in drained {
        let _ = entry.tx.send(Err(closure.to_error()));
    }

    closed_tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(closure.clone());
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameWriter;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    const WAIT: Duration = Duration::from_secs(5);

    struct FakeAdapter {
        frames: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
        seq: u64,
    }

    impl FakeAdapter {
        async fn next_request(&mut self) -> Request {
            match self.frames.read_next().await.unwrap() {
                Some(ProtocolMessage::Request(request)) => request,
                other => panic!("Expected request, got {other:?}"),
            }
        }

        async fn respond(&mut self, request_seq: u64, command: &str, body: Value) {
            self.seq += 1;
            let response = ProtocolMessage::Response(Response {
                seq: self.seq,
                request_seq,
                command: command.to_string(),
                success: true,
                message: None,
                body: Some(body),
            });
            self.writer.write(&response).await.unwrap();
        }

        async fn emit(&mut self, event: &str, body: Value) {
            self.seq += 1;
            let event = ProtocolMessage::Event(Event {
                seq: self.seq,
                event: event.to_string(),
                body: Some(body),
            });
            self.writer.write(&event).await.unwrap();
        }
    }

    fn connect() -> (Arc<DapClient>, FakeAdapter) {
        let (client_stream, adapter_stream) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (adapter_read, adapter_write) = tokio::io::split(adapter_stream);
        let client = Arc::new(DapClient::new(client_read, client_write, None));
        let adapter = FakeAdapter {
            frames: FrameReader::new(adapter_read),
            writer: FrameWriter::new(adapter_write),
            seq: 0,
        };
        (client, adapter)
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let (client, _adapter) = connect();
        assert_eq!(client.next_sequence(), 1);
        assert_eq!(client.next_sequence(), 2);
        assert_eq!(client.next_sequence(), 3);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (client, mut adapter) = connect();

        let server = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..3 {
                requests.push(adapter.next_request().await);
            }
            for request in requests.iter().rev() {
                adapter
                    .respond(request.seq, &request.command, json!({ "echo": request.command }))
                    .await;
            }
            adapter
        });

        let (a, b, c) = tokio::join!(
            client.send_request("threads", None, WAIT),
            client.send_request("scopes", None, WAIT),
            client.send_request("variables", None, WAIT),
        );
        assert_eq!(a.unwrap().body.unwrap()["echo"], "threads");
        assert_eq!(b.unwrap().body.unwrap()["echo"], "scopes");
        assert_eq!(c.unwrap().body.unwrap()["echo"], "variables");
        assert_eq!(client.pending_count().await, 0);
        let _adapter = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_response_seq_is_discarded() {
        let (client, mut adapter) = connect();

        let server = tokio::spawn(async move {
            let request = adapter.next_request().await;
            adapter.respond(9_999, "ghost", json!({})).await;
            adapter.respond(request.seq, &request.command, json!({ "ok": true })).await;
            adapter
        });

        let response = client.send_request("threads", None, WAIT).await.unwrap();
        assert_eq!(response.body.unwrap()["ok"], true);
        let _adapter = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_response_maps_to_request_failed() {
        let (client, mut adapter) = connect();

        let server = tokio::spawn(async move {
            let request = adapter.next_request().await;
            adapter.seq += 1;
            let response = ProtocolMessage::Response(Response {
                seq: adapter.seq,
                request_seq: request.seq,
                command: request.command,
                success: false,
                message: Some("not stopped".into()),
                body: None,
            });
            adapter.writer.write(&response).await.unwrap();
            adapter
        });

        let err = client.send_request("stackTrace", None, WAIT).await.unwrap_err();
        assert!(matches!(err, DapError::RequestFailed { ref message, .. } if message == "not stopped"));
        let _adapter = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_reports_seq_and_clears_pending() {
        let (client, _adapter) = connect();

        let err = client
            .send_request("initialize", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            DapError::RequestTimeout { command, seq } => {
                assert_eq!(command, "initialize");
                assert_eq!(seq, Some(1));
            }
            e => panic!("Expected RequestTimeout, got {e:?}"),
        }
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_stream_unblocks_pending_requests() {
        let (client, mut adapter) = connect();

        let server = tokio::spawn(async move {
            let _request = adapter.next_request().await;
            drop(adapter);
        });

        let started = Instant::now();
        let err = client
            .send_request("variables", None, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, DapError::TransportClosed { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        server.await.unwrap();

        let err = client.send_request("threads", None, WAIT).await.unwrap_err();
        assert!(matches!(err, DapError::TransportClosed { .. }), "{err:?}");
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_framing_error_fails_pending_with_framing_kind() {
        let (client_stream, adapter_stream) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (_adapter_read, mut adapter_write) = tokio::io::split(adapter_stream);
        let client = DapClient::new(client_read, client_write, None);

        let (seq, rx) = client.send_request_begin("threads", None).await.unwrap();
        adapter_write
            .write_all(b"Content-Length: 500\r\n\r\n{\"seq\":1")
            .await
            .unwrap();
        drop(adapter_write);

        let err = client.await_response("threads", seq, rx, WAIT).await.unwrap_err();
        assert!(matches!(err, DapError::Framing(_)), "{err:?}");
        assert!(client.wait_closed().await.framing);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_pending_requests() {
        let (client, _adapter) = connect();

        let (seq, rx) = client.send_request_begin("evaluate", None).await.unwrap();
        client.shutdown("adapter process exited with code 3").await;

        let err = client.await_response("evaluate", seq, rx, WAIT).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 3"), "{err}");
        assert_eq!(client.wait_closed().await.reason, "adapter process exited with code 3");
    }

    #[tokio::test]
    async fn test_listener_failures_are_isolated() {
        let (client, mut adapter) = connect();
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));

        client.on_event(Arc::new(|_event: &Event| panic!("listener bug")));
        client.on_event(Arc::new(|event: &Event| Err(format!("cannot handle {}", event.event))));
        let sink = seen.clone();
        client.on_event(Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.event.clone());
            Ok(())
        }));

        let server = tokio::spawn(async move {
            let request = adapter.next_request().await;
            adapter.emit("output", json!({ "output": "hi\n" })).await;
            adapter.emit("stopped", json!({ "reason": "step", "threadId": 1 })).await;
            adapter.respond(request.seq, &request.command, json!({})).await;
            adapter
        });

        client.send_request("next", None, WAIT).await.unwrap();
        // Events emitted before the response are visible once it resolves.
        assert_eq!(*seen.lock().unwrap(), vec!["output", "stopped"]);
        let _adapter = server.await.unwrap();
    }
}
