//! Framed, variably-encrypted transport over one TCP connection.
//!
//! A spawned reader task owns the inbound half: it reassembles varint
//! frames, decrypts them once session keys are installed, decodes the
//! protobuf envelope and dispatches. Responses resolve their registered
//! waiter first, then every decoded envelope is broadcast as a
//! [`DeviceEvent::Message`]. Outbound frames are FIFO in submission
//! order; the write counter advances in the same order because the
//! cipher is driven under the writer lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mrp_core::error::{Error, Result};
use mrp_crypto::{SessionCipher, SessionKeys};
use mrp_proto::{encode_frame, FrameDecoder, Payload, ProtocolMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::DeviceEvent;

/// Default deadline for a waited response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 8 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to an open MediaRemote transport. Cloning shares the
/// underlying connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    writer: Mutex<Option<BoxedWriter>>,
    cipher: Mutex<Option<SessionCipher>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ProtocolMessage>>>,
    events: broadcast::Sender<DeviceEvent>,
    open: AtomicBool,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dial the device and start the frame reader.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        debug!(%addr, "transport connected");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an established duplex stream (the connect path and tests).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            writer: Mutex::new(Some(Box::new(write_half))),
            cipher: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            events,
            open: AtomicBool::new(true),
            reader: std::sync::Mutex::new(None),
        });

        let reader = tokio::spawn(read_loop(shared.clone(), read_half));
        if let Ok(mut slot) = shared.reader.lock() {
            *slot = Some(reader);
        }

        let _ = shared.events.send(DeviceEvent::Connected);
        Connection { shared }
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<DeviceEvent> {
        self.shared.events.clone()
    }

    /// Install session keys; subsequent frames are encrypted.
    pub async fn enable_encryption(&self, keys: SessionKeys) {
        let cipher = SessionCipher::new(*keys.write_key.as_bytes(), *keys.read_key.as_bytes());
        *self.shared.cipher.lock().await = Some(cipher);
        debug!("transport switched to encrypted mode");
    }

    /// Send a message without waiting for a response.
    pub async fn send(&self, payload: Payload, priority: i32) -> Result<()> {
        let mut message = ProtocolMessage::from_payload(payload);
        if priority != 0 {
            message = message.with_priority(priority);
        }
        self.transmit(message).await
    }

    /// Send a raw envelope without waiting for a response.
    pub async fn send_message(&self, message: ProtocolMessage) -> Result<()> {
        self.transmit(message).await
    }

    /// Send a message and wait for its correlated response with the
    /// default deadline.
    pub async fn request(&self, payload: Payload, priority: i32) -> Result<ProtocolMessage> {
        self.request_with_timeout(payload, priority, RESPONSE_TIMEOUT)
            .await
    }

    /// Send a message and wait for its correlated response.
    ///
    /// A fresh UUID identifier is stamped on the envelope; the inbound
    /// envelope carrying the same identifier resolves the wait. On
    /// timeout only this waiter is removed and rejected; a response
    /// arriving later is still broadcast but resolves nothing.
    pub async fn request_with_timeout(
        &self,
        payload: Payload,
        priority: i32,
        deadline: Duration,
    ) -> Result<ProtocolMessage> {
        let identifier = Uuid::new_v4().to_string();
        let mut message =
            ProtocolMessage::from_payload(payload).with_identifier(identifier.clone());
        if priority != 0 {
            message = message.with_priority(priority);
        }

        // Register before transmitting so a fast response cannot race the
        // waiter table.
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(identifier.clone(), tx);

        if let Err(e) = self.transmit(message).await {
            self.shared.pending.lock().await.remove(&identifier);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the connection closed underneath us.
            Ok(Err(_)) => Err(Error::ClosedConnection),
            Err(_) => {
                self.shared.pending.lock().await.remove(&identifier);
                Err(Error::Timeout)
            }
        }
    }

    async fn transmit(&self, message: ProtocolMessage) -> Result<()> {
        // The writer lock is held across encrypt + write so the nonce
        // counter order always matches the byte order on the wire.
        let mut writer_slot = self.shared.writer.lock().await;
        let writer = writer_slot.as_mut().ok_or(Error::ClosedConnection)?;

        let plain = message.encode_to_bytes();
        let wire = {
            let mut cipher = self.shared.cipher.lock().await;
            match cipher.as_mut() {
                Some(cipher) => cipher.encrypt(&plain)?,
                None => plain,
            }
        };

        debug!(
            message_type = message.r#type,
            identifier = message.identifier.as_deref().unwrap_or(""),
            len = wire.len(),
            "sending frame"
        );
        writer.write_all(&encode_frame(&wire)).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the transport: stop the reader, reject every pending waiter
    /// and emit a single `Closed` event. Idempotent.
    pub async fn close(&self) {
        if !self.shared.open.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut slot) = self.shared.reader.lock() {
            if let Some(reader) = slot.take() {
                reader.abort();
            }
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        // Dropping the senders rejects all pending waiters.
        self.shared.pending.lock().await.clear();
        *self.shared.cipher.lock().await = None;

        let _ = self.shared.events.send(DeviceEvent::Closed);
        debug!("transport closed");
    }
}

/// Inbound half: frame reassembly, decryption, decode, dispatch.
async fn read_loop<R>(shared: Arc<Shared>, mut read_half: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let fatal: Option<String> = 'conn: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break 'conn None,
            Ok(n) => n,
            Err(e) => break 'conn Some(format!("socket read failed: {e}")),
        };
        decoder.extend(&buf[..n]);

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                // A corrupt length prefix loses framing for good.
                Err(e) => break 'conn Some(format!("frame desync: {e}")),
            };

            let plain = {
                let mut cipher = shared.cipher.lock().await;
                match cipher.as_mut() {
                    Some(cipher) => match cipher.decrypt(&frame) {
                        Ok(plain) => plain,
                        // AEAD failure is fatal to the session.
                        Err(e) => break 'conn Some(format!("frame rejected: {e}")),
                    },
                    None => frame.to_vec(),
                }
            };

            match ProtocolMessage::decode_from_bytes(&plain) {
                Ok(message) => dispatch(&shared, message).await,
                Err(e) => {
                    // Undecodable envelopes are dropped, not fatal.
                    warn!("dropping undecodable frame: {e}");
                    let _ = shared
                        .events
                        .send(DeviceEvent::Debug(format!("dropped frame: {e}")));
                }
            }
        }
    };

    if let Some(reason) = fatal {
        let _ = shared.events.send(DeviceEvent::Error(reason));
    }

    // Socket gone: reject all waiters, emit a single close.
    if shared.open.swap(false, Ordering::SeqCst) {
        shared.pending.lock().await.clear();
        *shared.writer.lock().await = None;
        let _ = shared.events.send(DeviceEvent::Closed);
        debug!("transport reader finished");
    }
}

/// Resolve a matching pending waiter first, then broadcast.
async fn dispatch(shared: &Arc<Shared>, message: ProtocolMessage) {
    if let Some(identifier) = message.identifier.as_deref() {
        let waiter = shared.pending.lock().await.remove(identifier);
        if let Some(tx) = waiter {
            let _ = tx.send(message.clone());
        }
    }
    let _ = shared.events.send(DeviceEvent::Message(message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrp_crypto::keys::SharedSecret;
    use mrp_proto::protocol::{
        NowPlayingInfo, PlaybackQueueRequestMessage, SetStateMessage,
    };
    use tokio::io::DuplexStream;

    /// Raw device end of a duplex pipe, speaking frames by hand.
    struct WireEnd {
        stream: DuplexStream,
        decoder: FrameDecoder,
        cipher: Option<SessionCipher>,
    }

    impl WireEnd {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                decoder: FrameDecoder::new(),
                cipher: None,
            }
        }

        async fn read_message(&mut self) -> ProtocolMessage {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.decoder.next_frame().unwrap() {
                    let plain = match self.cipher.as_mut() {
                        Some(cipher) => cipher.decrypt(&frame).unwrap(),
                        None => frame.to_vec(),
                    };
                    return ProtocolMessage::decode_from_bytes(&plain).unwrap();
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed while awaiting a frame");
                self.decoder.extend(&buf[..n]);
            }
        }

        async fn write_message(&mut self, message: &ProtocolMessage) {
            let plain = message.encode_to_bytes();
            let wire = match self.cipher.as_mut() {
                Some(cipher) => cipher.encrypt(&plain).unwrap(),
                None => plain,
            };
            self.stream.write_all(&encode_frame(&wire)).await.unwrap();
        }

        async fn write_raw_frame(&mut self, payload: &[u8]) {
            self.stream
                .write_all(&encode_frame(payload))
                .await
                .unwrap();
        }
    }

    fn pipe() -> (Connection, WireEnd) {
        let (client_end, device_end) = tokio::io::duplex(64 * 1024);
        (Connection::from_stream(client_end), WireEnd::new(device_end))
    }

    fn poll_request(request_id: &str) -> Payload {
        Payload::PlaybackQueueRequest(PlaybackQueueRequestMessage {
            location: 0,
            length: 100,
            artwork_width: -1,
            artwork_height: 368,
            request_id: request_id.to_string(),
        })
    }

    fn state_with_title(title: &str) -> Payload {
        Payload::SetState(SetStateMessage {
            now_playing_info: Some(NowPlayingInfo {
                title: Some(title.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn title_of(message: &ProtocolMessage) -> String {
        match &message.payload {
            Some(Payload::SetState(state)) => state
                .now_playing_info
                .as_ref()
                .and_then(|np| np.title.clone())
                .unwrap_or_default(),
            _ => panic!("expected SetState payload"),
        }
    }

    #[tokio::test]
    async fn request_stamps_fresh_identifiers() {
        let (connection, mut device) = pipe();

        let device_task = tokio::spawn(async move {
            let first = device.read_message().await;
            let second = device.read_message().await;
            let id1 = first.identifier.clone().unwrap();
            let id2 = second.identifier.clone().unwrap();
            assert_ne!(id1, id2, "identifiers must be fresh per request");

            let mut reply = ProtocolMessage::from_payload(state_with_title("a"));
            reply.identifier = Some(id1);
            device.write_message(&reply).await;
            let mut reply = ProtocolMessage::from_payload(state_with_title("b"));
            reply.identifier = Some(id2);
            device.write_message(&reply).await;
        });

        let (r1, r2) = tokio::join!(
            connection.request(poll_request("1"), 0),
            connection.request(poll_request("2"), 0),
        );
        r1.unwrap();
        r2.unwrap();
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn responses_resolve_out_of_order() {
        let (connection, mut device) = pipe();

        let device_task = tokio::spawn(async move {
            let first = device.read_message().await;
            let second = device.read_message().await;

            // Answer in reverse arrival order, each echoing the request id
            // of the message it answers.
            for request in [second, first] {
                let tag = match &request.payload {
                    Some(Payload::PlaybackQueueRequest(req)) => req.request_id.clone(),
                    _ => panic!("expected queue request"),
                };
                let mut reply = ProtocolMessage::from_payload(state_with_title(&tag));
                reply.identifier = request.identifier.clone();
                device.write_message(&reply).await;
            }
        });

        let (r1, r2) = tokio::join!(
            connection.request(poll_request("one"), 0),
            connection.request(poll_request("two"), 0),
        );

        assert_eq!(title_of(&r1.unwrap()), "one");
        assert_eq!(title_of(&r2.unwrap()), "two");
        device_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_late_reply_is_harmless() {
        let (connection, mut device) = pipe();
        let mut events = connection.subscribe();

        let result = connection
            .request_with_timeout(poll_request("slow"), 0, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        // The device answers after the waiter is gone.
        let request = device.read_message().await;
        let mut reply = ProtocolMessage::from_payload(state_with_title("late"));
        reply.identifier = request.identifier.clone();
        device.write_message(&reply).await;

        // The late response is still surfaced as a plain message event.
        loop {
            match events.recv().await.unwrap() {
                DeviceEvent::Message(message) if message.identifier == request.identifier => {
                    break;
                }
                _ => {}
            }
        }
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn outbound_frames_are_fifo() {
        let (connection, mut device) = pipe();

        connection.send(poll_request("1"), 0).await.unwrap();
        connection.send(state_with_title("2"), 5).await.unwrap();
        connection.send(poll_request("3"), 0).await.unwrap();

        let first = device.read_message().await;
        let second = device.read_message().await;
        let third = device.read_message().await;

        assert!(matches!(
            first.payload,
            Some(Payload::PlaybackQueueRequest(_))
        ));
        assert!(matches!(second.payload, Some(Payload::SetState(_))));
        assert_eq!(second.priority, Some(5));
        assert!(matches!(
            third.payload,
            Some(Payload::PlaybackQueueRequest(_))
        ));
    }

    #[tokio::test]
    async fn close_rejects_pending_waiters() {
        let (connection, _device) = pipe();

        let waiter = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.request(poll_request("1"), 0).await })
        };
        tokio::task::yield_now().await;

        connection.close().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::ClosedConnection)));
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn peer_close_emits_single_closed_event() {
        let (connection, device) = pipe();
        let mut events = connection.subscribe();

        drop(device);

        let mut closed = 0;
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Closed) => closed += 1,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => break,
                Err(_) => {}
            }
            if closed > 0 {
                // Drain whatever remains without blocking.
                while let Ok(event) = events.try_recv() {
                    if matches!(event, DeviceEvent::Closed) {
                        closed += 1;
                    }
                }
                break;
            }
        }
        assert_eq!(closed, 1);
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn undecodable_frame_is_dropped_not_fatal() {
        let (connection, mut device) = pipe();
        let mut events = connection.subscribe();

        device.write_raw_frame(&[0x0F, 0xFF, 0xFF]).await;
        device
            .write_message(&ProtocolMessage::from_payload(state_with_title("ok")))
            .await;

        let mut saw_debug = false;
        loop {
            match events.recv().await.unwrap() {
                DeviceEvent::Debug(_) => saw_debug = true,
                DeviceEvent::Message(message) => {
                    assert_eq!(title_of(&message), "ok");
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_debug);
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn encrypted_round_trip_after_key_install() {
        let (connection, mut device) = pipe();
        let mut events = connection.subscribe();

        let shared = SharedSecret::new(vec![0x5A; 32]);
        let keys = SessionKeys::derive(&shared).unwrap();
        // Mirror image on the device side.
        let device_cipher = SessionCipher::new(
            *SessionKeys::derive(&shared).unwrap().read_key.as_bytes(),
            *SessionKeys::derive(&shared).unwrap().write_key.as_bytes(),
        );
        connection.enable_encryption(keys).await;
        device.cipher = Some(device_cipher);

        connection.send(state_with_title("sealed"), 0).await.unwrap();
        let received = device.read_message().await;
        assert_eq!(title_of(&received), "sealed");

        device
            .write_message(&ProtocolMessage::from_payload(state_with_title("back")))
            .await;
        loop {
            if let DeviceEvent::Message(message) = events.recv().await.unwrap() {
                assert_eq!(title_of(&message), "back");
                break;
            }
        }
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_fatal() {
        let (connection, mut device) = pipe();
        let mut events = connection.subscribe();

        let shared = SharedSecret::new(vec![0x5A; 32]);
        connection
            .enable_encryption(SessionKeys::derive(&shared).unwrap())
            .await;

        // Garbage that cannot authenticate under the read key.
        device.write_raw_frame(&[0u8; 32]).await;

        let mut saw_error = false;
        loop {
            match events.recv().await.unwrap() {
                DeviceEvent::Error(_) => saw_error = true,
                DeviceEvent::Closed => break,
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(!connection.is_open());
    }
}
