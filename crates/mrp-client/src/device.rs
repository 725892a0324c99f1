//! High-level Apple TV façade.
//!
//! Owns one [`Connection`] and drives the protocol on top of it: the
//! plaintext introduction, PIN pairing or session verification, the
//! post-session configuration messages, HID key commands and the
//! now-playing subscription machinery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mrp_core::error::{Error, Result};
use mrp_core::{AddressPick, Credentials, ServiceRecord};
use mrp_pairing::{PairSetup, PairVerify};
use mrp_proto::protocol::{
    ClientUpdatesConfigMessage, ConnectionState, CryptoPairingMessage, DeviceInfoMessage,
    PlaybackQueueRequestMessage, SendHidEventMessage, SetConnectionStateMessage,
};
use mrp_proto::{MessageType, Payload, ProtocolMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::connection::{Connection, RESPONSE_TIMEOUT};
use crate::events::DeviceEvent;
use crate::hid::{hid_event_data, Key};
use crate::now_playing::{NowPlayingInfo, SupportedCommand};

/// Interval of the now-playing poll timer.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How the client introduces itself. The field set is part of the
/// compatibility contract with the device; keep it stable.
const CLIENT_NAME: &str = "mediaremote-rs";
const CLIENT_MODEL: &str = "iPhone";
const CLIENT_BUILD: &str = "18G82";
const PROTOCOL_VERSION: i32 = 1;

/// An open MediaRemote session with one Apple TV.
pub struct AppleTv {
    connection: Connection,
    pairing_id: String,
    remote_info: std::sync::Mutex<Option<DeviceInfoMessage>>,
    ready: AtomicBool,
    poller: Arc<Poller>,
    fanout: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AppleTv {
    /// Connect to a discovered service and establish a session.
    ///
    /// With credentials the session is verified and ready on return.
    /// Without credentials the introduction still runs, but the caller
    /// must pair ([`AppleTv::begin_pairing`]) and then
    /// [`AppleTv::establish_session`] before sending commands.
    pub async fn open(record: &ServiceRecord, credentials: Option<Credentials>) -> Result<Self> {
        Self::open_with_pick(record, AddressPick::default(), credentials).await
    }

    /// As [`AppleTv::open`] with an explicit address preference.
    pub async fn open_with_pick(
        record: &ServiceRecord,
        pick: AddressPick,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let addr = record
            .socket_addr_with(pick)
            .ok_or(Error::Usage("service record has no addresses"))?;
        let connection = Connection::connect(addr).await?;
        Self::open_on(connection, credentials).await
    }

    /// Establish a session over an already-connected duplex stream.
    pub async fn open_with_stream<S>(stream: S, credentials: Option<Credentials>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::open_on(Connection::from_stream(stream), credentials).await
    }

    async fn open_on(connection: Connection, credentials: Option<Credentials>) -> Result<Self> {
        let pairing_id = credentials
            .as_ref()
            .map(|c| c.pairing_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let device = Self {
            poller: Poller::new(connection.clone()),
            fanout: std::sync::Mutex::new(Some(spawn_fanout(&connection))),
            connection,
            pairing_id,
            remote_info: std::sync::Mutex::new(None),
            ready: AtomicBool::new(false),
        };

        device.introduce().await?;
        if let Some(credentials) = credentials {
            device.establish_session(&credentials).await?;
        }
        Ok(device)
    }

    /// The stable client identity used for pairing and the introduction.
    pub fn pairing_id(&self) -> &str {
        &self.pairing_id
    }

    /// Whether the session is verified and commands can be sent.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// The device info announced in the introduction response.
    pub fn device_info(&self) -> Option<DeviceInfoMessage> {
        self.remote_info
            .lock()
            .map(|info| info.clone())
            .unwrap_or(None)
    }

    /// Subscribe to the raw event stream.
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.connection.subscribe()
    }

    /// Plaintext introduction; the device answers with its own info.
    async fn introduce(&self) -> Result<()> {
        let payload = Payload::DeviceInfo(DeviceInfoMessage {
            unique_identifier: self.pairing_id.clone(),
            name: CLIENT_NAME.to_string(),
            model: CLIENT_MODEL.to_string(),
            system_build_version: Some(CLIENT_BUILD.to_string()),
            protocol_version: PROTOCOL_VERSION,
            supports_system_pairing: true,
            supports_acl: true,
            supports_shared_queue: true,
            supports_extended_motion: true,
            allows_pairing: true,
            shared_queue_version: Some(2),
        });

        let response = self.connection.request(payload, 0).await?;
        if let Some(Payload::DeviceInfo(info)) = response.payload {
            debug!(device = %info.name, id = %info.unique_identifier, "introduced");
            if let Ok(mut slot) = self.remote_info.lock() {
                *slot = Some(info);
            }
        }
        Ok(())
    }

    /// Start PIN pairing. Sends M1, waits for M2, then hands back a
    /// continuation that takes the on-screen PIN.
    pub async fn begin_pairing(&self) -> Result<PinEntry<'_>> {
        let mut events = self.connection.subscribe();
        let mut setup = PairSetup::new(self.pairing_id.clone());

        let result = async {
            let m1 = setup.start()?;
            self.send_pairing_data(m1).await?;
            let m2 = next_pairing_data(&mut events, RESPONSE_TIMEOUT).await?;
            setup.process_m2(&m2)
        }
        .await;

        match result {
            Ok(()) => Ok(PinEntry {
                device: self,
                setup,
                events,
            }),
            Err(e) => {
                self.connection.close().await;
                Err(e)
            }
        }
    }

    /// Verify with stored credentials and enter encrypted mode, then send
    /// the connection-state and update-config messages.
    pub async fn establish_session(&self, credentials: &Credentials) -> Result<()> {
        if let Err(e) = self.verify(credentials).await {
            self.connection.close().await;
            return Err(e);
        }
        self.finish_setup().await
    }

    async fn verify(&self, credentials: &Credentials) -> Result<()> {
        let mut events = self.connection.subscribe();
        let mut verify = PairVerify::new(credentials.clone());

        let m1 = verify.start()?;
        self.send_pairing_data(m1).await?;
        let m2 = next_pairing_data(&mut events, RESPONSE_TIMEOUT).await?;
        let m3 = verify.process_m2(&m2)?;
        self.send_pairing_data(m3).await?;

        let keys = verify.into_session_keys()?;
        self.connection.enable_encryption(keys).await;
        Ok(())
    }

    async fn finish_setup(&self) -> Result<()> {
        self.connection
            .send(
                Payload::SetConnectionState(SetConnectionStateMessage {
                    state: ConnectionState::Connected as i32,
                }),
                0,
            )
            .await?;
        self.connection
            .send(
                Payload::ClientUpdatesConfig(ClientUpdatesConfigMessage {
                    now_playing_updates: true,
                    artwork_updates: true,
                    keyboard_updates: true,
                    volume_updates: true,
                }),
                0,
            )
            .await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_pairing_data(&self, pairing_data: Vec<u8>) -> Result<()> {
        self.connection
            .send(
                Payload::CryptoPairing(CryptoPairingMessage {
                    pairing_data,
                    status: Some(0),
                }),
                0,
            )
            .await
    }

    /// Press and release a remote key. Hold variants insert a delay
    /// between the down and up frames.
    pub async fn send_key_command(&self, key: Key) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::Usage("connection is not ready for key commands"));
        }

        let (page, usage) = key.usage();
        self.send_hid(page, usage, true).await?;
        if let Some(delay) = key.hold_duration() {
            tokio::time::sleep(delay).await;
        }
        self.send_hid(page, usage, false).await
    }

    async fn send_hid(&self, page: u16, usage: u16, down: bool) -> Result<()> {
        self.connection
            .send(
                Payload::SendHidEvent(SendHidEventMessage {
                    hid_event_data: hid_event_data(page, usage, down),
                }),
                0,
            )
            .await
    }

    /// Wait for the next inbound envelope of a given type.
    pub async fn message_of_type(
        &self,
        message_type: MessageType,
        deadline: Duration,
    ) -> Result<ProtocolMessage> {
        let mut events = self.connection.subscribe();
        let wait = async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Message(message))
                        if message.r#type == message_type as i32 =>
                    {
                        return Ok(message)
                    }
                    Ok(DeviceEvent::Closed) => return Err(Error::ClosedConnection),
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::ClosedConnection)
                    }
                    _ => {}
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Subscribe to now-playing updates. While at least one now-playing
    /// or supported-commands subscription is live, a single poll timer
    /// requests the playback queue every five seconds.
    pub fn subscribe_now_playing(&self) -> NowPlayingSubscription {
        NowPlayingSubscription {
            events: self.connection.subscribe(),
            _guard: self.poller.acquire(),
        }
    }

    /// Subscribe to supported-command updates; shares the poll timer.
    pub fn subscribe_supported_commands(&self) -> SupportedCommandsSubscription {
        SupportedCommandsSubscription {
            events: self.connection.subscribe(),
            _guard: self.poller.acquire(),
        }
    }

    /// Close the session, the poll timer and the transport.
    pub async fn close(&self) {
        self.poller.shutdown();
        if let Ok(mut slot) = self.fanout.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        self.ready.store(false, Ordering::SeqCst);
        self.connection.close().await;
    }
}

impl Drop for AppleTv {
    fn drop(&mut self) {
        self.poller.shutdown();
        if let Ok(mut slot) = self.fanout.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Continuation returned by [`AppleTv::begin_pairing`]; feeds the PIN to
/// the setup exchange and drives it to completion.
pub struct PinEntry<'a> {
    device: &'a AppleTv,
    setup: PairSetup,
    events: broadcast::Receiver<DeviceEvent>,
}

impl PinEntry<'_> {
    /// Complete pairing with the PIN shown on screen.
    pub async fn enter_pin(mut self, pin: &str) -> Result<Credentials> {
        let result = async {
            let m3 = self.setup.accept_pin(pin)?;
            self.device.send_pairing_data(m3).await?;
            let m4 = next_pairing_data(&mut self.events, RESPONSE_TIMEOUT).await?;
            let m5 = self.setup.process_m4(&m4)?;
            self.device.send_pairing_data(m5).await?;
            let m6 = next_pairing_data(&mut self.events, RESPONSE_TIMEOUT).await?;
            self.setup.process_m6(&m6)
        }
        .await;

        match result {
            Ok(credentials) => Ok(credentials),
            Err(e) => {
                self.device.connection.close().await;
                Err(e)
            }
        }
    }
}

/// Wait for the next `CryptoPairingMessage` and return its TLV blob.
///
/// Sequence validation belongs to the state machines; delivering any
/// pairing blob here surfaces out-of-order rounds as protocol errors
/// instead of hangs.
async fn next_pairing_data(
    events: &mut broadcast::Receiver<DeviceEvent>,
    deadline: Duration,
) -> Result<Vec<u8>> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Message(message)) => {
                    if let Some(Payload::CryptoPairing(pairing)) = message.payload {
                        return Ok(pairing.pairing_data);
                    }
                }
                Ok(DeviceEvent::Closed) => return Err(Error::ClosedConnection),
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ClosedConnection),
                _ => {}
            }
        }
    };
    tokio::time::timeout(deadline, wait)
        .await
        .map_err(|_| Error::Timeout)?
}

/// Re-emits `SetStateMessage` contents as typed events.
///
/// A state message with none of the three sub-fields populated means
/// nothing is playing: exactly one `NowPlaying(None)` is emitted.
fn spawn_fanout(connection: &Connection) -> JoinHandle<()> {
    let mut events = connection.subscribe();
    let sender = connection.event_sender();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Message(message)) => {
                    if let Some(Payload::SetState(state)) = message.payload {
                        let mut emitted = false;
                        if let Some(info) = state.now_playing_info {
                            let _ = sender
                                .send(DeviceEvent::NowPlaying(Some(NowPlayingInfo::from(info))));
                            emitted = true;
                        }
                        if let Some(commands) = state.supported_commands {
                            let commands: Vec<SupportedCommand> = commands
                                .supported_commands
                                .into_iter()
                                .map(Into::into)
                                .collect();
                            let _ = sender.send(DeviceEvent::SupportedCommands(commands));
                            emitted = true;
                        }
                        if let Some(queue) = state.playback_queue {
                            let _ = sender.send(DeviceEvent::PlaybackQueue(queue.into()));
                            emitted = true;
                        }
                        if !emitted {
                            let _ = sender.send(DeviceEvent::NowPlaying(None));
                        }
                    }
                }
                Ok(DeviceEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }
    })
}

/// Reference-counted owner of the now-playing poll timer.
struct Poller {
    connection: Connection,
    inner: std::sync::Mutex<PollerInner>,
}

#[derive(Default)]
struct PollerInner {
    subscribers: usize,
    task: Option<JoinHandle<()>>,
}

impl Poller {
    fn new(connection: Connection) -> Arc<Self> {
        Arc::new(Self {
            connection,
            inner: std::sync::Mutex::new(PollerInner::default()),
        })
    }

    fn acquire(self: &Arc<Self>) -> PollGuard {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers += 1;
            if inner.subscribers == 1 {
                debug!("starting now-playing poll timer");
                inner.task = Some(tokio::spawn(poll_loop(self.connection.clone())));
            }
        }
        PollGuard {
            poller: self.clone(),
        }
    }

    fn release(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers = inner.subscribers.saturating_sub(1);
            if inner.subscribers == 0 {
                if let Some(task) = inner.task.take() {
                    debug!("stopping now-playing poll timer");
                    task.abort();
                }
            }
        }
    }

    fn shutdown(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(task) = inner.task.take() {
                task.abort();
            }
        }
    }
}

struct PollGuard {
    poller: Arc<Poller>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.poller.release();
    }
}

async fn poll_loop(connection: Connection) {
    let start = tokio::time::Instant::now() + POLL_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let request = Payload::PlaybackQueueRequest(PlaybackQueueRequestMessage {
            location: 0,
            length: 100,
            artwork_width: -1,
            artwork_height: 368,
            request_id: Uuid::new_v4().to_string(),
        });
        if connection.send(request, 0).await.is_err() {
            break;
        }
    }
}

/// Live now-playing subscription; holds the poll timer open.
pub struct NowPlayingSubscription {
    events: broadcast::Receiver<DeviceEvent>,
    _guard: PollGuard,
}

impl NowPlayingSubscription {
    /// Next now-playing update; `None` when the connection closes.
    pub async fn next(&mut self) -> Option<Option<NowPlayingInfo>> {
        loop {
            match self.events.recv().await {
                Ok(DeviceEvent::NowPlaying(info)) => return Some(info),
                Ok(DeviceEvent::Closed) => return None,
                Err(broadcast::error::RecvError::Closed) => return None,
                _ => {}
            }
        }
    }
}

/// Live supported-commands subscription; shares the poll timer.
pub struct SupportedCommandsSubscription {
    events: broadcast::Receiver<DeviceEvent>,
    _guard: PollGuard,
}

impl SupportedCommandsSubscription {
    /// Next supported-commands update; `None` when the connection closes.
    pub async fn next(&mut self) -> Option<Vec<SupportedCommand>> {
        loop {
            match self.events.recv().await {
                Ok(DeviceEvent::SupportedCommands(commands)) => return Some(commands),
                Ok(DeviceEvent::Closed) => return None,
                Err(broadcast::error::RecvError::Closed) => return None,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrp_crypto::chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string};
    use mrp_crypto::curve25519::EphemeralKeys;
    use mrp_crypto::ed25519::{self, IdentityKeys};
    use mrp_crypto::srp::mock::MockSrpServer;
    use mrp_crypto::tlv::{Tlv8, TlvTag};
    use mrp_crypto::{hkdf, SessionCipher};
    use mrp_proto::protocol::SetStateMessage;
    use mrp_proto::{encode_frame, FrameDecoder};
    use rand::{rngs::OsRng, RngCore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const MOCK_UID: &str = "E81B4313-7A59-4A2E-96D4-8B0C16C3B2A1";
    const MOCK_PEER_ID: &str = "living-room-atv";

    /// Scripted device side of a session, speaking real frames.
    struct MockAppleTv {
        stream: DuplexStream,
        decoder: FrameDecoder,
        cipher: Option<SessionCipher>,
        identity: IdentityKeys,
        client_ltpk: Option<[u8; 32]>,
        client_pairing_id: Option<String>,
    }

    impl MockAppleTv {
        fn unpaired(stream: DuplexStream) -> Self {
            Self {
                stream,
                decoder: FrameDecoder::new(),
                cipher: None,
                identity: IdentityKeys::generate(),
                client_ltpk: None,
                client_pairing_id: None,
            }
        }

        /// A device that already knows one client, plus that client's
        /// credentials.
        fn with_paired_client(stream: DuplexStream) -> (Credentials, Self) {
            let client_identity = IdentityKeys::generate();
            let pairing_id = Uuid::new_v4().to_string();
            let mut mock = Self::unpaired(stream);
            mock.client_ltpk = Some(client_identity.public_key());
            mock.client_pairing_id = Some(pairing_id.clone());

            let credentials = Credentials::new(
                pairing_id,
                client_identity.seed(),
                MOCK_PEER_ID.to_string(),
                mock.identity.public_key(),
            );
            (credentials, mock)
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
                assert!(n > 0, "client hung up while the mock expected a frame");
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

        async fn read_pairing_data(&mut self) -> Vec<u8> {
            let message = self.read_message().await;
            match message.payload {
                Some(Payload::CryptoPairing(pairing)) => pairing.pairing_data,
                other => panic!("expected CryptoPairingMessage, got {other:?}"),
            }
        }

        async fn write_pairing_data(&mut self, pairing_data: Vec<u8>) {
            let message = ProtocolMessage::from_payload(Payload::CryptoPairing(
                CryptoPairingMessage {
                    pairing_data,
                    status: Some(0),
                },
            ));
            self.write_message(&message).await;
        }

        /// Answer the plaintext introduction, echoing its identifier.
        async fn handle_intro(&mut self) {
            let message = self.read_message().await;
            assert_eq!(message.message_type(), Some(MessageType::DeviceInfoMessage));
            let identifier = message
                .identifier
                .clone()
                .expect("introduction must carry a correlation identifier");

            let info = match message.payload {
                Some(Payload::DeviceInfo(info)) => info,
                other => panic!("expected DeviceInfoMessage, got {other:?}"),
            };
            assert_eq!(info.model, "iPhone");
            assert_eq!(info.protocol_version, 1);
            assert!(info.supports_system_pairing);
            assert!(info.supports_shared_queue);
            assert!(info.supports_acl);
            assert!(!info.unique_identifier.is_empty());

            let reply = ProtocolMessage::from_payload(Payload::DeviceInfo(DeviceInfoMessage {
                unique_identifier: MOCK_UID.to_string(),
                name: "Living Room".to_string(),
                model: "AppleTV6,2".to_string(),
                system_build_version: Some("17K449".to_string()),
                protocol_version: 1,
                supports_system_pairing: true,
                supports_acl: true,
                supports_shared_queue: true,
                supports_extended_motion: true,
                allows_pairing: true,
                shared_queue_version: Some(2),
            }))
            .with_identifier(identifier);
            self.write_message(&reply).await;
        }

        /// Device side of pair-setup with the given PIN.
        async fn handle_pair_setup(&mut self, pin: &str) {
            let m1 = self.read_pairing_data().await;
            let tlv = Tlv8::parse(&m1).unwrap();
            assert_eq!(tlv.seq(), Some(1));
            assert_eq!(tlv.get(TlvTag::Method), Some([0x00].as_slice()));

            let mut salt = [0u8; 16];
            OsRng.fill_bytes(&mut salt);
            let mut srp = MockSrpServer::new(b"Pair-Setup", pin.as_bytes(), salt);

            let challenge = srp.challenge();
            let mut m2 = Tlv8::new();
            m2.set(TlvTag::SeqNo, vec![0x02]);
            m2.set(TlvTag::Salt, challenge.salt.to_vec());
            m2.set(TlvTag::PublicKey, challenge.server_public_key);
            self.write_pairing_data(m2.encode()).await;

            let m3 = self.read_pairing_data().await;
            let tlv = Tlv8::parse(&m3).unwrap();
            assert_eq!(tlv.seq(), Some(3));
            let client_public = tlv.get(TlvTag::PublicKey).unwrap();
            let (shared, server_proof) = srp.compute_session(client_public);
            let setup_key = hkdf::derive_pair_setup_key(&shared).unwrap();

            let mut m4 = Tlv8::new();
            m4.set(TlvTag::SeqNo, vec![0x04]);
            m4.set(TlvTag::Proof, server_proof);
            self.write_pairing_data(m4.encode()).await;

            let m5 = self.read_pairing_data().await;
            let tlv = Tlv8::parse(&m5).unwrap();
            assert_eq!(tlv.seq(), Some(5));
            let sealed = tlv.get(TlvTag::EncryptedData).unwrap();
            let opened =
                decrypt_with_nonce(&setup_key, &nonce_from_string(b"PS-Msg05"), sealed).unwrap();
            let inner = Tlv8::parse(&opened).unwrap();

            let client_id = inner.get(TlvTag::Identifier).unwrap().to_vec();
            let client_ltpk: [u8; 32] =
                inner.get(TlvTag::PublicKey).unwrap().try_into().unwrap();
            let client_sig: [u8; 64] =
                inner.get(TlvTag::Signature).unwrap().try_into().unwrap();

            let controller_x = hkdf::derive_controller_sign_key(&shared).unwrap();
            let mut message = Vec::new();
            message.extend_from_slice(&controller_x);
            message.extend_from_slice(&client_id);
            message.extend_from_slice(&client_ltpk);
            ed25519::verify(&client_ltpk, &message, &client_sig).unwrap();

            self.client_ltpk = Some(client_ltpk);
            self.client_pairing_id = Some(String::from_utf8(client_id).unwrap());

            let accessory_x = hkdf::derive_accessory_sign_key(&shared).unwrap();
            let mut message = Vec::new();
            message.extend_from_slice(&accessory_x);
            message.extend_from_slice(MOCK_PEER_ID.as_bytes());
            message.extend_from_slice(&self.identity.public_key());
            let signature = self.identity.sign(&message);

            let mut inner = Tlv8::new();
            inner.set(TlvTag::Identifier, MOCK_PEER_ID.as_bytes().to_vec());
            inner.set(TlvTag::PublicKey, self.identity.public_key().to_vec());
            inner.set(TlvTag::Signature, signature.to_vec());
            let sealed = encrypt_with_nonce(
                &setup_key,
                &nonce_from_string(b"PS-Msg06"),
                &inner.encode(),
            )
            .unwrap();

            let mut m6 = Tlv8::new();
            m6.set(TlvTag::SeqNo, vec![0x06]);
            m6.set(TlvTag::EncryptedData, sealed);
            self.write_pairing_data(m6.encode()).await;
        }

        /// Device side of pair-verify; installs the session cipher.
        async fn handle_verify(&mut self) {
            let m1 = self.read_pairing_data().await;
            let tlv = Tlv8::parse(&m1).unwrap();
            assert_eq!(tlv.seq(), Some(1));
            let client_eph: [u8; 32] =
                tlv.get(TlvTag::PublicKey).unwrap().try_into().unwrap();

            let ephemeral = EphemeralKeys::generate();
            let device_eph = ephemeral.public_key();
            let shared = ephemeral.diffie_hellman(&client_eph).unwrap();
            let verify_key = hkdf::derive_pair_verify_key(&shared).unwrap();

            let mut message = Vec::new();
            message.extend_from_slice(&device_eph);
            message.extend_from_slice(MOCK_PEER_ID.as_bytes());
            message.extend_from_slice(&client_eph);
            let signature = self.identity.sign(&message);

            let mut inner = Tlv8::new();
            inner.set(TlvTag::Identifier, MOCK_PEER_ID.as_bytes().to_vec());
            inner.set(TlvTag::Signature, signature.to_vec());
            let sealed = encrypt_with_nonce(
                &verify_key,
                &nonce_from_string(b"PV-Msg02"),
                &inner.encode(),
            )
            .unwrap();

            let mut m2 = Tlv8::new();
            m2.set(TlvTag::SeqNo, vec![0x02]);
            m2.set(TlvTag::PublicKey, device_eph.to_vec());
            m2.set(TlvTag::EncryptedData, sealed);
            self.write_pairing_data(m2.encode()).await;

            let m3 = self.read_pairing_data().await;
            let tlv = Tlv8::parse(&m3).unwrap();
            assert_eq!(tlv.seq(), Some(3));
            let sealed = tlv.get(TlvTag::EncryptedData).unwrap();
            let opened =
                decrypt_with_nonce(&verify_key, &nonce_from_string(b"PV-Msg03"), sealed).unwrap();
            let inner = Tlv8::parse(&opened).unwrap();

            let client_id = inner.get(TlvTag::Identifier).unwrap();
            assert_eq!(
                client_id,
                self.client_pairing_id.as_ref().unwrap().as_bytes()
            );
            let signature: [u8; 64] =
                inner.get(TlvTag::Signature).unwrap().try_into().unwrap();

            let mut message = Vec::new();
            message.extend_from_slice(&client_eph);
            message.extend_from_slice(client_id);
            message.extend_from_slice(&device_eph);
            ed25519::verify(self.client_ltpk.as_ref().unwrap(), &message, &signature).unwrap();

            // Mirror image of the client's session keys.
            let device_write = hkdf::derive_client_read_key(&shared).unwrap();
            let device_read = hkdf::derive_client_write_key(&shared).unwrap();
            self.cipher = Some(SessionCipher::new(device_write, device_read));
        }

        /// Consume the post-verify configuration messages.
        async fn handle_configuration(&mut self) {
            let state = self.read_message().await;
            match state.payload {
                Some(Payload::SetConnectionState(msg)) => {
                    assert_eq!(msg.state, ConnectionState::Connected as i32)
                }
                other => panic!("expected SetConnectionStateMessage, got {other:?}"),
            }
            let config = self.read_message().await;
            match config.payload {
                Some(Payload::ClientUpdatesConfig(msg)) => {
                    assert!(msg.now_playing_updates);
                    assert!(msg.artwork_updates);
                    assert!(msg.keyboard_updates);
                    assert!(msg.volume_updates);
                }
                other => panic!("expected ClientUpdatesConfigMessage, got {other:?}"),
            }
        }
    }

    /// Open a fully verified session against the mock.
    async fn establish() -> (AppleTv, MockAppleTv) {
        let (client_end, device_end) = tokio::io::duplex(64 * 1024);
        let (credentials, mut mock) = MockAppleTv::with_paired_client(device_end);

        let mock_task = tokio::spawn(async move {
            mock.handle_intro().await;
            mock.handle_verify().await;
            mock.handle_configuration().await;
            mock
        });

        let tv = AppleTv::open_with_stream(client_end, Some(credentials))
            .await
            .unwrap();
        let mock = mock_task.await.unwrap();
        (tv, mock)
    }

    fn hid_bytes(message: &ProtocolMessage) -> Vec<u8> {
        match &message.payload {
            Some(Payload::SendHidEvent(event)) => event.hid_event_data.clone(),
            other => panic!("expected SendHIDEventMessage, got {other:?}"),
        }
    }

    mod introduction {
        use super::*;

        #[tokio::test]
        async fn runs_in_plaintext_and_reports_device_info() {
            let (client_end, device_end) = tokio::io::duplex(64 * 1024);
            let mut mock = MockAppleTv::unpaired(device_end);
            let mock_task = tokio::spawn(async move {
                mock.handle_intro().await;
            });

            let tv = AppleTv::open_with_stream(client_end, None).await.unwrap();
            mock_task.await.unwrap();

            let info = tv.device_info().unwrap();
            assert_eq!(info.unique_identifier, MOCK_UID);
            assert_eq!(info.name, "Living Room");
            assert!(!tv.is_ready());

            tv.close().await;
            assert!(!tv.connection.is_open());
        }
    }

    mod pairing {
        use super::*;

        #[tokio::test]
        async fn pin_1234_yields_credentials_with_device_key() {
            let (client_end, device_end) = tokio::io::duplex(64 * 1024);
            let mut mock = MockAppleTv::unpaired(device_end);
            let device_key = mock.identity.public_key();

            let mock_task = tokio::spawn(async move {
                mock.handle_intro().await;
                mock.handle_pair_setup("1234").await;
                mock
            });

            let tv = AppleTv::open_with_stream(client_end, None).await.unwrap();
            let pin_entry = tv.begin_pairing().await.unwrap();
            let credentials = pin_entry.enter_pin("1234").await.unwrap();
            let mock = mock_task.await.unwrap();

            assert_eq!(credentials.pairing_id, tv.pairing_id());
            assert_eq!(credentials.remote_peer_id, MOCK_PEER_ID);
            assert_eq!(credentials.remote_public_key, device_key);
            assert_eq!(
                mock.client_pairing_id.as_deref(),
                Some(tv.pairing_id()),
                "device must have registered the client identity"
            );
        }

        #[tokio::test]
        async fn pairing_then_session_on_same_connection() {
            let (client_end, device_end) = tokio::io::duplex(64 * 1024);
            let mut mock = MockAppleTv::unpaired(device_end);

            let mock_task = tokio::spawn(async move {
                mock.handle_intro().await;
                mock.handle_pair_setup("1234").await;
                mock.handle_verify().await;
                mock.handle_configuration().await;
            });

            let tv = AppleTv::open_with_stream(client_end, None).await.unwrap();
            let credentials = tv
                .begin_pairing()
                .await
                .unwrap()
                .enter_pin("1234")
                .await
                .unwrap();
            tv.establish_session(&credentials).await.unwrap();
            assert!(tv.is_ready());
            mock_task.await.unwrap();
        }
    }

    mod key_commands {
        use super::*;

        #[tokio::test]
        async fn menu_press_sends_down_then_up_encrypted() {
            let (tv, mut mock) = establish().await;

            tv.send_key_command(Key::Menu).await.unwrap();

            let down = mock.read_message().await;
            assert_eq!(
                &hid_bytes(&down)[30..36],
                &[0x01, 0x00, 0x86, 0x00, 0x01, 0x00]
            );
            let up = mock.read_message().await;
            assert_eq!(
                &hid_bytes(&up)[30..36],
                &[0x01, 0x00, 0x86, 0x00, 0x00, 0x00]
            );
        }

        #[tokio::test(start_paused = true)]
        async fn home_hold_sends_both_frames() {
            let (tv, mut mock) = establish().await;

            tv.send_key_command(Key::HomeHold).await.unwrap();

            let down = mock.read_message().await;
            assert_eq!(
                &hid_bytes(&down)[30..36],
                &[0x0C, 0x00, 0x40, 0x00, 0x01, 0x00]
            );
            let up = mock.read_message().await;
            assert_eq!(
                &hid_bytes(&up)[30..36],
                &[0x0C, 0x00, 0x40, 0x00, 0x00, 0x00]
            );
        }

        #[tokio::test]
        async fn key_command_before_session_is_usage_error() {
            let (client_end, device_end) = tokio::io::duplex(64 * 1024);
            let mut mock = MockAppleTv::unpaired(device_end);
            let mock_task = tokio::spawn(async move {
                mock.handle_intro().await;
            });

            let tv = AppleTv::open_with_stream(client_end, None).await.unwrap();
            mock_task.await.unwrap();

            let err = tv.send_key_command(Key::Menu).await.unwrap_err();
            assert!(matches!(err, Error::Usage(_)));
        }
    }

    mod set_state_fan_out {
        use super::*;

        #[tokio::test]
        async fn empty_state_emits_exactly_one_null_now_playing() {
            let (tv, mut mock) = establish().await;
            let mut events = tv.events();

            mock.write_message(&ProtocolMessage::from_payload(Payload::SetState(
                SetStateMessage::default(),
            )))
            .await;
            mock.write_message(&ProtocolMessage::from_payload(Payload::SetState(
                SetStateMessage {
                    now_playing_info: Some(mrp_proto::protocol::NowPlayingInfo {
                        title: Some("marker".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )))
            .await;

            let mut typed = Vec::new();
            loop {
                match events.recv().await.unwrap() {
                    DeviceEvent::NowPlaying(info) => {
                        let done = info.is_some();
                        typed.push(DeviceEvent::NowPlaying(info));
                        if done {
                            break;
                        }
                    }
                    DeviceEvent::SupportedCommands(c) => {
                        typed.push(DeviceEvent::SupportedCommands(c))
                    }
                    DeviceEvent::PlaybackQueue(q) => typed.push(DeviceEvent::PlaybackQueue(q)),
                    _ => {}
                }
            }

            assert_eq!(typed.len(), 2, "only the two now-playing events: {typed:?}");
            assert!(matches!(typed[0], DeviceEvent::NowPlaying(None)));
            assert!(matches!(typed[1], DeviceEvent::NowPlaying(Some(_))));
        }

        #[tokio::test]
        async fn populated_state_emits_typed_events() {
            let (tv, mut mock) = establish().await;
            let mut events = tv.events();

            mock.write_message(&ProtocolMessage::from_payload(Payload::SetState(
                SetStateMessage {
                    now_playing_info: Some(mrp_proto::protocol::NowPlayingInfo {
                        title: Some("Song".to_string()),
                        playback_rate: Some(1.0),
                        ..Default::default()
                    }),
                    supported_commands: Some(mrp_proto::protocol::SupportedCommands {
                        supported_commands: vec![mrp_proto::protocol::SupportedCommand {
                            command: mrp_proto::Command::Pause as i32,
                            enabled: true,
                            can_scrub: Some(true),
                        }],
                    }),
                    ..Default::default()
                },
            )))
            .await;

            let mut now_playing = None;
            let mut commands = None;
            while now_playing.is_none() || commands.is_none() {
                match events.recv().await.unwrap() {
                    DeviceEvent::NowPlaying(info) => now_playing = Some(info),
                    DeviceEvent::SupportedCommands(c) => commands = Some(c),
                    _ => {}
                }
            }

            let info = now_playing.unwrap().unwrap();
            assert_eq!(info.title.as_deref(), Some("Song"));
            assert!(info.is_playing());

            let commands = commands.unwrap();
            assert_eq!(commands.len(), 1);
            assert_eq!(commands[0].command, mrp_proto::Command::Pause);
            assert!(commands[0].enabled);
            assert!(commands[0].can_scrub);
        }
    }

    mod subscriptions {
        use super::*;

        fn assert_poll_request(message: &ProtocolMessage) {
            match &message.payload {
                Some(Payload::PlaybackQueueRequest(req)) => {
                    assert_eq!(req.location, 0);
                    assert_eq!(req.length, 100);
                    assert_eq!(req.artwork_width, -1);
                    assert_eq!(req.artwork_height, 368);
                    assert!(!req.request_id.is_empty());
                }
                other => panic!("expected PlaybackQueueRequestMessage, got {other:?}"),
            }
        }

        #[tokio::test(start_paused = true)]
        async fn poll_timer_follows_subscription_count() {
            let (tv, mut mock) = establish().await;

            let subscription = tv.subscribe_now_playing();
            tokio::time::advance(Duration::from_secs(12)).await;

            assert_poll_request(&mock.read_message().await);
            assert_poll_request(&mock.read_message().await);

            drop(subscription);
            tokio::time::advance(Duration::from_secs(10)).await;
            let silence =
                tokio::time::timeout(Duration::from_secs(1), mock.read_message()).await;
            assert!(silence.is_err(), "timer must stop with the last subscriber");
        }

        #[tokio::test(start_paused = true)]
        async fn poll_timer_is_shared_between_subscription_kinds() {
            let (tv, mut mock) = establish().await;

            let now_playing = tv.subscribe_now_playing();
            let commands = tv.subscribe_supported_commands();
            drop(now_playing);

            // One subscriber remains: the timer keeps firing.
            tokio::time::advance(Duration::from_secs(6)).await;
            assert_poll_request(&mock.read_message().await);

            drop(commands);
            tokio::time::advance(Duration::from_secs(10)).await;
            let silence =
                tokio::time::timeout(Duration::from_secs(1), mock.read_message()).await;
            assert!(silence.is_err());
        }

        #[tokio::test]
        async fn subscription_delivers_updates() {
            let (tv, mut mock) = establish().await;
            let mut subscription = tv.subscribe_now_playing();

            mock.write_message(&ProtocolMessage::from_payload(Payload::SetState(
                SetStateMessage {
                    now_playing_info: Some(mrp_proto::protocol::NowPlayingInfo {
                        title: Some("Playing Now".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )))
            .await;

            let update = subscription.next().await.unwrap().unwrap();
            assert_eq!(update.title.as_deref(), Some("Playing Now"));
        }
    }

    mod message_of_type {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn times_out_without_matching_message() {
            let (tv, mut mock) = establish().await;

            let result = tv
                .message_of_type(MessageType::SetStateMessage, Duration::from_secs(1))
                .await;
            assert!(matches!(result, Err(Error::Timeout)));

            // A late arrival is surfaced normally, with no stale waiter.
            let mut events = tv.events();
            mock.write_message(&ProtocolMessage::from_payload(Payload::SetState(
                SetStateMessage::default(),
            )))
            .await;
            loop {
                if let DeviceEvent::Message(message) = events.recv().await.unwrap() {
                    if message.message_type() == Some(MessageType::SetStateMessage) {
                        break;
                    }
                }
            }
        }

        #[tokio::test]
        async fn resolves_on_matching_type() {
            let (tv, mut mock) = establish().await;

            let wait = tv.message_of_type(MessageType::SetStateMessage, Duration::from_secs(5));
            let write = async {
                mock.write_message(&ProtocolMessage::from_payload(Payload::SetState(
                    SetStateMessage::default(),
                )))
                .await;
            };
            let (message, ()) = tokio::join!(wait, write);
            assert_eq!(
                message.unwrap().message_type(),
                Some(MessageType::SetStateMessage)
            );
        }
    }
}
