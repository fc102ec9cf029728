//! Shared test doubles: an in-memory signaling transport and a scripted
//! media engine, plus small helpers for playing the registrar/peer side.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};

use siprtc_client_core::{
    AccountKey, CallLogEntry, CallLogSink, ClientError, ClientResult, MediaEngine, MediaEvent,
    SignalingTransport, TransportEvent, TransportFactory,
};
use siprtc_sip_core::{parse_message, HeaderAccess, Message, Request};

/// One in-memory signaling session.
pub struct MockTransport {
    pub events: mpsc::Sender<TransportEvent>,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    sent_notify: Notify,
}

impl MockTransport {
    fn new(events: mpsc::Sender<TransportEvent>) -> Arc<Self> {
        Arc::new(MockTransport {
            events,
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
        })
    }

    /// Push an inbound frame to the client.
    pub async fn inject(&self, frame: impl Into<String>) {
        self.events
            .send(TransportEvent::Frame(frame.into()))
            .await
            .expect("account task alive");
    }

    /// Simulate an unexpected close.
    pub async fn drop_with_code(&self, code: u16) {
        self.open.store(false, Ordering::SeqCst);
        self.events
            .send(TransportEvent::Closed {
                code,
                reason: "test drop".into(),
            })
            .await
            .expect("account task alive");
    }

    /// Wait for the next outbound frame matching `pred` and return it
    /// parsed. Frames are consumed in order.
    pub async fn next_frame_matching(
        &self,
        pred: impl Fn(&Message) -> bool,
        what: &str,
    ) -> Message {
        let deadline = Duration::from_secs(5);
        let fut = async {
            loop {
                {
                    let mut sent = self.sent.lock().unwrap();
                    while !sent.is_empty() {
                        let frame = sent.remove(0);
                        let message = parse_message(&frame).expect("client frames parse");
                        if pred(&message) {
                            return message;
                        }
                    }
                }
                self.sent_notify.notified().await;
            }
        };
        tokio::time::timeout(deadline, fut)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    /// Wait for the next outbound request with `method`.
    pub async fn next_request(&self, method: &str) -> Request {
        let message = self
            .next_frame_matching(
                |m| matches!(m, Message::Request(r) if r.method.as_str() == method),
                method,
            )
            .await;
        match message {
            Message::Request(r) => r,
            Message::Response(_) => unreachable!(),
        }
    }

    /// Wait for the next outbound response with `code`.
    pub async fn next_response(&self, code: u16) -> siprtc_sip_core::Response {
        let message = self
            .next_frame_matching(
                |m| matches!(m, Message::Response(r) if r.status.code() == code),
                &format!("response {code}"),
            )
            .await;
        match message {
            Message::Response(r) => r,
            Message::Request(_) => unreachable!(),
        }
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn send(&self, frame: &str) -> ClientResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ClientError::transport("mock transport closed"));
        }
        self.sent.lock().unwrap().push(frame.to_string());
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn close(&self, _code: u16, _reason: &str) -> ClientResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Factory producing [`MockTransport`] sessions, with an optional budget of
/// connect failures for reconnect tests.
pub struct MockTransportFactory {
    fail_budget: AtomicUsize,
    connects: Mutex<Vec<tokio::time::Instant>>,
    sessions: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransportFactory {
            fail_budget: AtomicUsize::new(0),
            connects: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `n` connects fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Instants at which connect was called.
    pub fn connect_times(&self) -> Vec<tokio::time::Instant> {
        self.connects.lock().unwrap().clone()
    }

    /// The most recently created session.
    pub fn latest_session(&self) -> Arc<MockTransport> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a session was created")
    }

    /// Wait until at least `n` sessions exist and return the latest.
    pub async fn wait_for_session(&self, n: usize) -> Arc<MockTransport> {
        let deadline = Duration::from_secs(5);
        let fut = async {
            loop {
                if self.sessions.lock().unwrap().len() >= n {
                    return self.latest_session();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(deadline, fut)
            .await
            .expect("timed out waiting for transport session")
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn connect(
        &self,
        _account: &AccountKey,
        events: mpsc::Sender<TransportEvent>,
    ) -> ClientResult<Arc<dyn SignalingTransport>> {
        self.connects.lock().unwrap().push(tokio::time::Instant::now());
        let failing = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::transport("mock connect refused"));
        }
        let transport = MockTransport::new(events.clone());
        self.sessions.lock().unwrap().push(transport.clone());
        // Buffered until the account task wires its forwarder.
        events
            .send(TransportEvent::Opened)
            .await
            .map_err(|_| ClientError::transport("event channel closed"))?;
        Ok(transport)
    }
}

/// Scripted media engine.
pub struct MockMedia {
    initialized: AtomicBool,
    disposals: AtomicUsize,
    dtmf_via_media: AtomicBool,
    dtmf_sent: Mutex<Vec<String>>,
    events: broadcast::Sender<MediaEvent>,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(MockMedia {
            initialized: AtomicBool::new(false),
            disposals: AtomicUsize::new(0),
            dtmf_via_media: AtomicBool::new(true),
            dtmf_sent: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Route DTMF through SIP INFO instead of the media path.
    pub fn refuse_dtmf(&self) {
        self.dtmf_via_media.store(false, Ordering::SeqCst);
    }

    /// Report the peer connection as up.
    pub fn report_connected(&self) {
        let _ = self.events.send(MediaEvent::Connected);
    }

    pub fn disposal_count(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub fn dtmf_digits(&self) -> Vec<String> {
        self.dtmf_sent.lock().unwrap().clone()
    }

    fn sdp(direction: &str) -> String {
        format!(
            "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\na=rtpmap:111 opus/48000/2\r\na={direction}\r\n"
        )
    }
}

#[async_trait]
impl MediaEngine for MockMedia {
    async fn initialize(&self) -> ClientResult<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn create_offer(&self) -> ClientResult<String> {
        Ok(Self::sdp("sendrecv"))
    }

    async fn create_answer(&self, _remote_sdp: &str) -> ClientResult<String> {
        Ok(Self::sdp("sendrecv"))
    }

    async fn set_remote_description(&self, _sdp: &str) -> ClientResult<()> {
        Ok(())
    }

    async fn set_muted(&self, _muted: bool) -> ClientResult<()> {
        Ok(())
    }

    async fn set_audio_enabled(&self, _enabled: bool) -> ClientResult<()> {
        Ok(())
    }

    async fn send_dtmf(&self, digits: &str, _duration_ms: u32, _gap_ms: u32) -> ClientResult<bool> {
        if !self.dtmf_via_media.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.dtmf_sent.lock().unwrap().push(digits.to_string());
        Ok(true)
    }

    async fn hold_local(&self) -> ClientResult<String> {
        Ok(Self::sdp("sendonly"))
    }

    async fn resume_local(&self) -> ClientResult<String> {
        Ok(Self::sdp("sendrecv"))
    }

    async fn dispose(&self) -> ClientResult<()> {
        if self.initialized.swap(false, Ordering::SeqCst) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

/// Call-log sink collecting entries in memory.
#[derive(Default)]
pub struct RecordingCallLog {
    entries: Mutex<Vec<CallLogEntry>>,
}

impl RecordingCallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingCallLog::default())
    }

    pub fn entries(&self) -> Vec<CallLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallLogSink for RecordingCallLog {
    async fn append(&self, entry: CallLogEntry) -> ClientResult<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

/// Answer a REGISTER with 200, echoing the client's Contact binding.
pub fn register_ok(request: &Request) -> String {
    let contact = request.contact().expect("REGISTER carries Contact");
    siprtc_sip_core::ResponseBuilder::reply(siprtc_sip_core::StatusCode::Ok, request)
        .header(
            siprtc_sip_core::HeaderName::Contact,
            format!("{};expires=600", contact),
        )
        .build()
        .to_string()
}
