//! Carrier session: typed duplex interface over the media-stream protocol.
//!
//! The session is transport-free: it speaks [`StreamFrame`] over a pair of
//! channels, and the listener pumps those channels to and from the actual
//! WebSocket. Tests drive the frame channels directly.
//!
//! Two tasks serve a session:
//!
//! - the **inbound** task validates frames in strict arrival order, decodes
//!   media payloads, tracks sequence continuity, and emits [`CarrierEvent`]s;
//! - the **pacer** task owns a 20 ms clock and emits exactly one media frame
//!   per tick from a bounded outbound queue, so transmission matches real
//!   time. Marks travel through the same queue (FIFO with the audio they
//!   follow) but do not consume a tick. A clear command flushes the queue
//!   and tells the carrier to discard anything already buffered downstream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::messages::{CallDirection, StreamFrame};

/// μ-law bytes in one 20 ms frame at 8 kHz.
pub const FRAME_BYTES: usize = 160;

/// Pacing period for outbound media.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Outbound queue bound: 200 frames ≈ 4 s of audio.
const OUTBOUND_QUEUE_CAPACITY: usize = 200;

/// Event channel capacity toward the orchestrator.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Events
// =============================================================================

/// Identifiers and party numbers carried by the carrier's start frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStart {
    pub stream_sid: String,
    pub call_sid: Option<String>,
    pub direction: CallDirection,
    pub from: String,
    pub to: String,
}

/// Events delivered to the orchestrator, in strict arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum CarrierEvent {
    /// Socket-level hello.
    Connected,
    /// Media stream established.
    Start(StreamStart),
    /// One decoded μ-law frame.
    Media { payload: Bytes },
    /// A previously sent mark was played out.
    MarkEcho { name: String },
    /// Caller keypress.
    Dtmf { digit: char },
    /// The carrier ended the stream.
    Stop { reason: Option<String> },
    /// A frame violated the protocol; fatal for the call.
    ProtocolError { detail: String },
    /// The underlying connection is gone.
    Closed,
}

/// Commands handled by the pacer outside the queue.
enum PacerCtl {
    Clear,
    Close,
}

// =============================================================================
// Outbound queue
// =============================================================================

enum OutItem {
    Media(Bytes),
    Mark(String),
}

/// Bounded FIFO of outbound items. Overflow discards the oldest *media*
/// item and counts it; marks are never dropped, they carry turn accounting.
struct OutboundQueue {
    items: Mutex<VecDeque<OutItem>>,
    media_len: AtomicUsize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(OUTBOUND_QUEUE_CAPACITY)),
            media_len: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn push_media(&self, frame: Bytes) {
        let mut items = self.items.lock().expect("outbound queue poisoned");
        if self.media_len.load(Ordering::Relaxed) >= OUTBOUND_QUEUE_CAPACITY {
            if let Some(pos) = items
                .iter()
                .position(|item| matches!(item, OutItem::Media(_)))
            {
                items.remove(pos);
                self.media_len.fetch_sub(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        items.push_back(OutItem::Media(frame));
        self.media_len.fetch_add(1, Ordering::Relaxed);
    }

    fn push_mark(&self, name: String) {
        self.items
            .lock()
            .expect("outbound queue poisoned")
            .push_back(OutItem::Mark(name));
    }

    fn pop(&self) -> Option<OutItem> {
        let mut items = self.items.lock().expect("outbound queue poisoned");
        let item = items.pop_front();
        if matches!(item, Some(OutItem::Media(_))) {
            self.media_len.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Remove queued media, keeping marks so their echoes still reconcile.
    fn clear_media(&self) {
        let mut items = self.items.lock().expect("outbound queue poisoned");
        items.retain(|item| matches!(item, OutItem::Mark(_)));
        self.media_len.store(0, Ordering::Relaxed);
    }

    fn media_pending(&self) -> usize {
        self.media_len.load(Ordering::Relaxed)
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Session
// =============================================================================

/// One carrier media-stream session.
pub struct CarrierSession {
    event_rx: mpsc::Receiver<CarrierEvent>,
    queue: Arc<OutboundQueue>,
    ctl_tx: mpsc::Sender<PacerCtl>,
    /// Partial frame awaiting enough bytes for a full 20 ms payload.
    partial: Mutex<Vec<u8>>,
    dropped_inbound: Arc<AtomicU64>,
}

impl CarrierSession {
    /// Build a session over typed frame channels.
    ///
    /// `frame_rx` carries frames read from the carrier socket; frames the
    /// session produces are written to `frame_tx`. Dropping the session's
    /// tasks drops `frame_tx`, which the listener treats as close.
    pub fn start(
        frame_tx: mpsc::Sender<StreamFrame>,
        frame_rx: mpsc::Receiver<StreamFrame>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (ctl_tx, ctl_rx) = mpsc::channel(8);
        let (sid_tx, sid_rx) = watch::channel::<Option<String>>(None);
        let queue = Arc::new(OutboundQueue::new());
        let dropped_inbound = Arc::new(AtomicU64::new(0));

        tokio::spawn(inbound_loop(
            frame_rx,
            event_tx,
            sid_tx,
            dropped_inbound.clone(),
        ));
        tokio::spawn(pacer_loop(frame_tx, ctl_rx, queue.clone(), sid_rx));

        Self {
            event_rx,
            queue,
            ctl_tx,
            partial: Mutex::new(Vec::with_capacity(FRAME_BYTES)),
            dropped_inbound,
        }
    }

    /// Receive the next protocol event. `None` once fully closed.
    pub async fn recv(&mut self) -> Option<CarrierEvent> {
        self.event_rx.recv().await
    }

    /// Queue outbound μ-law audio, chunked into 20 ms frames.
    ///
    /// A trailing partial frame is held until later bytes complete it.
    pub fn send_media(&self, ulaw: &[u8]) {
        let mut partial = self.partial.lock().expect("partial buffer poisoned");
        partial.extend_from_slice(ulaw);
        while partial.len() >= FRAME_BYTES {
            let frame: Vec<u8> = partial.drain(..FRAME_BYTES).collect();
            self.queue.push_media(Bytes::from(frame));
        }
    }

    /// Queue a mark after all media queued so far.
    pub fn send_mark(&self, name: &str) {
        // Flush a short trailing chunk first so the mark really follows the
        // audio it accounts for.
        let mut partial = self.partial.lock().expect("partial buffer poisoned");
        if !partial.is_empty() {
            let frame = std::mem::take(&mut *partial);
            self.queue.push_media(Bytes::from(frame));
        }
        drop(partial);
        self.queue.push_mark(name.to_string());
    }

    /// Discard queued outbound audio here and at the carrier.
    pub async fn send_clear(&self) {
        self.partial.lock().expect("partial buffer poisoned").clear();
        self.queue.clear_media();
        let _ = self.ctl_tx.send(PacerCtl::Clear).await;
    }

    /// Close the session toward the carrier.
    pub async fn close(&self, reason: &str) {
        tracing::debug!(%reason, "closing carrier session");
        let _ = self.ctl_tx.send(PacerCtl::Close).await;
    }

    /// Media frames not yet transmitted.
    pub fn pending_outbound(&self) -> usize {
        self.queue.media_pending()
    }

    /// Outbound frames discarded by queue overflow.
    pub fn dropped_outbound(&self) -> u64 {
        self.queue.dropped()
    }

    /// Inbound frames lost according to sequence-number gaps.
    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Inbound task
// =============================================================================

async fn inbound_loop(
    mut frame_rx: mpsc::Receiver<StreamFrame>,
    event_tx: mpsc::Sender<CarrierEvent>,
    sid_tx: watch::Sender<Option<String>>,
    dropped_inbound: Arc<AtomicU64>,
) {
    let mut started = false;
    let mut last_seq: Option<u64> = None;

    while let Some(frame) = frame_rx.recv().await {
        let event = match frame {
            StreamFrame::Connected { .. } => CarrierEvent::Connected,

            StreamFrame::Start {
                sequence_number,
                start,
                stream_sid,
            } => {
                started = true;
                track_sequence(&sequence_number, &mut last_seq, &dropped_inbound);
                let _ = sid_tx.send(Some(stream_sid.clone()));

                let params = &start.custom_parameters;
                let direction = params
                    .get("direction")
                    .and_then(|d| CallDirection::parse(d))
                    .unwrap_or(CallDirection::Inbound);
                CarrierEvent::Start(StreamStart {
                    stream_sid,
                    call_sid: start.call_sid,
                    direction,
                    from: params.get("from").cloned().unwrap_or_default(),
                    to: params.get("to").cloned().unwrap_or_default(),
                })
            }

            StreamFrame::Media {
                sequence_number,
                media,
                ..
            } => {
                if !started {
                    protocol_error(&event_tx, "media frame before start").await;
                    break;
                }
                if let Some(detail) = check_sequence(&sequence_number, &mut last_seq, &dropped_inbound)
                {
                    protocol_error(&event_tx, &detail).await;
                    break;
                }
                match BASE64_STANDARD.decode(&media.payload) {
                    Ok(payload) if !payload.is_empty() && payload.len() % FRAME_BYTES == 0 => {
                        CarrierEvent::Media {
                            payload: Bytes::from(payload),
                        }
                    }
                    Ok(payload) => {
                        protocol_error(
                            &event_tx,
                            &format!("media payload of {} bytes is not whole 20 ms frames", payload.len()),
                        )
                        .await;
                        break;
                    }
                    Err(e) => {
                        protocol_error(&event_tx, &format!("undecodable media payload: {e}")).await;
                        break;
                    }
                }
            }

            StreamFrame::Mark { mark, .. } => CarrierEvent::MarkEcho { name: mark.name },

            StreamFrame::Dtmf { dtmf, .. } => match dtmf.digit.chars().next() {
                Some(digit) => CarrierEvent::Dtmf { digit },
                None => continue,
            },

            StreamFrame::Stop { stop, .. } => CarrierEvent::Stop {
                reason: stop.and_then(|s| s.call_sid),
            },

            StreamFrame::Clear { .. } => {
                tracing::warn!("unexpected clear frame from carrier, ignoring");
                continue;
            }
        };

        if event_tx.send(event).await.is_err() {
            return;
        }
    }

    let _ = event_tx.send(CarrierEvent::Closed).await;
}

async fn protocol_error(event_tx: &mpsc::Sender<CarrierEvent>, detail: &str) {
    tracing::error!(%detail, "carrier protocol error");
    let _ = event_tx
        .send(CarrierEvent::ProtocolError {
            detail: detail.to_string(),
        })
        .await;
}

/// Record a frame's sequence number, counting forward gaps.
fn track_sequence(raw: &Option<String>, last: &mut Option<u64>, dropped: &AtomicU64) {
    if let Some(seq) = raw.as_deref().and_then(|s| s.parse::<u64>().ok()) {
        if let Some(prev) = *last {
            if seq > prev + 1 {
                dropped.fetch_add(seq - prev - 1, Ordering::Relaxed);
            }
        }
        *last = Some(seq);
    }
}

/// Like [`track_sequence`], but a going-backwards sequence is an ordering
/// violation and returns the error detail.
fn check_sequence(
    raw: &Option<String>,
    last: &mut Option<u64>,
    dropped: &AtomicU64,
) -> Option<String> {
    if let Some(seq) = raw.as_deref().and_then(|s| s.parse::<u64>().ok()) {
        if let Some(prev) = *last {
            if seq <= prev {
                return Some(format!("sequence went backwards: {prev} then {seq}"));
            }
            if seq > prev + 1 {
                dropped.fetch_add(seq - prev - 1, Ordering::Relaxed);
            }
        }
        *last = Some(seq);
    }
    None
}

// =============================================================================
// Pacer task
// =============================================================================

async fn pacer_loop(
    frame_tx: mpsc::Sender<StreamFrame>,
    mut ctl_rx: mpsc::Receiver<PacerCtl>,
    queue: Arc<OutboundQueue>,
    sid_rx: watch::Receiver<Option<String>>,
) {
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);

    loop {
        tokio::select! {
            ctl = ctl_rx.recv() => match ctl {
                Some(PacerCtl::Clear) => {
                    queue.clear_media();
                    let sid_opt = sid_rx.borrow().clone();
                    if let Some(sid) = sid_opt {
                        if frame_tx.send(StreamFrame::clear(&sid)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(PacerCtl::Close) | None => return,
            },

            _ = ticker.tick() => {
                let Some(sid) = sid_rx.borrow().clone() else {
                    continue;
                };
                // Marks are forwarded without consuming the tick; one media
                // frame goes out per 20 ms.
                loop {
                    match queue.pop() {
                        Some(OutItem::Mark(name)) => {
                            if frame_tx.send(StreamFrame::mark(&sid, &name)).await.is_err() {
                                return;
                            }
                        }
                        Some(OutItem::Media(frame)) => {
                            let payload = BASE64_STANDARD.encode(&frame);
                            if frame_tx.send(StreamFrame::media(&sid, payload)).await.is_err() {
                                return;
                            }
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn media_frame(seq: u64, payload: &[u8]) -> StreamFrame {
        StreamFrame::Media {
            sequence_number: Some(seq.to_string()),
            media: super::super::messages::MediaMeta {
                track: Some("inbound".into()),
                chunk: None,
                timestamp: None,
                payload: BASE64_STANDARD.encode(payload),
            },
            stream_sid: Some("MZ1".into()),
        }
    }

    fn start_frame() -> StreamFrame {
        let mut params = std::collections::HashMap::new();
        params.insert("from".to_string(), "+15550001111".to_string());
        params.insert("to".to_string(), "+15550002222".to_string());
        params.insert("direction".to_string(), "inbound".to_string());
        StreamFrame::Start {
            sequence_number: Some("1".into()),
            start: super::super::messages::StartMeta {
                call_sid: Some("CA1".into()),
                custom_parameters: params,
                ..Default::default()
            },
            stream_sid: "MZ1".into(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let mut session = CarrierSession::start(out_tx, in_rx);

        in_tx
            .send(StreamFrame::Connected {
                protocol: Some("Call".into()),
                version: None,
            })
            .await
            .unwrap();
        in_tx.send(start_frame()).await.unwrap();
        in_tx.send(media_frame(2, &[0xFFu8; 160])).await.unwrap();

        assert_eq!(session.recv().await, Some(CarrierEvent::Connected));
        match session.recv().await {
            Some(CarrierEvent::Start(start)) => {
                assert_eq!(start.stream_sid, "MZ1");
                assert_eq!(start.from, "+15550001111");
                assert_eq!(start.direction, CallDirection::Inbound);
            }
            other => panic!("expected start, got {other:?}"),
        }
        match session.recv().await {
            Some(CarrierEvent::Media { payload }) => assert_eq!(payload.len(), 160),
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn media_before_start_is_protocol_error() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let mut session = CarrierSession::start(out_tx, in_rx);

        in_tx.send(media_frame(1, &[0xFFu8; 160])).await.unwrap();
        assert!(matches!(
            session.recv().await,
            Some(CarrierEvent::ProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn sequence_gaps_are_counted() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let mut session = CarrierSession::start(out_tx, in_rx);

        in_tx.send(start_frame()).await.unwrap();
        in_tx.send(media_frame(2, &[0xFFu8; 160])).await.unwrap();
        in_tx.send(media_frame(5, &[0xFFu8; 160])).await.unwrap();

        let _ = session.recv().await; // start
        let _ = session.recv().await; // media 2
        let _ = session.recv().await; // media 5
        assert_eq!(session.dropped_inbound(), 2);
    }

    #[tokio::test]
    async fn backwards_sequence_is_fatal() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let mut session = CarrierSession::start(out_tx, in_rx);

        in_tx.send(start_frame()).await.unwrap();
        in_tx.send(media_frame(5, &[0xFFu8; 160])).await.unwrap();
        in_tx.send(media_frame(4, &[0xFFu8; 160])).await.unwrap();

        let _ = session.recv().await; // start
        let _ = session.recv().await; // media 5
        assert!(matches!(
            session.recv().await,
            Some(CarrierEvent::ProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn ragged_payload_is_fatal() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let mut session = CarrierSession::start(out_tx, in_rx);

        in_tx.send(start_frame()).await.unwrap();
        in_tx.send(media_frame(2, &[0xFFu8; 100])).await.unwrap();

        let _ = session.recv().await; // start
        assert!(matches!(
            session.recv().await,
            Some(CarrierEvent::ProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn outbound_media_is_paced_and_framed() {
        tokio::time::pause();
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let mut session = CarrierSession::start(out_tx, in_rx);

        in_tx.send(start_frame()).await.unwrap();
        let _ = session.recv().await; // consume start so the sid is set

        // Three 20 ms frames worth of audio in one push.
        session.send_media(&[0x55u8; 480]);

        let mut media_frames = 0;
        for _ in 0..6 {
            tokio::time::advance(FRAME_INTERVAL).await;
            tokio::task::yield_now().await;
            while let Ok(frame) = out_rx.try_recv() {
                if matches!(frame, StreamFrame::Media { .. }) {
                    media_frames += 1;
                }
            }
        }
        assert_eq!(media_frames, 3);
        assert_eq!(session.pending_outbound(), 0);
    }

    #[tokio::test]
    async fn clear_flushes_queue_and_notifies_carrier() {
        tokio::time::pause();
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let mut session = CarrierSession::start(out_tx, in_rx);

        in_tx.send(start_frame()).await.unwrap();
        let _ = session.recv().await;

        session.send_media(&[0x55u8; 160 * 10]);
        session.send_clear().await;
        assert_eq!(session.pending_outbound(), 0);

        let mut saw_clear = false;
        for _ in 0..5 {
            tokio::time::advance(FRAME_INTERVAL).await;
            tokio::task::yield_now().await;
            while let Ok(frame) = out_rx.try_recv() {
                match frame {
                    StreamFrame::Clear { .. } => saw_clear = true,
                    StreamFrame::Media { .. } => panic!("media emitted after clear"),
                    _ => {}
                }
            }
        }
        assert!(saw_clear);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_media() {
        let (_in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let session = CarrierSession::start(out_tx, in_rx);

        session.send_media(&vec![0u8; 160 * (OUTBOUND_QUEUE_CAPACITY + 10)]);
        assert_eq!(session.dropped_outbound(), 10);
        assert_eq!(session.pending_outbound(), OUTBOUND_QUEUE_CAPACITY);
    }

    #[test]
    fn marks_survive_clear() {
        let queue = OutboundQueue::new();
        queue.push_media(Bytes::from_static(&[0u8; 160]));
        queue.push_mark("turn-1".into());
        queue.clear_media();
        assert!(matches!(queue.pop(), Some(OutItem::Mark(_))));
        assert!(queue.pop().is_none());
    }
}
