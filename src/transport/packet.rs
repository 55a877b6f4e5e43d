use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, trace, warn};

use super::frame::{Frame, MAX_FRAME_PAYLOAD};
use crate::error::{FrameFailure, TransportError};
use crate::hw::ReadySession;
use crate::notification::NotifyEvent;
use crate::protocol::{AckMode, ProtocolProfile};
use crate::render::BitmapImage;
use crate::utils::duration_millis;

const DRAIN_NOTIFICATION_TIMEOUT: Duration = Duration::from_millis(25);
const MAX_STALE_NOTIFICATION_DRAIN: usize = 8;
/// Pacing used when the negotiated endpoint cannot notify acknowledgements.
const UNACKNOWLEDGED_INTER_FRAME_DELAY: Duration = Duration::from_millis(30);

/// Outcome of one frame on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct FrameRecord {
    sequence: u32,
    frame_type: u8,
    payload_len: usize,
    attempts: u32,
}

impl FrameRecord {
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    #[must_use]
    pub fn frame_type(&self) -> u8 {
        self.frame_type
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Number of times the frame was written, retries included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Summary of a completed send.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SendReceipt {
    frames: Vec<FrameRecord>,
    print_confirmed: bool,
}

impl SendReceipt {
    /// Every frame sent, print trigger last.
    #[must_use]
    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    /// Total payload bytes delivered.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        self.frames.iter().map(FrameRecord::payload_len).sum()
    }

    /// Number of frame writes beyond the first attempt of each frame.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.frames.iter().map(|frame| frame.attempts - 1).sum()
    }

    /// Whether the printer reported print completion.
    #[must_use]
    pub fn print_confirmed(&self) -> bool {
        self.print_confirmed
    }
}

enum AckOutcome {
    Accepted,
    Rejected(FrameFailure),
    StreamClosed,
}

/// Splits rasters into checksummed frames and delivers them in order.
#[derive(Debug, Clone)]
pub struct PacketTransport {
    profile: ProtocolProfile,
    max_payload: usize,
    frame_retries: u32,
}

impl PacketTransport {
    /// Creates a transport for `profile` at the given packet size.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidFrameSize`] when the resolved payload
    /// limit is zero or exceeds the 16-bit length field.
    ///
    /// ```
    /// use peripage::{PacketTransport, ProtocolProfile};
    ///
    /// let transport = PacketTransport::new(ProtocolProfile::peripage_a6(), 512, 3)?;
    /// assert_eq!(508, transport.max_payload());
    /// # Ok::<(), peripage::TransportError>(())
    /// ```
    pub fn new(
        profile: ProtocolProfile,
        max_packet_size: usize,
        frame_retries: u32,
    ) -> Result<Self, TransportError> {
        let max_payload = profile.max_payload_for(max_packet_size);
        if max_payload == 0 || max_payload > MAX_FRAME_PAYLOAD {
            return Err(TransportError::InvalidFrameSize { max_payload });
        }

        Ok(Self {
            profile,
            max_payload,
            frame_retries,
        })
    }

    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Sends every image followed by the print trigger.
    ///
    /// Frames are written strictly in order; each is written at most
    /// `1 + frame_retries` times. `cancel` is observed between frames only.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when a write fails, a frame exhausts its
    /// retries, print completion is not reported in time, or the send is
    /// cancelled.
    #[instrument(
        skip(self, session, images, cancel),
        level = "debug",
        fields(
            images = images.len(),
            max_payload = self.max_payload,
            frames_sent = tracing::field::Empty
        )
    )]
    pub async fn send(
        &self,
        session: &mut ReadySession,
        images: &[BitmapImage],
        cancel: &CancellationToken,
    ) -> Result<SendReceipt, TransportError> {
        drain_stale_notifications(session).await;

        let mut frames = Vec::new();
        let mut sequence = 0u32;
        for image in images {
            for chunk in image.bytes().chunks(self.max_payload) {
                sequence += 1;
                let record = self
                    .send_frame(session, sequence, self.profile.data_frame_type(), chunk, cancel)
                    .await?;
                frames.push(record);
            }
        }

        sequence += 1;
        let trigger = self
            .send_frame(
                session,
                sequence,
                self.profile.print_trigger_frame_type(),
                self.profile.print_trigger_payload(),
                cancel,
            )
            .await?;
        frames.push(trigger);

        let print_confirmed = self.await_print_complete(session, sequence).await?;
        Span::current().record("frames_sent", frames.len());
        info!(frames = frames.len(), print_confirmed, "print job sent");

        Ok(SendReceipt {
            frames,
            print_confirmed,
        })
    }

    async fn send_frame(
        &self,
        session: &mut ReadySession,
        sequence: u32,
        frame_type: u8,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<FrameRecord, TransportError> {
        if cancel.is_cancelled() {
            info!(sequence, "send cancelled");
            return Err(TransportError::Cancelled { sequence });
        }
        if payload.len() > self.max_payload {
            return Err(TransportError::InvalidFrameSize {
                max_payload: self.max_payload,
            });
        }

        let frame = Frame::new(frame_type, payload.to_vec(), self.profile.checksum()).map_err(
            |_| TransportError::InvalidFrameSize {
                max_payload: self.max_payload,
            },
        )?;
        let attempts = self.deliver(session, sequence, &frame).await?;

        Ok(FrameRecord {
            sequence,
            frame_type,
            payload_len: payload.len(),
            attempts,
        })
    }

    /// Writes one frame until it is accepted or its attempts run out.
    ///
    /// After an acknowledgement timeout the frame is only rewritten once a
    /// second `ack_timeout` window has passed without a reply, so a late
    /// acknowledgement is credited to the write it answers.
    #[instrument(
        skip(self, session, frame),
        level = "trace",
        fields(frame_type = frame.frame_type(), payload_len = frame.payload().len())
    )]
    async fn deliver(
        &self,
        session: &mut ReadySession,
        sequence: u32,
        frame: &Frame,
    ) -> Result<u32, TransportError> {
        let encoded = frame.encode();
        let max_attempts = self.frame_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            session
                .write(&encoded)
                .await
                .map_err(|error| TransportError::WriteFailed {
                    sequence,
                    detail: error.to_string(),
                })?;

            let failure = match self.await_ack(session).await {
                AckOutcome::Accepted => {
                    trace!(sequence, attempt, "frame accepted");
                    return Ok(attempt);
                }
                AckOutcome::Rejected(failure) => failure,
                AckOutcome::StreamClosed => {
                    return Err(TransportError::WriteFailed {
                        sequence,
                        detail: "notification stream closed while awaiting acknowledgement"
                            .to_string(),
                    });
                }
            };
            warn!(sequence, attempt, max_attempts, %failure, "frame not accepted");

            if attempt >= max_attempts {
                if self.frame_retries == 0 {
                    return Err(single_attempt_error(sequence, failure));
                }
                return Err(TransportError::RetryExhausted {
                    sequence,
                    attempts: attempt,
                    last_failure: failure,
                });
            }

            // A reply may still be in flight for the write that timed out.
            // It belongs to that write, never to the retry.
            if matches!(failure, FrameFailure::AckTimeout { .. })
                && let AckOutcome::Accepted = self.await_ack(session).await
            {
                debug!(sequence, attempt, "late acknowledgement accepted before retry");
                return Ok(attempt);
            }
        }
    }

    async fn await_ack(&self, session: &mut ReadySession) -> AckOutcome {
        let ack_timeout = match self.profile.ack_mode() {
            AckMode::FixedDelay { inter_frame } => {
                sleep(inter_frame).await;
                return AckOutcome::Accepted;
            }
            AckMode::Notify { ack_timeout } => ack_timeout,
        };
        let Some(stream) = session.notifications() else {
            sleep(UNACKNOWLEDGED_INTER_FRAME_DELAY).await;
            return AckOutcome::Accepted;
        };

        let deadline = Instant::now() + ack_timeout;
        loop {
            match timeout_at(deadline, stream.next()).await {
                Err(_elapsed) => {
                    return AckOutcome::Rejected(FrameFailure::AckTimeout {
                        timeout_ms: duration_millis(ack_timeout),
                    });
                }
                Ok(None) => return AckOutcome::StreamClosed,
                Ok(Some(payload)) => match NotifyEvent::classify(&self.profile, &payload) {
                    NotifyEvent::Ack => return AckOutcome::Accepted,
                    NotifyEvent::Nak => {
                        return AckOutcome::Rejected(FrameFailure::ChecksumMismatch);
                    }
                    NotifyEvent::PrintComplete => {
                        debug!("ignoring print completion while awaiting acknowledgement");
                    }
                    NotifyEvent::Unknown(raw) => {
                        return AckOutcome::Rejected(FrameFailure::UnexpectedResponse(raw));
                    }
                },
            }
        }
    }

    /// Waits for the printer to report the page as printed.
    ///
    /// Returns `false` when the profile or endpoint cannot report completion.
    async fn await_print_complete(
        &self,
        session: &mut ReadySession,
        sequence: u32,
    ) -> Result<bool, TransportError> {
        let AckMode::Notify { .. } = self.profile.ack_mode() else {
            return Ok(false);
        };
        let Some(pattern) = self.profile.print_complete_pattern() else {
            return Ok(false);
        };
        let Some(stream) = session.notifications() else {
            return Ok(false);
        };

        let print_timeout = self.profile.print_complete_timeout();
        let deadline = Instant::now() + print_timeout;
        loop {
            match timeout_at(deadline, stream.next()).await {
                Err(_elapsed) => {
                    return Err(TransportError::AckTimeout {
                        sequence,
                        timeout_ms: duration_millis(print_timeout),
                    });
                }
                Ok(None) => {
                    return Err(TransportError::WriteFailed {
                        sequence,
                        detail: "notification stream closed while awaiting print completion"
                            .to_string(),
                    });
                }
                Ok(Some(payload)) if pattern.matches(&payload) => return Ok(true),
                Ok(Some(payload)) => {
                    debug!(payload_len = payload.len(), "ignoring notification before print completion");
                }
            }
        }
    }
}

fn single_attempt_error(sequence: u32, failure: FrameFailure) -> TransportError {
    match failure {
        FrameFailure::AckTimeout { timeout_ms } => TransportError::AckTimeout {
            sequence,
            timeout_ms,
        },
        FrameFailure::ChecksumMismatch => TransportError::ChecksumMismatch { sequence },
        last_failure @ FrameFailure::UnexpectedResponse(_) => TransportError::RetryExhausted {
            sequence,
            attempts: 1,
            last_failure,
        },
    }
}

/// Discards notifications left over from earlier exchanges.
async fn drain_stale_notifications(session: &mut ReadySession) {
    let Some(stream) = session.notifications() else {
        return;
    };

    let mut drained_count = 0usize;
    for _attempt in 0..MAX_STALE_NOTIFICATION_DRAIN {
        match timeout(DRAIN_NOTIFICATION_TIMEOUT, stream.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(_payload)) => drained_count += 1,
        }
    }

    if drained_count > 0 {
        trace!(
            drained_notifications = drained_count,
            "drained stale notifications before send"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::hw::{
        AckBehaviour, BleAdapter, ConnectPolicy, FakeBackendConfig, FakeBleAdapter,
        FakeDeviceProbe, connect, handshake,
    };

    async fn ready_session(config: FakeBackendConfig) -> (ReadySession, FakeDeviceProbe) {
        let adapter = Arc::new(FakeBleAdapter::new(config));
        let probe = adapter.probe();
        adapter.start_scan().await.expect("scan should start");
        let device = adapter
            .scan_tick()
            .await
            .expect("scan should succeed")
            .and_then(|devices| devices.into_iter().next())
            .expect("fixture should advertise a device");
        let connection = connect(
            adapter.as_ref(),
            &device,
            &ConnectPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("connect should succeed");
        let session = handshake(connection, &ProtocolProfile::peripage_a6(), Duration::from_secs(5))
            .await
            .expect("handshake should succeed");
        (session, probe)
    }

    fn config() -> FakeBackendConfig {
        FakeBackendConfig::builder()
            .scan_fixture("AA:BB:CC:DD:EE:FF|PeriPage_A6|-40".parse().expect("fixture should parse"))
            .build()
    }

    fn image(len: usize) -> BitmapImage {
        let rows = u32::try_from(len / 48).expect("row count fits");
        BitmapImage::new(384, rows, vec![0x5A; len]).expect("image should be valid")
    }

    fn transport(frame_retries: u32) -> PacketTransport {
        PacketTransport::new(ProtocolProfile::peripage_a6(), 512, frame_retries)
            .expect("transport should be valid")
    }

    #[rstest]
    #[case(4)]
    #[case(3)]
    fn new_rejects_packets_without_payload_room(#[case] max_packet_size: usize) {
        assert_matches!(
            PacketTransport::new(ProtocolProfile::peripage_a6(), max_packet_size, 3),
            Err(TransportError::InvalidFrameSize { max_payload: 0 })
        );
    }

    #[test]
    fn new_rejects_payload_beyond_length_field() {
        assert_matches!(
            PacketTransport::new(ProtocolProfile::peripage_a6(), 70_000, 3),
            Err(TransportError::InvalidFrameSize { .. })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_writes_data_frames_then_trigger() {
        let (mut session, probe) = ready_session(config()).await;

        let receipt = transport(3)
            .send(&mut session, &[image(96)], &CancellationToken::new())
            .await
            .expect("send should succeed");

        let frames = probe.written_frames();
        assert_eq!(2, frames.len());
        assert_eq!(0x01, frames[0].frame_type());
        assert_eq!(vec![0x5A; 96], frames[0].payload());
        assert_eq!(0x02, frames[1].frame_type());
        assert_eq!(&[0x1B, 0x4A, 0x40], frames[1].payload());
        assert!(receipt.print_confirmed());
        assert_eq!(0, receipt.retries());
    }

    #[tokio::test(start_paused = true)]
    async fn nak_is_retried_with_same_bytes() {
        let config = FakeBackendConfig::builder()
            .scan_fixture("AA:BB:CC:DD:EE:FF|PeriPage_A6|-40".parse().expect("fixture should parse"))
            .ack_behaviour(AckBehaviour::Nak { frame: 1, times: 2 })
            .build();
        let (mut session, probe) = ready_session(config).await;

        let receipt = transport(3)
            .send(&mut session, &[image(48)], &CancellationToken::new())
            .await
            .expect("send should succeed after retries");

        let frames = probe.written_frames();
        assert_eq!(4, frames.len());
        assert_eq!(frames[0], frames[1]);
        assert_eq!(frames[1], frames[2]);
        assert_eq!(3, receipt.frames()[0].attempts());
        assert_eq!(2, receipt.retries());
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_surfaces_ack_timeout() {
        let config = FakeBackendConfig::builder()
            .scan_fixture("AA:BB:CC:DD:EE:FF|PeriPage_A6|-40".parse().expect("fixture should parse"))
            .ack_behaviour(AckBehaviour::Silent)
            .build();
        let (mut session, _probe) = ready_session(config).await;

        let result = transport(0)
            .send(&mut session, &[image(48)], &CancellationToken::new())
            .await;

        assert_eq!(
            Err(TransportError::AckTimeout {
                sequence: 1,
                timeout_ms: 2_000
            }),
            result
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_surfaces_checksum_mismatch() {
        let config = FakeBackendConfig::builder()
            .scan_fixture("AA:BB:CC:DD:EE:FF|PeriPage_A6|-40".parse().expect("fixture should parse"))
            .ack_behaviour(AckBehaviour::Nak { frame: 1, times: 1 })
            .build();
        let (mut session, _probe) = ready_session(config).await;

        let result = transport(0)
            .send(&mut session, &[image(48)], &CancellationToken::new())
            .await;

        assert_eq!(Err(TransportError::ChecksumMismatch { sequence: 1 }), result);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_stops_before_first_frame() {
        let (mut session, probe) = ready_session(config()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transport(3).send(&mut session, &[image(48)], &cancel).await;

        assert_eq!(Err(TransportError::Cancelled { sequence: 1 }), result);
        assert!(probe.written_frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_print_completion_times_out() {
        let config = FakeBackendConfig::builder()
            .scan_fixture("AA:BB:CC:DD:EE:FF|PeriPage_A6|-40".parse().expect("fixture should parse"))
            .print_complete(false)
            .build();
        let (mut session, _probe) = ready_session(config).await;

        let result = transport(3)
            .send(&mut session, &[image(48)], &CancellationToken::new())
            .await;

        assert_eq!(
            Err(TransportError::AckTimeout {
                sequence: 2,
                timeout_ms: 10_000
            }),
            result
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_is_credited_to_the_write_it_answers() {
        let (mut session, probe) = ready_session(config()).await;
        probe.set_ack_delay(Duration::from_millis(2_500));

        let receipt = transport(3)
            .send(&mut session, &[image(1_008)], &CancellationToken::new())
            .await
            .expect("late acknowledgements should still complete the send");

        let frames = probe.written_frames();
        let sizes: Vec<usize> = frames.iter().map(|frame| frame.payload().len()).collect();
        assert_eq!(vec![508, 500, 3], sizes);
        let attempts: Vec<u32> = receipt.frames().iter().map(FrameRecord::attempts).collect();
        assert_eq!(vec![1, 1, 1], attempts);
        assert!(receipt.print_confirmed());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_ack_is_retried_after_late_reply_window() {
        let config = FakeBackendConfig::builder()
            .scan_fixture("AA:BB:CC:DD:EE:FF|PeriPage_A6|-40".parse().expect("fixture should parse"))
            .ack_behaviour(AckBehaviour::DropAck { frame: 1, times: 1 })
            .build();
        let (mut session, probe) = ready_session(config).await;
        let started = Instant::now();

        let receipt = transport(3)
            .send(&mut session, &[image(48)], &CancellationToken::new())
            .await
            .expect("send should succeed after one retry");

        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(3, probe.written_frames().len());
        assert_eq!(2, receipt.frames()[0].attempts());
        assert_eq!(1, receipt.retries());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_fails_write() {
        let (mut session, probe) = ready_session(config()).await;
        probe.drop_link();

        let result = transport(3)
            .send(&mut session, &[image(48)], &CancellationToken::new())
            .await;

        assert_matches!(result, Err(TransportError::WriteFailed { sequence: 1, .. }));
    }
}
