//! Session orchestration: one driver task owns the media, the peer
//! connection and the signaling channel, and sequences the whole
//! negotiation lifecycle. The embedding application talks to it through
//! a command handle and an ordered event stream.

mod media;
mod peer;

pub use media::{LocalMedia, MediaSource, SampleTrackSource};
pub use peer::PeerEvent;

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{SessionConfig, Verbosity};
use crate::error::SessionError;
use crate::join::JoinPayload;
use crate::ramp::{BitrateAllocation, BitrateControls, BitrateRamper, BitrateSink};
use crate::sdp;
use crate::signaling::{
    ChannelEvent, ClientMessage, ControlPayload, DiagnosticKind, PolyControlPayload,
    ServerMessage, SignalingChannel, CLOSE_CODE_ERROR, CLOSE_CODE_LEAVING,
};
use crate::stats::{self, CounterChange, EncoderTelemetry, StatsDelta, StatsSnapshot};

use self::peer::RtcPeer;

const STATS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Lifecycle of one session. `Failed` is absorbing and reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Negotiating,
    Live,
    Ending,
    Closed,
    Failed,
}

/// Notifications delivered to the embedding application, in order.
pub enum SessionEvent {
    LocalStream(LocalMedia),
    Track { track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver> },
    Start,
    Ending,
    Closed,
    Error(String),
    Files { payload: String },
    Stats { delta: StatsDelta, snapshot: StatsSnapshot },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::LocalStream(_) => f.write_str("LocalStream"),
            SessionEvent::Track { track, .. } => {
                f.debug_struct("Track").field("id", &track.id()).finish_non_exhaustive()
            }
            SessionEvent::Start => f.write_str("Start"),
            SessionEvent::Ending => f.write_str("Ending"),
            SessionEvent::Closed => f.write_str("Closed"),
            SessionEvent::Error(text) => f.debug_tuple("Error").field(text).finish(),
            SessionEvent::Files { payload } => {
                f.debug_struct("Files").field("payload", payload).finish()
            }
            SessionEvent::Stats { delta, .. } => {
                f.debug_struct("Stats").field("delta", delta).finish_non_exhaustive()
            }
        }
    }
}

enum SessionCommand {
    Stop { code: u16 },
    ControlFx(ControlPayload),
    PolyControlFx(PolyControlPayload),
    Log { kind: String, payload: Option<String> },
    Limit { max_kbps: u64 },
}

/// Command side of a running session. Dropping the handle does not stop
/// the session; call [`SessionHandle::stop`].
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    allocations: watch::Receiver<BitrateAllocation>,
    telemetry: watch::Sender<EncoderTelemetry>,
}

impl SessionHandle {
    /// Orderly teardown with the normal close code.
    pub fn stop(&self) {
        self.stop_with_code(CLOSE_CODE_LEAVING);
    }

    pub fn stop_with_code(&self, code: u16) {
        let _ = self.commands.send(SessionCommand::Stop { code });
    }

    /// Tune one effect parameter server-side.
    pub fn control(&self, payload: ControlPayload) {
        let _ = self.commands.send(SessionCommand::ControlFx(payload));
    }

    pub fn poly_control(&self, payload: PolyControlPayload) {
        let _ = self.commands.send(SessionCommand::PolyControlFx(payload));
    }

    /// Forward an application-defined record to the server under an
    /// `ext_`-prefixed kind.
    pub fn log(&self, kind: impl Into<String>, payload: Option<String>) {
        let _ = self.commands.send(SessionCommand::Log { kind: kind.into(), payload });
    }

    /// Cap the outbound video bitrate directly, superseding the ramp.
    pub fn limit(&self, max_kbps: u64) {
        let _ = self.commands.send(SessionCommand::Limit { max_kbps });
    }

    /// Bitrate caps as the ramp raises them. Encoders subscribe here.
    pub fn bitrate_allocations(&self) -> watch::Receiver<BitrateAllocation> {
        self.allocations.clone()
    }

    /// Publish encoder-side counters for the next stats snapshot.
    pub fn publish_telemetry(&self, telemetry: EncoderTelemetry) {
        self.telemetry.send_replace(telemetry);
    }
}

pub struct Session;

impl Session {
    /// Validate options, then spawn the driver task.
    ///
    /// Option validation is the only failure surfaced here; everything
    /// later (media acquisition, connect, negotiation) arrives as an
    /// `Error` event followed by `Closed`.
    pub fn start(
        config: SessionConfig,
        media: Arc<dyn MediaSource>,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let join = JoinPayload::build(&config.peer_options)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (controls, allocations) = BitrateControls::new();
        let (telemetry_tx, telemetry_rx) = watch::channel(EncoderTelemetry::default());

        tokio::spawn(drive(
            config,
            join,
            media,
            Arc::new(controls),
            telemetry_rx,
            command_rx,
            event_tx,
        ));

        Ok((
            SessionHandle { commands: command_tx, allocations, telemetry: telemetry_tx },
            event_rx,
        ))
    }
}

struct Driver {
    config: SessionConfig,
    state: SessionState,
    peer: RtcPeer,
    channel: SignalingChannel,
    ramper: BitrateRamper,
    controls: Arc<BitrateControls>,
    telemetry: watch::Receiver<EncoderTelemetry>,
    events: mpsc::UnboundedSender<SessionEvent>,
    prev_snapshot: Option<StatsSnapshot>,
    selected_pair: Option<String>,
    torn_down: bool,
}

async fn drive(
    config: SessionConfig,
    join: JoinPayload,
    media: Arc<dyn MediaSource>,
    controls: Arc<BitrateControls>,
    telemetry: watch::Receiver<EncoderTelemetry>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let fail = |events: &mpsc::UnboundedSender<SessionEvent>, text: String| {
        let _ = events.send(SessionEvent::Error(text));
        let _ = events.send(SessionEvent::Closed);
    };

    let constraints = config.constraints.resolve(&join);
    let local = match media.acquire(&constraints).await {
        Ok(local) => local,
        Err(err) => return fail(&events, format!("media acquisition failed: {err}")),
    };
    let _ = events.send(SessionEvent::LocalStream(local.clone()));

    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let peer = match RtcPeer::new(&config, &join, &local, peer_tx).await {
        Ok(peer) => peer,
        Err(err) => return fail(&events, format!("peer setup failed: {err}")),
    };

    let (channel, channel_rx) = match SignalingChannel::connect(&config.signaling_url).await {
        Ok(connected) => connected,
        Err(err) => {
            peer.close().await;
            return fail(&events, format!("signaling connect failed: {err}"));
        }
    };

    let join_value = match serde_json::to_value(&join) {
        Ok(value) => value,
        Err(err) => {
            peer.close().await;
            channel.close(CLOSE_CODE_LEAVING).await;
            return fail(&events, format!("join serialization failed: {err}"));
        }
    };
    if let Err(err) = channel.send(ClientMessage::Join(join_value)).await {
        peer.close().await;
        return fail(&events, format!("join send failed: {err}"));
    }

    let ramper = BitrateRamper::new(config.ramp);
    let driver = Driver {
        config,
        state: SessionState::Idle,
        peer,
        channel,
        ramper,
        controls,
        telemetry,
        events,
        prev_snapshot: None,
        selected_pair: None,
        torn_down: false,
    };
    driver.run(channel_rx, peer_rx, command_rx).await;
}

impl Driver {
    async fn run(
        mut self,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
        mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // The join is on the wire; negotiation starts with the offer.
        self.state = SessionState::Negotiating;

        loop {
            tokio::select! {
                Some(event) = channel_rx.recv() => {
                    if self.on_channel_event(event).await {
                        break;
                    }
                }
                Some(event) = peer_rx.recv() => {
                    self.on_peer_event(event).await;
                }
                Some(command) = command_rx.recv() => {
                    if self.on_command(command).await {
                        break;
                    }
                }
                _ = stats_tick.tick(), if self.polling() => {
                    self.on_stats_tick().await;
                }
                else => break,
            }
        }

        debug!("session driver exiting in state {:?}", self.state);
    }

    fn running(&self) -> bool {
        matches!(self.state, SessionState::Live | SessionState::Ending)
    }

    fn polling(&self) -> bool {
        self.running() && (self.config.stats || self.config.verbosity >= Verbosity::Events)
    }

    /// Returns true when the driver should exit.
    async fn on_channel_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Message(message) => self.on_server_message(message).await,
            ChannelEvent::Error(text) => {
                let _ = self.events.send(SessionEvent::Error(text));
                self.state = SessionState::Failed;
                self.teardown(CLOSE_CODE_ERROR).await;
                // the reader still owes us its final Closed
                false
            }
            ChannelEvent::Closed => {
                if self.state != SessionState::Failed {
                    self.state = SessionState::Closed;
                }
                self.teardown(CLOSE_CODE_LEAVING).await;
                let _ = self.events.send(SessionEvent::Closed);
                true
            }
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::Offer(offer) => {
                if let Err(err) = self.answer(offer).await {
                    let _ = self.events.send(SessionEvent::Error(format!(
                        "negotiation failed: {err}"
                    )));
                    self.state = SessionState::Failed;
                    self.teardown(CLOSE_CODE_ERROR).await;
                }
            }
            ServerMessage::Candidate(candidate) => {
                // Tolerates candidates racing the description exchange.
                if let Err(err) = self.peer.add_candidate(candidate.into()).await {
                    warn!("remote candidate rejected: {err}");
                    self.diagnose(
                        Verbosity::Debug,
                        DiagnosticKind::IceCandidateFailed,
                        err.to_string(),
                    )
                    .await;
                }
            }
            ServerMessage::Start => {
                self.state = SessionState::Live;
                self.ramper.start(self.controls.clone());
                let telemetry = self.telemetry.borrow().clone();
                self.prev_snapshot = Some(self.peer.snapshot(&telemetry).await);
                let _ = self.events.send(SessionEvent::Start);
                if self.config.verbosity >= Verbosity::Debug {
                    self.report_selected_pair().await;
                }
            }
            ServerMessage::Ending => {
                if self.running() {
                    self.state = SessionState::Ending;
                    let _ = self.events.send(SessionEvent::Ending);
                }
            }
            ServerMessage::Files { payload } => {
                if self.running() {
                    let _ = self.events.send(SessionEvent::Files { payload });
                }
            }
            ServerMessage::Error { kind, payload } => {
                let text = payload.unwrap_or(kind);
                let _ = self.events.send(SessionEvent::Error(text));
                self.state = SessionState::Failed;
                self.teardown(CLOSE_CODE_ERROR).await;
            }
            ServerMessage::Unrecognized(kind) => {
                debug!("ignoring signaling kind {kind}");
            }
        }
        false
    }

    async fn answer(&mut self, offer: RTCSessionDescription) -> Result<(), SessionError> {
        self.peer.set_remote_description(offer).await?;
        let answer = self.peer.create_answer().await?;
        let transformed = sdp::process(&answer.sdp, &self.config.capabilities);
        let answer = RTCSessionDescription::answer(transformed)?;
        self.peer.set_local_description(answer.clone()).await?;
        self.channel.send(ClientMessage::Answer(answer)).await?;
        Ok(())
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(init) => {
                if let Err(err) = self.channel.send(ClientMessage::Candidate(init.into())).await {
                    debug!("local candidate not sent: {err}");
                }
            }
            PeerEvent::Track { track, receiver } => {
                let _ = self.events.send(SessionEvent::Track { track, receiver });
            }
            PeerEvent::ConnectionState(state) => {
                self.diagnose(Verbosity::Debug, DiagnosticKind::ConnectionState, format!("{state}"))
                    .await;
            }
            PeerEvent::SignalingState(state) => {
                self.diagnose(Verbosity::Debug, DiagnosticKind::SignalingState, format!("{state}"))
                    .await;
            }
            PeerEvent::IceConnectionState(state) => {
                self.diagnose(
                    Verbosity::Debug,
                    DiagnosticKind::IceConnectionState,
                    format!("{state}"),
                )
                .await;
            }
            PeerEvent::IceGatheringState(state) => {
                self.diagnose(
                    Verbosity::Debug,
                    DiagnosticKind::IceGatheringState,
                    format!("{state}"),
                )
                .await;
            }
            PeerEvent::NegotiationNeeded => {
                self.diagnose(Verbosity::Debug, DiagnosticKind::NegotiationNeeded, String::new())
                    .await;
            }
        }
    }

    /// Returns true when the driver should exit.
    async fn on_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Stop { code } => {
                self.state = SessionState::Closed;
                self.teardown(code).await;
                let _ = self.events.send(SessionEvent::Closed);
                true
            }
            SessionCommand::ControlFx(payload) => {
                if let Err(err) = self.channel.send(ClientMessage::Control(payload)).await {
                    debug!("control not sent: {err}");
                }
                false
            }
            SessionCommand::PolyControlFx(payload) => {
                if let Err(err) = self.channel.send(ClientMessage::PolyControl(payload)).await {
                    debug!("polycontrol not sent: {err}");
                }
                false
            }
            SessionCommand::Log { kind, payload } => {
                if let Err(err) = self.channel.send(ClientMessage::Ext { kind, payload }).await {
                    debug!("ext record not sent: {err}");
                }
                false
            }
            SessionCommand::Limit { max_kbps } => {
                self.ramper.stop();
                self.controls.set_video_cap(max_kbps * 1000);
                false
            }
        }
    }

    async fn on_stats_tick(&mut self) {
        let telemetry = self.telemetry.borrow().clone();
        let snapshot = self.peer.snapshot(&telemetry).await;

        if let Some(prev) = self.prev_snapshot.take() {
            for change in stats::counter_changes(&prev, &snapshot) {
                let (kind, text) = match change {
                    CounterChange::Resolution { width, height } => {
                        (DiagnosticKind::VideoResolution, format!("{width}x{height}"))
                    }
                    CounterChange::FrameRate(fps) => {
                        (DiagnosticKind::VideoFps, fps.to_string())
                    }
                    CounterChange::PliCount(count) => {
                        (DiagnosticKind::PliReceivedCount, count.to_string())
                    }
                    CounterChange::FirCount(count) => {
                        (DiagnosticKind::FirReceivedCount, count.to_string())
                    }
                    CounterChange::KeyFramesEncoded(count) => {
                        (DiagnosticKind::KeyframeEncodedCount, count.to_string())
                    }
                    CounterChange::KeyFramesDecoded(count) => {
                        (DiagnosticKind::KeyframeDecodedCount, count.to_string())
                    }
                };
                self.diagnose(Verbosity::Events, kind, text).await;
            }

            match stats::diff(&prev, &snapshot) {
                Ok(delta) => {
                    if self.config.stats {
                        let _ = self.events.send(SessionEvent::Stats {
                            delta,
                            snapshot: snapshot.clone(),
                        });
                    }
                }
                Err(err) => debug!("stats interval skipped: {err}"),
            }
        }
        self.prev_snapshot = Some(snapshot);

        if self.config.verbosity >= Verbosity::Debug {
            self.report_selected_pair().await;
        }
    }

    async fn report_selected_pair(&mut self) {
        let pair = self.peer.selected_candidate_pair().await;
        if pair.is_some() && pair != self.selected_pair {
            let text = pair.clone().unwrap_or_default();
            self.selected_pair = pair;
            self.diagnose(Verbosity::Debug, DiagnosticKind::SelectedCandidatePair, text).await;
        }
    }

    /// Side-channel telemetry only, never a state transition.
    async fn diagnose(&self, min: Verbosity, kind: DiagnosticKind, text: String) {
        if self.config.verbosity < min {
            return;
        }
        let text = if text.is_empty() { None } else { Some(text) };
        if let Err(err) = self.channel.send(ClientMessage::Diagnostic { kind, text }).await {
            debug!("diagnostic not sent: {err}");
        }
    }

    async fn teardown(&mut self, code: u16) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.ramper.stop();
        self.peer.close().await;
        self.channel.close(code).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use async_trait::async_trait;
    use serde_json::json;
    use url::Url;

    struct FailingSource;

    #[async_trait]
    impl MediaSource for FailingSource {
        async fn acquire(
            &self,
            _constraints: &crate::config::MediaConstraints,
        ) -> Result<LocalMedia, MediaError> {
            Err(MediaError("no capture device".to_owned()))
        }
    }

    fn config(options: serde_json::Value) -> SessionConfig {
        SessionConfig::new(Url::parse("ws://127.0.0.1:1/ws").unwrap(), options)
    }

    #[tokio::test]
    async fn invalid_options_fail_before_any_activity() {
        let result = Session::start(config(json!({"userId": "u"})), Arc::new(FailingSource));
        assert!(matches!(result, Err(SessionError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn media_failure_surfaces_as_error_then_closed() {
        let (_handle, mut events) = Session::start(
            config(json!({"roomId": "r", "userId": "u", "duration": 30})),
            Arc::new(FailingSource),
        )
        .unwrap();

        match events.recv().await {
            Some(SessionEvent::Error(text)) => assert!(text.contains("no capture device")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(SessionEvent::Closed)));
        assert!(events.recv().await.is_none());
    }
}
