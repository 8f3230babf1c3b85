//! Call connection lifecycle.
//!
//! One [`CallSession`] owns every moving part of a call: the channel
//! subscription, the presence tracker, the media manager, the outbound
//! frame sender and the inbound surface. All channel events funnel through
//! a single queue consumed by [`CallSession::run`], so state transitions
//! and surface updates never race.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelEvent, FrameMessage, PresenceRecord, Role, VIDEO_STREAM_EVENT};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::frame::{FrameSender, PaintOutcome, RemoteSurface};
use crate::media::{MediaBackend, MediaConstraints, MediaDeviceManager, RgbFrame};
use crate::presence::{PresenceEvent, PresenceTracker};

/// Connection lifecycle states. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Ended,
}

impl ConnectionState {
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Idle, Connecting) => true,
            (Connecting, Connected) | (Connecting, Disconnected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connecting) | (Disconnected, Connected) => true,
            _ => false,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Ended => "ended",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing happenings surfaced by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    CounterpartJoined(String),
    CounterpartLeft,
    /// Local media could not be acquired; the call continues receive-only.
    MediaUnavailable(String),
}

/// Wall-clock call timer, running only while connected.
#[derive(Default)]
struct DurationTicker {
    started: Option<Instant>,
    accumulated: std::time::Duration,
}

impl DurationTicker {
    fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        if let Some(at) = self.started.take() {
            self.accumulated += at.elapsed();
        }
    }

    fn elapsed(&self) -> std::time::Duration {
        match self.started {
            Some(at) => self.accumulated + at.elapsed(),
            None => self.accumulated,
        }
    }
}

pub struct CallSession {
    call_id: String,
    role: Role,
    display_name: String,
    config: CallConfig,
    channel: Arc<dyn Channel>,
    media: MediaDeviceManager,
    presence: PresenceTracker,
    surface: RemoteSurface,
    sender: Option<FrameSender>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    state_tx: watch::Sender<ConnectionState>,
    connected_tx: watch::Sender<bool>,
    elapsed_tx: watch::Sender<u64>,
    ticker_cancel: Option<CancellationToken>,
    notice_tx: mpsc::UnboundedSender<CallNotice>,
    notice_rx: Option<mpsc::UnboundedReceiver<CallNotice>>,
    cancel: CancellationToken,
    timer: DurationTicker,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        role: Role,
        display_name: impl Into<String>,
        channel: Arc<dyn Channel>,
        backend: Arc<dyn MediaBackend>,
        config: CallConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (connected_tx, _) = watch::channel(false);
        let (elapsed_tx, _) = watch::channel(0u64);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let constraints = MediaConstraints {
            width: config.frame_width * 2,
            height: config.frame_height * 2,
            ..MediaConstraints::default()
        };
        Self {
            call_id: call_id.into(),
            role,
            display_name: display_name.into(),
            config,
            channel,
            media: MediaDeviceManager::new(backend, constraints),
            presence: PresenceTracker::new(role),
            surface: RemoteSurface::new(role),
            sender: None,
            events: None,
            state_tx,
            connected_tx,
            elapsed_tx,
            ticker_cancel: None,
            notice_tx,
            notice_rx: Some(notice_rx),
            cancel: CancellationToken::new(),
            timer: DurationTicker::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe state changes without holding the session.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Session notices. Yields once.
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<CallNotice>> {
        self.notice_rx.take()
    }

    /// Render feed for the counterpart. Available after the first remote
    /// frame; yields once per allocation.
    pub fn take_remote_video(&mut self) -> Option<watch::Receiver<RgbFrame>> {
        self.surface.take_output()
    }

    pub fn call_duration(&self) -> std::time::Duration {
        self.timer.elapsed()
    }

    /// Elapsed call seconds, updated once per second while connected.
    pub fn watch_call_seconds(&self) -> watch::Receiver<u64> {
        self.elapsed_tx.subscribe()
    }

    fn start_ticker(&mut self) {
        self.stop_ticker();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.elapsed_tx.clone();
        let base = self.timer.elapsed();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tx.send_replace((base + started.elapsed()).as_secs());
            }
        });
        self.ticker_cancel = Some(cancel);
    }

    fn stop_ticker(&mut self) {
        if let Some(cancel) = self.ticker_cancel.take() {
            cancel.cancel();
        }
    }

    pub fn toggle_camera(&self) -> Option<bool> {
        self.media.toggle_video()
    }

    /// Swap the camera mid-call. The old stream runs until the new one is
    /// live; the frame sender is rebound to the new track's feed.
    pub async fn switch_device(&mut self, device_id: &str) -> Result<(), CallError> {
        self.media.switch_device(device_id).await?;
        if let Some(sender) = self.sender.take() {
            sender.stop();
        }
        if self.events.is_some() {
            if let Some(video) = self.media.video_track() {
                self.sender = Some(FrameSender::spawn(
                    Arc::clone(&self.channel),
                    video.frames(),
                    video.enabled_flag(),
                    self.connected_tx.subscribe(),
                    self.role,
                    self.config.clone(),
                ));
            }
        }
        Ok(())
    }

    pub fn toggle_microphone(&self) -> Option<bool> {
        self.media.toggle_audio()
    }

    /// Join the call room and start local media.
    ///
    /// Media failure is not fatal; the session degrades to receive-only and
    /// surfaces a [`CallNotice::MediaUnavailable`].
    pub async fn connect(&mut self) -> Result<(), CallError> {
        self.transition(ConnectionState::Connecting)?;

        if let Err(e) = self.media.acquire().await {
            tracing::warn!("continuing without local media: {e}");
            let _ = self
                .notice_tx
                .send(CallNotice::MediaUnavailable(e.user_message().to_string()));
        }

        let events = match self.channel.join().await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!("room join failed: {e}");
                self.transition(ConnectionState::Disconnected)?;
                return Err(e);
            }
        };
        self.events = Some(events);

        self.channel
            .track(&PresenceRecord {
                role: self.role,
                display_name: self.display_name.clone(),
                online_at: Utc::now(),
            })
            .await?;

        if let Some(video) = self.media.video_track() {
            self.sender = Some(FrameSender::spawn(
                Arc::clone(&self.channel),
                video.frames(),
                video.enabled_flag(),
                self.connected_tx.subscribe(),
                self.role,
                self.config.clone(),
            ));
        }

        tracing::info!(call_id = %self.call_id, role = %self.role, "joined call room");
        Ok(())
    }

    /// Process one queued channel event. Returns `false` once the queue is
    /// closed or the session is over.
    pub async fn pump(&mut self) -> bool {
        let Some(events) = self.events.as_mut() else {
            return false;
        };
        let event = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            event = events.recv() => event,
        };
        match event {
            Some(event) => {
                self.handle_event(event);
                self.state() != ConnectionState::Ended
            }
            None => {
                // Transport dropped underneath us.
                if matches!(
                    self.state(),
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    let _ = self.transition(ConnectionState::Disconnected);
                    self.surface.clear();
                }
                false
            }
        }
    }

    /// Drive the session until the room goes away or the call ends.
    pub async fn run(&mut self) {
        while self.pump().await {}
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        if let ChannelEvent::Broadcast { event, payload } = &event {
            if event == VIDEO_STREAM_EVENT {
                self.handle_frame(payload.clone());
                return;
            }
            tracing::debug!("ignoring broadcast event {event}");
            return;
        }

        match self.presence.observe(&event) {
            Some(PresenceEvent::CounterpartOnline(record)) => {
                let _ = self
                    .notice_tx
                    .send(CallNotice::CounterpartJoined(record.display_name.clone()));
                if self.state() == ConnectionState::Connecting
                    || self.state() == ConnectionState::Disconnected
                {
                    let _ = self.transition(ConnectionState::Connected);
                }
            }
            Some(PresenceEvent::CounterpartLeft) => {
                let _ = self.notice_tx.send(CallNotice::CounterpartLeft);
                if self.state() == ConnectionState::Connected {
                    let _ = self.transition(ConnectionState::Disconnected);
                }
                // Stale frame must not linger after the counterpart is gone.
                self.surface.clear();
            }
            None => {}
        }
    }

    fn handle_frame(&mut self, payload: serde_json::Value) {
        let message: FrameMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("malformed frame payload: {e}");
                return;
            }
        };
        match self.surface.paint(&message) {
            Ok(PaintOutcome::First) => {
                // Media can outrun presence; an inbound frame is proof the
                // counterpart is there.
                if self.state() == ConnectionState::Connecting
                    || self.state() == ConnectionState::Disconnected
                {
                    let _ = self.transition(ConnectionState::Connected);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("dropping undecodable frame: {e}"),
        }
    }

    fn transition(&mut self, next: ConnectionState) -> Result<(), CallError> {
        let current = self.state();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            tracing::warn!("rejected transition {current} -> {next}");
            return Err(CallError::InvalidTransition {
                from: current.as_str(),
                to: next.as_str(),
            });
        }
        tracing::info!("call state {current} -> {next}");
        if next == ConnectionState::Connected {
            self.timer.start();
            self.start_ticker();
        } else if current == ConnectionState::Connected {
            self.timer.pause();
            self.stop_ticker();
        }
        // send_replace: the value must move even when nobody subscribed yet.
        self.connected_tx
            .send_replace(next == ConnectionState::Connected);
        self.state_tx.send_replace(next);
        Ok(())
    }

    /// End the call. Teardown order is fixed: stop the loops, stop local
    /// media, drop the remote surface, then leave the room.
    pub async fn hangup(&mut self) {
        if self.state() == ConnectionState::Ended {
            return;
        }
        self.cancel.cancel();
        self.stop_ticker();
        if let Some(sender) = self.sender.take() {
            sender.stop();
        }
        self.media.release();
        self.surface.clear();
        self.events = None;
        if let Err(e) = self.channel.leave().await {
            tracing::warn!("room leave failed during hangup: {e}");
        }
        let _ = self.transition(ConnectionState::Ended);
        tracing::info!(
            call_id = %self.call_id,
            duration_secs = self.timer.elapsed().as_secs(),
            "call ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryBroker;
    use crate::channel::room_id;
    use crate::frame::codec;
    use crate::media::synthetic::SyntheticBackend;

    fn presence(role: Role, name: &str) -> PresenceRecord {
        PresenceRecord {
            role,
            display_name: name.into(),
            online_at: Utc::now(),
        }
    }

    fn frame_payload(role: Role) -> serde_json::Value {
        let config = CallConfig::default();
        let frame = RgbFrame::filled(32, 24, [9, 9, 9]);
        serde_json::to_value(FrameMessage {
            sender_role: role,
            encoded_image: codec::prepare(&frame, &config, None).unwrap(),
            captured_at: Utc::now(),
        })
        .unwrap()
    }

    fn session(role: Role) -> CallSession {
        let broker = MemoryBroker::new();
        let channel = Arc::new(broker.channel(&room_id("t1")));
        CallSession::new(
            "t1",
            role,
            "Tester",
            channel,
            SyntheticBackend::new(),
            CallConfig::default(),
        )
    }

    #[test]
    fn transition_table_is_enforced() {
        use ConnectionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(!Idle.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Ended));
        assert!(!Ended.can_transition_to(Connecting));
        assert!(!Ended.can_transition_to(Idle));
    }

    #[tokio::test]
    async fn counterpart_presence_flips_connecting_to_connected() {
        let mut session = session(Role::Host);
        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);

        session.handle_event(ChannelEvent::PresenceJoin(presence(Role::Guest, "Ana")));
        assert_eq!(session.state(), ConnectionState::Connected);

        // A repeated join while already online is a no-op.
        session.handle_event(ChannelEvent::PresenceJoin(presence(Role::Guest, "Ana")));
        assert_eq!(session.state(), ConnectionState::Connected);

        let mut notices = session.take_notices().unwrap();
        assert_eq!(
            notices.try_recv().unwrap(),
            CallNotice::CounterpartJoined("Ana".into())
        );
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_frame_alone_flips_connected() {
        let mut session = session(Role::Host);
        session.connect().await.unwrap();

        session.handle_event(ChannelEvent::Broadcast {
            event: VIDEO_STREAM_EVENT.into(),
            payload: frame_payload(Role::Guest),
        });
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.take_remote_video().is_some());
    }

    #[tokio::test]
    async fn own_frames_do_not_connect_or_render() {
        let mut session = session(Role::Guest);
        session.connect().await.unwrap();

        session.handle_event(ChannelEvent::Broadcast {
            event: VIDEO_STREAM_EVENT.into(),
            payload: frame_payload(Role::Guest),
        });
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(session.take_remote_video().is_none());
    }

    #[tokio::test]
    async fn counterpart_leave_disconnects_and_clears_surface() {
        let mut session = session(Role::Host);
        session.connect().await.unwrap();
        session.handle_event(ChannelEvent::PresenceJoin(presence(Role::Guest, "Ana")));
        session.handle_event(ChannelEvent::Broadcast {
            event: VIDEO_STREAM_EVENT.into(),
            payload: frame_payload(Role::Guest),
        });
        assert!(session.surface.has_surface());

        session.handle_event(ChannelEvent::PresenceLeave(presence(Role::Guest, "Ana")));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.surface.has_surface());

        // Rejoin reconnects.
        session.handle_event(ChannelEvent::PresenceJoin(presence(Role::Guest, "Ana")));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn hangup_is_terminal() {
        let mut session = session(Role::Host);
        session.connect().await.unwrap();
        session.hangup().await;
        assert_eq!(session.state(), ConnectionState::Ended);
        assert!(session.media.stream().is_none());
        assert!(session.sender.is_none());

        // Ended stays ended.
        session.handle_event(ChannelEvent::PresenceJoin(presence(Role::Guest, "Ana")));
        assert_eq!(session.state(), ConnectionState::Ended);
        assert!(session.connect().await.is_err());
        session.hangup().await;
        assert_eq!(session.state(), ConnectionState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_device_rebinds_the_frame_sender() {
        let mut session = session(Role::Host);
        session.connect().await.unwrap();
        assert!(session.sender.is_some());
        let mut old_frames = session.media.video_track().unwrap().frames();
        old_frames.changed().await.unwrap();

        session.switch_device("synthetic-0").await.unwrap();
        assert!(session.sender.is_some());

        // The replaced track's producer shut down with its stream.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        old_frames.borrow_and_update();
        assert!(old_frames.changed().await.is_err());

        // A failed switch leaves the running stream and sender alone.
        let err = session.switch_device("no-such-camera").await.unwrap_err();
        assert!(matches!(err, CallError::MediaDeviceNotFound));
        assert!(session.sender.is_some());
        assert!(session.media.video_track().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn state_publishes_without_external_watchers() {
        // No watch_state/watch_call_seconds subscription exists anywhere
        // here; transitions and the ticker must still land.
        let mut session = session(Role::Host);
        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);

        session.handle_event(ChannelEvent::PresenceJoin(presence(Role::Guest, "Ana")));
        assert_eq!(session.state(), ConnectionState::Connected);

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        // A watcher attached after the fact sees the published count.
        assert!(*session.watch_call_seconds().borrow() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_runs_only_while_connected() {
        let mut session = session(Role::Host);
        session.connect().await.unwrap();
        assert_eq!(session.call_duration().as_secs(), 0);
        let seconds = session.watch_call_seconds();

        session.handle_event(ChannelEvent::PresenceJoin(presence(Role::Guest, "Ana")));
        tokio::time::sleep(std::time::Duration::from_secs(40)).await;
        session.handle_event(ChannelEvent::PresenceLeave(presence(Role::Guest, "Ana")));
        tokio::time::sleep(std::time::Duration::from_secs(100)).await;
        assert_eq!(session.call_duration().as_secs(), 40);
        // Ticker stopped at disconnect; the published count no longer moves.
        assert!(*seconds.borrow() >= 39);
        assert!(*seconds.borrow() <= 40);
    }
}
