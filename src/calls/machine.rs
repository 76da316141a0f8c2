//! Call session orchestration.
//!
//! The machine is the sole authority over the [`CallSession`]: the only
//! component that acquires media, drives the negotiation engine, or emits
//! call signaling. Everything that can affect the session — UI intents,
//! inbound signaling, engine callbacks, timer ticks, async completions —
//! arrives as a [`SessionEvent`] on one queue and is processed to
//! completion by one task, in receipt order.
//!
//! Media acquisition is the one long await that must not block the queue:
//! it runs in a spawned task and re-enters the queue as `MediaAcquired`,
//! tagged with the session epoch it was started under. A result whose
//! epoch no longer matches the live session is discarded and its handle
//! released on the spot.

use chrono::Utc;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::negotiation::{
    EngineEvent, EngineFactory, NegotiationEngine, NegotiationError, RemoteTrack,
};
use super::signaling::{
    CallAcceptedPayload, CallUserPayload, AnswerCallPayload, ErrorPayload, IceCandidatePayload,
    IncomingCallPayload, InboundSignal, OutboundSignal, RoomPayload,
};
use super::state::{CallRole, CallSession, CallState, CallTransition, EndReason};
use crate::channel::{Envelope, RoomChannel};
use crate::config::ClientConfig;
use crate::events::{
    CallEndedNotice, CallErrorCleared, CallErrorNotice, CallStateChanged, CallTimer, EventBus,
    IncomingCallNotice,
};
use crate::media::{MediaAcquisitionError, MediaHandle, MediaKind, MediaSource};

/// Local intents entering the machine from the UI layer.
#[derive(Debug, Clone)]
pub enum CallIntent {
    Start { kind: MediaKind },
    Answer,
    Reject,
    HangUp,
    SetMuted(bool),
    SetVideoSuppressed(bool),
}

/// Everything serialized onto the machine's queue.
pub enum SessionEvent {
    Intent(CallIntent),
    Signal(InboundSignal),
    MediaAcquired {
        epoch: u64,
        result: Result<Arc<dyn MediaHandle>, MediaAcquisitionError>,
    },
    Engine {
        epoch: u64,
        event: EngineEvent,
    },
    Tick {
        epoch: u64,
    },
    /// Tear down any live session and stop the machine task.
    Shutdown,
}

/// Which termination event goes on the wire during release.
enum ReleaseSignal {
    EndCall,
    Reject,
}

pub struct CallMachine {
    room: String,
    config: ClientConfig,
    channel: Arc<dyn RoomChannel>,
    media: Arc<dyn MediaSource>,
    engines: Arc<dyn EngineFactory>,
    bus: Arc<EventBus>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<CallState>,
    session: Option<CallSession>,
    media_handle: Option<Arc<dyn MediaHandle>>,
    engine: Option<Arc<dyn NegotiationEngine>>,
    engine_pump: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    next_epoch: u64,
}

impl CallMachine {
    #[allow(clippy::type_complexity)]
    pub fn new(
        room: impl Into<String>,
        config: ClientConfig,
        channel: Arc<dyn RoomChannel>,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn EngineFactory>,
        bus: Arc<EventBus>,
    ) -> (
        Self,
        mpsc::UnboundedSender<SessionEvent>,
        mpsc::UnboundedReceiver<SessionEvent>,
        watch::Receiver<CallState>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let machine = Self {
            room: room.into(),
            config,
            channel,
            media,
            engines,
            bus,
            tx: tx.clone(),
            state_tx,
            session: None,
            media_handle: None,
            engine: None,
            engine_pump: None,
            timer: None,
            next_epoch: 0,
        };
        (machine, tx, rx, state_rx)
    }

    /// Consume the queue until all producers are gone, then tear down
    /// whatever session is still live.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            if matches!(event, SessionEvent::Shutdown) {
                break;
            }
            self.handle(event).await;
        }
        self.terminate(EndReason::HungUp, ReleaseSignal::EndCall)
            .await;
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Intent(intent) => self.on_intent(intent).await,
            SessionEvent::Signal(signal) => self.on_signal(signal).await,
            SessionEvent::MediaAcquired { epoch, result } => {
                self.on_media_acquired(epoch, result).await
            }
            SessionEvent::Engine { epoch, event } => self.on_engine_event(epoch, event).await,
            SessionEvent::Tick { epoch } => self.on_tick(epoch),
            // Intercepted by `run` before dispatch.
            SessionEvent::Shutdown => {}
        }
    }

    async fn on_intent(&mut self, intent: CallIntent) {
        match intent {
            CallIntent::Start { kind } => self.on_start(kind),
            CallIntent::Answer => self.on_answer(),
            CallIntent::Reject => self.on_reject().await,
            CallIntent::HangUp => {
                self.terminate(EndReason::HungUp, ReleaseSignal::EndCall)
                    .await
            }
            CallIntent::SetMuted(muted) => self.on_set_muted(muted),
            CallIntent::SetVideoSuppressed(suppressed) => self.on_set_video_suppressed(suppressed),
        }
    }

    async fn on_signal(&mut self, signal: InboundSignal) {
        match signal {
            InboundSignal::IncomingCall(payload) => self.on_incoming_call(payload).await,
            InboundSignal::CallAccepted(payload) => self.on_call_accepted(payload).await,
            InboundSignal::IceCandidate(payload) => self.on_remote_candidate(payload).await,
            InboundSignal::CallRejected(payload) => {
                self.terminate(
                    EndReason::RemoteDeclined(payload.reason),
                    ReleaseSignal::EndCall,
                )
                .await
            }
            InboundSignal::CallEnded(payload) => {
                self.terminate(EndReason::RemoteEnded(payload.reason), ReleaseSignal::EndCall)
                    .await
            }
            InboundSignal::CallFailed(payload) | InboundSignal::CallError(payload) => {
                self.notify_error(payload.message.clone());
                self.terminate(
                    EndReason::RemoteFailed(payload.message),
                    ReleaseSignal::EndCall,
                )
                .await
            }
        }
    }

    fn on_start(&mut self, kind: MediaKind) {
        if self.session.is_some() {
            // The intent boundary disables this; drop strays here too.
            warn!("start_call ignored: a session already exists");
            return;
        }
        let epoch = self.bump_epoch();
        self.session = Some(CallSession::new_caller(epoch, self.room.clone(), kind));
        self.publish();
        self.spawn_media_acquisition(epoch, kind);
    }

    async fn on_incoming_call(&mut self, payload: IncomingCallPayload) {
        if payload.room != self.room {
            debug!("ignoring incoming_call for foreign room {}", payload.room);
            return;
        }
        if self.session.is_some() {
            // No call waiting: refuse the new caller, leave the session alone.
            debug!("busy: rejecting incoming call from {}", payload.from);
            self.emit_best_effort(OutboundSignal::RejectCall(RoomPayload {
                room: self.room.clone(),
            }))
            .await;
            return;
        }
        let epoch = self.bump_epoch();
        self.session = Some(CallSession::new_callee(
            epoch,
            self.room.clone(),
            payload.from.clone(),
            payload.call_type,
            payload.offer,
        ));
        self.publish();
        let _ = self.bus.incoming_call.send(Arc::new(IncomingCallNotice {
            from: payload.from,
            kind: payload.call_type,
            room: self.room.clone(),
        }));
    }

    fn on_answer(&mut self) {
        let Some(session) = self.session.as_mut() else {
            warn!("answer ignored: no call in progress");
            return;
        };
        if !session.state.can_answer() {
            warn!("answer ignored in state {:?}", session.state);
            return;
        }
        let epoch = session.epoch;
        let kind = session.kind;
        if let Err(e) = session.apply_transition(CallTransition::LocalAnswered) {
            warn!("answer rejected: {e}");
            return;
        }
        self.publish();
        self.spawn_media_acquisition(epoch, kind);
    }

    async fn on_reject(&mut self) {
        let can_reject = self
            .session
            .as_ref()
            .is_some_and(|s| s.state.can_reject());
        if !can_reject {
            warn!("reject ignored: no ringing call");
            return;
        }
        self.terminate(EndReason::Declined, ReleaseSignal::Reject)
            .await;
    }

    fn spawn_media_acquisition(&self, epoch: u64, kind: MediaKind) {
        let media = self.media.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = media.acquire(kind).await;
            let _ = tx.send(SessionEvent::MediaAcquired { epoch, result });
        });
    }

    async fn on_media_acquired(
        &mut self,
        epoch: u64,
        result: Result<Arc<dyn MediaHandle>, MediaAcquisitionError>,
    ) {
        let live = self
            .session
            .as_ref()
            .is_some_and(|s| s.epoch == epoch && matches!(s.state, CallState::AwaitingMedia));
        if !live {
            if let Ok(handle) = result {
                debug!("discarding capture acquired for a stale session");
                handle.release();
            }
            return;
        }

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                let notify = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.peer_notified);
                self.fail(e.to_string(), notify).await;
                return;
            }
        };

        let role = {
            let Some(session) = self.session.as_mut() else {
                handle.release();
                return;
            };
            if let Err(e) = session.apply_transition(CallTransition::MediaReady) {
                warn!("media ready rejected: {e}");
                handle.release();
                return;
            }
            session.role
        };
        self.media_handle = Some(handle);
        self.publish();

        let outcome = match role {
            CallRole::Caller => self.negotiate_offer(epoch).await,
            CallRole::Callee => self.negotiate_answer(epoch).await,
        };
        if let Err(e) = outcome {
            let notify = self
                .session
                .as_ref()
                .is_some_and(|s| s.peer_notified);
            self.fail(e.to_string(), notify).await;
        }
    }

    /// Caller path after media: build the offer, publish it, ring the peer.
    async fn negotiate_offer(&mut self, epoch: u64) -> Result<(), CallError> {
        let engine = self.create_engine(epoch).await?;
        let handle = self.media_handle.clone().ok_or(CallError::NoSession)?;
        engine.attach_media(handle).await?;

        let want_video = self
            .session
            .as_ref()
            .is_some_and(|s| s.kind.wants_video());
        let offer = engine.create_offer(want_video).await?;
        engine.set_local_description(offer.clone()).await?;

        let (room, kind) = {
            let session = self.session.as_mut().ok_or(CallError::NoSession)?;
            session.set_local_description(offer.clone())?;
            (session.room.clone(), session.kind)
        };

        self.emit(OutboundSignal::CallUser(CallUserPayload {
            room,
            offer,
            call_type: kind,
        }))
        .await?;

        let session = self.session.as_mut().ok_or(CallError::NoSession)?;
        session.peer_notified = true;
        session.apply_transition(CallTransition::OfferSent)?;
        self.publish();
        Ok(())
    }

    /// Callee path after media: apply the stored offer, answer, drain the
    /// candidate buffer.
    async fn negotiate_answer(&mut self, epoch: u64) -> Result<(), CallError> {
        let engine = self.create_engine(epoch).await?;
        let handle = self.media_handle.clone().ok_or(CallError::NoSession)?;
        engine.attach_media(handle).await?;

        let offer = {
            let session = self.session.as_mut().ok_or(CallError::NoSession)?;
            session.stored_offer.take().ok_or_else(|| {
                CallError::Negotiation(NegotiationError::Description("no stored offer".into()))
            })?
        };

        engine.set_remote_description(offer.clone()).await?;
        let drained = {
            let session = self.session.as_mut().ok_or(CallError::NoSession)?;
            session.set_remote_description(offer)?
        };
        self.apply_candidates(&engine, drained).await;

        let answer = engine.create_answer().await?;
        engine.set_local_description(answer.clone()).await?;

        let room = {
            let session = self.session.as_mut().ok_or(CallError::NoSession)?;
            session.set_local_description(answer.clone())?;
            session.room.clone()
        };

        self.emit(OutboundSignal::AnswerCall(AnswerCallPayload { room, answer }))
            .await?;

        let session = self.session.as_mut().ok_or(CallError::NoSession)?;
        session.apply_transition(CallTransition::AnswerSent)?;
        self.publish();
        Ok(())
    }

    async fn on_call_accepted(&mut self, payload: CallAcceptedPayload) {
        let valid = self.session.as_ref().is_some_and(|s| {
            s.is_caller() && matches!(s.state, CallState::RingingRemote { .. })
        });
        if !valid {
            debug!("ignoring call_accepted outside RingingRemote");
            return;
        }
        if let Err(e) = self.apply_remote_answer(payload).await {
            self.fail(e.to_string(), true).await;
        }
    }

    async fn apply_remote_answer(&mut self, payload: CallAcceptedPayload) -> Result<(), CallError> {
        let engine = self.engine.clone().ok_or(CallError::NoSession)?;
        engine.set_remote_description(payload.answer.clone()).await?;

        let drained = {
            let session = self.session.as_mut().ok_or(CallError::NoSession)?;
            session.peer = Some(payload.from);
            session.set_remote_description(payload.answer)?
        };
        self.apply_candidates(&engine, drained).await;

        let session = self.session.as_mut().ok_or(CallError::NoSession)?;
        session.apply_transition(CallTransition::RemoteAccepted)?;
        self.publish();
        Ok(())
    }

    async fn on_remote_candidate(&mut self, payload: IceCandidatePayload) {
        let has_remote = match self.session.as_ref() {
            None => {
                debug!("dropping candidate: no session");
                return;
            }
            Some(s) if s.state.is_ending() || s.state.is_terminal() => {
                debug!("dropping candidate: session is tearing down");
                return;
            }
            Some(s) => s.remote_description.is_some(),
        };

        if has_remote {
            if let Some(engine) = self.engine.clone() {
                // A closed engine rejecting a late candidate is not fatal.
                if let Err(e) = engine.add_remote_candidate(payload.candidate).await {
                    warn!("remote candidate rejected: {e}");
                }
            }
        } else if let Some(session) = self.session.as_mut() {
            // Cannot be applied before the remote description; buffer in
            // receipt order regardless of role.
            session.push_pending_candidate(payload.candidate);
        }
    }

    async fn apply_candidates(
        &self,
        engine: &Arc<dyn NegotiationEngine>,
        candidates: Vec<super::negotiation::IceCandidate>,
    ) {
        for candidate in candidates {
            if let Err(e) = engine.add_remote_candidate(candidate).await {
                warn!("buffered candidate rejected: {e}");
            }
        }
    }

    async fn on_engine_event(&mut self, epoch: u64, event: EngineEvent) {
        if !self.session.as_ref().is_some_and(|s| s.epoch == epoch) {
            debug!("dropping engine event for stale session");
            return;
        }
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                // Trickle immediately, never batch.
                self.emit_best_effort(OutboundSignal::IceCandidate(IceCandidatePayload {
                    room: Some(self.room.clone()),
                    candidate,
                    from: None,
                }))
                .await;
            }
            EngineEvent::ConnectionStateChanged(state) => {
                let _ = self.bus.connection_state.send(Arc::new(state));
                if state.is_terminal() {
                    self.terminate(EndReason::ConnectionLost, ReleaseSignal::EndCall)
                        .await;
                }
            }
            EngineEvent::RemoteTrack(track) => self.on_remote_track(epoch, track).await,
        }
    }

    async fn on_remote_track(&mut self, epoch: u64, track: RemoteTrack) {
        let state = self.session.as_ref().map(|s| s.state.clone());
        match state {
            Some(CallState::Connecting { .. }) => {
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.apply_transition(CallTransition::MediaFlowing) {
                        warn!("media flowing rejected: {e}");
                        return;
                    }
                }
                self.publish();
                self.start_timer(epoch);
                let _ = self.bus.remote_track.send(Arc::new(track));
            }
            Some(CallState::Active { .. }) => {
                let _ = self.bus.remote_track.send(Arc::new(track));
            }
            other => debug!("remote track ignored in state {:?}", other),
        }
    }

    fn on_tick(&self, epoch: u64) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.epoch != epoch {
            return;
        }
        if let CallState::Active { connected_at } = session.state {
            let seconds = Utc::now().signed_duration_since(connected_at).num_seconds();
            let _ = self.bus.call_timer.send(Arc::new(CallTimer { seconds }));
        }
    }

    fn on_set_muted(&mut self, muted: bool) {
        let Some(session) = self.session.as_mut() else {
            debug!("mute toggle ignored: no session");
            return;
        };
        session.media_flags.muted = muted;
        let flags = session.media_flags;
        if let Some(handle) = &self.media_handle {
            handle.set_muted(muted);
        }
        let _ = self.bus.media_flags.send(Arc::new(flags));
    }

    fn on_set_video_suppressed(&mut self, suppressed: bool) {
        let Some(session) = self.session.as_mut() else {
            debug!("video toggle ignored: no session");
            return;
        };
        session.media_flags.video_suppressed = suppressed;
        let flags = session.media_flags;
        if let Some(handle) = &self.media_handle {
            handle.set_video_suppressed(suppressed);
        }
        let _ = self.bus.media_flags.send(Arc::new(flags));
    }

    async fn create_engine(&mut self, epoch: u64) -> Result<Arc<dyn NegotiationEngine>, CallError> {
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
        let engine = self
            .engines
            .create(&self.config.stun_servers, engine_tx)
            .await?;

        // Engine callbacks re-enter the serialized queue instead of
        // touching session state from foreign call stacks.
        let tx = self.tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                if tx.send(SessionEvent::Engine { epoch, event }).is_err() {
                    break;
                }
            }
        });

        self.engine = Some(engine.clone());
        self.engine_pump = Some(pump);
        Ok(engine)
    }

    /// Run the termination sequence once. The state is advanced to
    /// `Ending` in the same step that read it, so a racing second
    /// termination (local hang-up vs. inbound `call_ended`) sees `Ending`
    /// and backs off.
    async fn terminate(&mut self, reason: EndReason, signal: ReleaseSignal) {
        let peer_notified = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            if session.state.is_ending() || session.state.is_terminal() {
                debug!("termination already in progress");
                return;
            }
            let peer_notified = session.peer_notified;
            if let Err(e) = session.apply_transition(CallTransition::BeginTermination { reason }) {
                warn!("termination rejected: {e}");
                return;
            }
            peer_notified
        };
        self.publish();

        // The peer only hears about sessions it knows exist. Emission is
        // idempotent from the far side's view; it may already be gone.
        if peer_notified {
            let room = RoomPayload {
                room: self.room.clone(),
            };
            match signal {
                ReleaseSignal::EndCall => {
                    self.emit_best_effort(OutboundSignal::EndCall(room)).await
                }
                ReleaseSignal::Reject => {
                    self.emit_best_effort(OutboundSignal::RejectCall(room)).await
                }
            }
        }

        self.release_resources().await;

        let mut notice = None;
        if let Some(session) = self.session.as_mut() {
            session.remote_description = None;
            session.pending_remote_candidates.clear();
            session.stored_offer = None;
            if let Err(e) = session.apply_transition(CallTransition::Finished) {
                warn!("finish rejected: {e}");
            }
            if let CallState::Ended {
                reason,
                duration_secs,
                ..
            } = &session.state
            {
                notice = Some(CallEndedNotice {
                    reason: reason.clone(),
                    duration_secs: *duration_secs,
                });
            }
        }
        self.publish();
        if let Some(notice) = notice {
            let _ = self.bus.call_ended.send(Arc::new(notice));
        }

        // Terminal bookkeeping only: the slot frees immediately.
        self.session = None;
        self.publish();
    }

    /// Unrecoverable local error: same release sequence as termination,
    /// plus `last_error` and, when the peer already knows about the
    /// session, an outbound error so it does not dangle.
    async fn fail(&mut self, message: String, notify: bool) {
        warn!("call failed: {message}");
        {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            if session.state.is_ending() || session.state.is_terminal() {
                return;
            }
            session.last_error = Some(message.clone());
            if let Err(e) = session.apply_transition(CallTransition::MarkFailed) {
                warn!("fail transition rejected: {e}");
            }
        }
        self.publish();

        if notify {
            self.emit_best_effort(OutboundSignal::CallError(ErrorPayload {
                message: message.clone(),
            }))
            .await;
            self.emit_best_effort(OutboundSignal::EndCall(RoomPayload {
                room: self.room.clone(),
            }))
            .await;
        }

        self.release_resources().await;
        self.notify_error(message);
        self.session = None;
        self.publish();
    }

    /// Release order: stop timers, close the engine, release capture.
    /// Each step stands alone; one failing cannot leak the others.
    async fn release_resources(&mut self) {
        self.stop_timer();
        if let Some(pump) = self.engine_pump.take() {
            pump.abort();
        }
        if let Some(engine) = self.engine.take() {
            engine.close().await;
        }
        if let Some(handle) = self.media_handle.take() {
            handle.release();
        }
    }

    fn start_timer(&mut self, epoch: u64) {
        self.stop_timer();
        let tx = self.tx.clone();
        self.timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(SessionEvent::Tick { epoch }).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn notify_error(&self, message: String) {
        let _ = self
            .bus
            .call_error
            .send(Arc::new(CallErrorNotice { message }));
        let bus = self.bus.clone();
        let display = self.config.error_display;
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            let _ = bus.call_error_cleared.send(Arc::new(CallErrorCleared));
        });
    }

    async fn emit(&self, signal: OutboundSignal) -> Result<(), CallError> {
        let envelope = Envelope::signal(&signal)?;
        self.channel.emit(envelope).await?;
        Ok(())
    }

    async fn emit_best_effort(&self, signal: OutboundSignal) {
        let name = signal.name();
        if let Err(e) = self.emit(signal).await {
            warn!("failed to emit {name}: {e}");
        }
    }

    fn publish(&self) {
        let state = self
            .session
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default();
        let kind = self.session.as_ref().map(|s| s.kind);
        let status = state.status_text().to_string();
        let _ = self.state_tx.send(state.clone());
        let _ = self.bus.call_state.send(Arc::new(CallStateChanged {
            state,
            kind,
            status,
        }));
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}
