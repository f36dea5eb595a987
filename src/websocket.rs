//! # Playback WebSocket
//!
//! The remote voice pipeline connects to `/ws/playback` and streams JSON
//! events; every connection is one playback session with its own engine
//! and rendering device.
//!
//! ## Session Flow:
//! 1. **Upgrade**: a session slot is claimed (503 when the limit is reached)
//!    and a device is opened
//! 2. **Started**: the server sends `session-started`
//! 3. **Streaming**: fragments, end-of-turn markers, interrupts and checks
//!    are fed to the engine
//! 4. **Effects**: after every engine call the actor applies what the engine
//!    asked for: drain-check timers, device resumes, outbound events
//! 5. **Stopped**: the device is closed and the slot released
//!
//! ## Key Rust Concepts:
//! - **Actor context as event loop**: all engine calls happen inside actor
//!   handlers, one at a time, so the engine needs no locks
//! - **`into_actor`**: the device resume future is spawned on the actor's
//!   context and its result comes back with mutable access to the actor
//! - **Multiple `StreamHandler`s**: WebSocket frames and device events are
//!   two streams feeding the same actor

use crate::config::{AppConfig, DeviceKind};
use crate::error::{AppError, DeviceError};
use crate::playback::device::{DeviceEvent, RenderDevice, VirtualDevice};
use crate::playback::engine::{EngineEffect, EngineStats, PlaybackEngine};
use crate::playback::protocol::{InboundEvent, OutboundEvent};
use crate::playback::scheduler::Fragment;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

pub struct PlaybackWebSocket {
    session_id: String,
    engine: PlaybackEngine<Box<dyn RenderDevice>>,
    /// Taken when the actor starts and attached as a stream
    device_events: Option<mpsc::UnboundedReceiver<DeviceEvent>>,
    app_state: web::Data<AppState>,
    config: AppConfig,
    /// Engine counters already folded into `AppState`
    reported: EngineStats,
    last_heartbeat: Instant,
}

impl PlaybackWebSocket {
    pub fn new(
        app_state: web::Data<AppState>,
        config: AppConfig,
        device: Box<dyn RenderDevice>,
        device_events: mpsc::UnboundedReceiver<DeviceEvent>,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            engine: PlaybackEngine::new(device, &config.playback),
            device_events: Some(device_events),
            app_state,
            config,
            reported: EngineStats::default(),
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_event(&mut self, event: InboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            InboundEvent::AudioFragment {
                context_id,
                audio,
                sequence_index,
                is_final,
            } => {
                self.engine
                    .on_fragment(fragment_from_wire(context_id, audio, sequence_index, is_final));
            }
            InboundEvent::StreamComplete { context_id } => {
                self.engine
                    .on_stream_complete(context_id.as_deref().unwrap_or_default());
            }
            InboundEvent::Interrupt => self.engine.interrupt(),
            InboundEvent::ReengagementCheck => {
                self.engine.reengagement_check();
            }
            InboundEvent::Greeting { audio } => self.engine.play_greeting(&audio),
            InboundEvent::ResponseDone { context_id } => {
                info!(session_id = %self.session_id, context_id = ?context_id, "Upstream response done");
            }
            InboundEvent::Error { message } => {
                warn!(session_id = %self.session_id, message = ?message, "Upstream reported an error");
            }
            InboundEvent::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                let timestamp = timestamp.unwrap_or_else(now_millis);
                self.send_event(ctx, &OutboundEvent::Pong { timestamp });
            }
            InboundEvent::Pong { .. } => {
                self.last_heartbeat = Instant::now();
            }
        }
        self.apply_effects(ctx);
    }

    /// Carry out everything the engine queued up.
    fn apply_effects(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        for effect in self.engine.take_effects() {
            match effect {
                EngineEffect::ResumeDevice => {
                    let resume = self.engine.begin_resume();
                    ctx.spawn(resume.into_actor(self).map(|result, act, ctx| {
                        act.engine.on_device_resumed(result);
                        act.apply_effects(ctx);
                    }));
                }
                EngineEffect::ScheduleDrainCheck { context_id, delay } => {
                    ctx.run_later(delay, move |act, ctx| {
                        act.engine.check_drain(&context_id);
                        act.apply_effects(ctx);
                    });
                }
                EngineEffect::Send(event) => self.send_event(ctx, &event),
                EngineEffect::Report(err) => {
                    self.send_event(
                        ctx,
                        &OutboundEvent::Error {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        },
                    );
                }
            }
        }
        self.sync_metrics();
    }

    fn sync_metrics(&mut self) {
        let current = self.engine.stats();
        self.app_state.record_playback(&current.since(&self.reported));
        self.reported = current;
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &OutboundEvent) {
        match event.to_json(&self.config.playback.drained_event_name) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(session_id = %self.session_id, error = %err, "Failed to serialize event"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: String) {
        warn!(session_id = %self.session_id, code, message = %message, "Rejecting client frame");
        self.send_event(
            ctx,
            &OutboundEvent::Error {
                code: code.to_string(),
                message,
            },
        );
    }
}

/// Build an engine fragment from wire fields. Missing ids and audio become
/// empty strings, which the engine rejects with a warning.
fn fragment_from_wire(
    context_id: Option<String>,
    audio: Option<String>,
    sequence_index: Option<u64>,
    is_final: bool,
) -> Fragment {
    Fragment {
        context_id: context_id.unwrap_or_default(),
        sequence_index,
        audio: audio.unwrap_or_default(),
        is_final,
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Actor for PlaybackWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            session_id = %self.session_id,
            device_state = ?self.engine.device().state(),
            "Playback session started"
        );

        if let Some(events) = self.device_events.take() {
            ctx.add_stream(UnboundedReceiverStream::new(events));
        }

        let interval = Duration::from_secs(self.config.performance.heartbeat_interval_secs);
        let timeout = Duration::from_secs(self.config.performance.heartbeat_timeout_secs);
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(session_id = %act.session_id, "Heartbeat timeout, closing session");
                ctx.stop();
            } else {
                act.send_event(ctx, &OutboundEvent::Ping { timestamp: now_millis() });
            }
        });

        self.send_event(
            ctx,
            &OutboundEvent::SessionStarted {
                session_id: self.session_id.clone(),
                sample_rate: self.config.playback.sample_rate,
            },
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.engine.close();
        self.sync_metrics();
        self.app_state.release_session();

        let snapshot = self.engine.snapshot();
        info!(
            session_id = %self.session_id,
            fragments = snapshot.stats.fragments_received,
            drained = snapshot.stats.contexts_drained,
            interrupts = snapshot.stats.interrupts,
            "Playback session stopped"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PlaybackWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match InboundEvent::parse(&text) {
                Ok(event) => self.handle_event(event, ctx),
                Err(err) => self.send_error(ctx, "invalid_message", format!("Invalid message: {}", err)),
            },
            Ok(ws::Message::Binary(data)) => {
                self.send_error(
                    ctx,
                    "unsupported_frame",
                    format!("Binary frames are not supported ({} bytes)", data.len()),
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, reason = ?reason, "Client closed session");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<DeviceEvent> for PlaybackWebSocket {
    fn handle(&mut self, event: DeviceEvent, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, event = ?event, "Device event");
        self.engine.on_device_event(event);
        self.apply_effects(ctx);
    }

    /// The device dropped its sender (closed); the session itself goes on.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Device event stream ended");
    }
}

/// Open the rendering device configured for new sessions.
pub fn open_device(
    config: &AppConfig,
    events: mpsc::UnboundedSender<DeviceEvent>,
) -> Result<Box<dyn RenderDevice>, DeviceError> {
    match config.device.kind {
        DeviceKind::Virtual => {
            let device = if config.device.start_suspended {
                VirtualDevice::new_suspended(events)
            } else {
                VirtualDevice::new(events)
            };
            Ok(Box::new(device))
        }
        #[cfg(feature = "speaker")]
        DeviceKind::Speaker => Ok(Box::new(crate::playback::speaker::SpeakerDevice::open(
            config.playback.sample_rate,
            config.device.start_suspended,
            events,
        )?)),
        #[cfg(not(feature = "speaker"))]
        DeviceKind::Speaker => Err(DeviceError::Backend(
            "speaker output needs the `speaker` feature".to_string(),
        )),
    }
}

/// WebSocket endpoint handler.
///
/// The session slot is claimed before the upgrade and handed back on every
/// failure path; once the actor runs, `stopped` releases it.
pub async fn playback_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let config = app_state.get_config();
    if !app_state.try_acquire_session(config.performance.max_concurrent_sessions) {
        warn!(
            limit = config.performance.max_concurrent_sessions,
            "Session limit reached, refusing playback session"
        );
        return Err(AppError::ServiceUnavailable(
            "Maximum number of playback sessions reached".to_string(),
        ));
    }

    info!(peer = ?req.connection_info().peer_addr(), "New playback connection");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let device = match open_device(&config, events_tx) {
        Ok(device) => device,
        Err(err) => {
            app_state.release_session();
            error!(error = %err, "Could not open rendering device");
            return Err(AppError::ServiceUnavailable(err.to_string()));
        }
    };

    let actor = PlaybackWebSocket::new(app_state.clone(), config, device, events_rx);
    ws::start(actor, &req, stream).map_err(|err| {
        app_state.release_session();
        AppError::BadRequest(format!("WebSocket handshake failed: {}", err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test as http_test, App};

    #[test]
    fn test_fragment_from_wire_fills_missing_fields() {
        let fragment = fragment_from_wire(None, Some("AAA=".to_string()), None, true);
        assert_eq!(fragment.context_id, "");
        assert_eq!(fragment.audio, "AAA=");
        assert!(fragment.is_final);
    }

    #[actix_web::test]
    async fn test_session_limit_returns_503() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = AppState::new(config);
        assert!(state.try_acquire_session(1));

        let app = http_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/playback", web::get().to(playback_websocket)),
        )
        .await;

        let req = http_test::TestRequest::get().uri("/ws/playback").to_request();
        let resp = http_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().sessions_rejected, 1);
    }

    #[actix_web::test]
    async fn test_failed_handshake_releases_slot() {
        let state = AppState::new(AppConfig::default());
        let app = http_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/playback", web::get().to(playback_websocket)),
        )
        .await;

        // plain GET without upgrade headers
        let req = http_test::TestRequest::get().uri("/ws/playback").to_request();
        let resp = http_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    mod session {
        use super::*;
        use crate::playback::decoder::encode_pcm16;
        use actix_web::{dev::ServerHandle, HttpServer};
        use futures_util::{SinkExt, StreamExt};
        use serde_json::{json, Value};
        use std::net::SocketAddr;
        use std::time::Duration;
        use tokio::net::TcpStream;
        use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

        type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

        fn session_config() -> AppConfig {
            let mut config = AppConfig::default();
            config.playback.quiescence_delay_ms = 50;
            config.playback.drain_poll_interval_ms = 20;
            config
        }

        fn serve(state: AppState) -> (SocketAddr, ServerHandle) {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .route("/ws/playback", web::get().to(playback_websocket))
            })
            .workers(1)
            .bind(("127.0.0.1", 0))
            .unwrap();
            let addr = server.addrs()[0];
            let server = server.disable_signals().run();
            let handle = server.handle();
            tokio::spawn(server);
            (addr, handle)
        }

        async fn connect(addr: SocketAddr) -> Client {
            let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/playback", addr))
                .await
                .unwrap();
            client
        }

        async fn send(client: &mut Client, event: Value) {
            client.send(Message::Text(event.to_string())).await.unwrap();
        }

        /// Next text frame, or `None` if nothing arrives within `wait`.
        async fn next_event(client: &mut Client, wait: Duration) -> Option<Value> {
            loop {
                match tokio::time::timeout(wait, client.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => return Some(serde_json::from_str(&text).unwrap()),
                    Ok(Some(Ok(_))) => continue,
                    _ => return None,
                }
            }
        }

        /// Two 100 ms fragments for `context_id` followed by an out-of-band end marker.
        async fn play_turn(client: &mut Client, context_id: &str) {
            for index in 0..2 {
                send(
                    client,
                    json!({
                        "type": "audio-fragment",
                        "contextId": context_id,
                        "sequenceIndex": index,
                        "audio": encode_pcm16(&vec![800i16; 2400]),
                    }),
                )
                .await;
            }
            send(client, json!({"type": "stream-complete", "contextId": context_id})).await;
        }

        #[actix_web::test]
        async fn test_turn_drains_once_over_the_wire() {
            let state = AppState::new(session_config());
            let (addr, server) = serve(state.clone());
            let mut client = connect(addr).await;

            let started = next_event(&mut client, Duration::from_secs(2)).await.unwrap();
            assert_eq!(started["type"], "session-started");
            assert_eq!(started["sampleRate"], 24000);

            play_turn(&mut client, "turn-1").await;

            let drained = next_event(&mut client, Duration::from_secs(3)).await.unwrap();
            assert_eq!(drained, json!({"type": "playback-drained", "contextId": "turn-1"}));

            // a repeated end marker is absorbed by the ledger
            send(&mut client, json!({"type": "stream-complete", "contextId": "turn-1"})).await;
            assert!(next_event(&mut client, Duration::from_millis(400)).await.is_none());

            let playback = state.get_metrics_snapshot().playback;
            assert_eq!(playback.fragments_received, 2);
            assert_eq!(playback.units_scheduled, 2);
            assert_eq!(playback.contexts_drained, 1);

            server.stop(false).await;
        }

        #[actix_web::test]
        async fn test_suspended_device_is_resumed_and_drains() {
            let mut config = session_config();
            config.device.start_suspended = true;
            config.playback.drained_event_name = "ai-audio-done".to_string();
            let state = AppState::new(config);
            let (addr, server) = serve(state.clone());
            let mut client = connect(addr).await;

            let started = next_event(&mut client, Duration::from_secs(2)).await.unwrap();
            assert_eq!(started["type"], "session-started");

            play_turn(&mut client, "turn-7").await;

            let drained = next_event(&mut client, Duration::from_secs(3)).await.unwrap();
            assert_eq!(drained, json!({"type": "ai-audio-done", "contextId": "turn-7"}));
            assert_eq!(state.get_metrics_snapshot().playback.device_errors, 0);

            server.stop(false).await;
        }
    }

    #[cfg(not(feature = "speaker"))]
    #[actix_web::test]
    async fn test_speaker_without_feature_is_refused() {
        let mut config = AppConfig::default();
        config.device.kind = DeviceKind::Speaker;
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(open_device(&config, tx).is_err());
    }
}
