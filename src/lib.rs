//! # voice-playback
//!
//! Streaming audio playback service for a voice assistant. The remote voice
//! pipeline streams synthesized speech over a WebSocket; each connection
//! gets its own playback engine that renders the audio gaplessly, honors
//! barge-in and reports back once each turn has finished playing.
//!
//! ## Modules:
//! - **playback**: the engine and its components
//! - **websocket**: the per-connection actor hosting an engine
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared state and counters
//! - **health**, **handlers**: HTTP endpoints
//! - **middleware**: request metrics
//! - **error**: error types for HTTP and playback

pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod playback;
pub mod state;
pub mod websocket;
