//! wallcast - video-wall distribution hub
//!
//! One broadcaster streams a single captured source; a fleet of viewers
//! each renders a distinct sub-rectangle of it over per-viewer WebRTC
//! sessions. This crate provides the signaling hub (registry, signal
//! router, event hub, WebSocket transport) and the broadcaster-side media
//! engine (viewer sessions, region croppers).

pub mod broadcast;
pub mod config;
pub mod cropper;
pub mod error;
pub mod geometry;
pub mod hub;
pub mod messages;
pub mod registry;
pub mod router;
pub mod state;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
