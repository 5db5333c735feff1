//! End-to-end pest detection pipeline: captures frames, finds moving objects,
//! assigns them persistent track identities, and exposes annotated previews
//! over HTTP while reporting detection events to the backend.
//!
//! The module is split into focused submodules:
//! - `config`: environment-driven service settings.
//! - `data`: wire schema and shared state passed between stages.
//! - `detector`: the pluggable region scorer and its motion-based default.
//! - `tracker`: nearest-centroid track identity management.
//! - `annotation`: drawing primitives for overlays.
//! - `encoding`: JPEG encoding for annotated and raw frames.
//! - `pipeline`: the capture → detect → track → publish producer loop.
//! - `publisher`: fire-and-forget event delivery to the backend.
//! - `dataset` / `snapshot`: side-effect sinks persisting crops and frames.
//! - `server`: Actix Web preview endpoints.
//! - `telemetry`: tracing and metrics bootstrap.

mod annotation;
mod encoding;

pub(crate) mod config;
pub(crate) mod data;
pub(crate) mod dataset;
pub(crate) mod detector;
pub(crate) mod pipeline;
pub(crate) mod publisher;
pub(crate) mod server;
pub(crate) mod snapshot;
pub(crate) mod telemetry;
pub(crate) mod tracker;
