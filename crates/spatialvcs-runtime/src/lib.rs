//! `spatialvcs-runtime` – wiring perception, memory and the description
//! service into one pipeline.
//!
//! # Modules
//!
//! - [`pipeline`] – [`SpatialPipeline`][pipeline::SpatialPipeline]: ingest a
//!   frame (process → crop → describe → remember) and answer queries.
//! - [`collab`] – the [`Describer`][collab::Describer] seam, the JSON shapes
//!   requested from the description service, and the fenced-JSON reader for
//!   its replies.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP span export.

pub mod collab;
pub mod pipeline;
pub mod telemetry;

pub use collab::{CollabError, Describer, ParsedJson, SceneDescription, SceneObject, SpatialDiff};
pub use pipeline::{IngestReport, SpatialPipeline};
pub use telemetry::{TracerProviderGuard, init_tracing};
