//! A hardware ray traced infinity mirror.
//!
//! A handful of mirror and edge shaded mesh parts are traced every frame into one of two output
//! images, which are then copied onto the swapchain. The interesting part is the frame pipeline:
//!
//! - [`accel`] builds one bottom-level acceleration structure per mesh part and rebuilds the
//!   top-level structure over them every frame
//! - [`pipeline`] compiles the ray tracing pipeline and lays out its shader tables
//! - [`barrier`] tracks image states and records the transitions between them
//! - [`scheduler`] runs the dispatch and present loops on two queues, handing frame slots back
//!   and forth through timeline semaphores
//!
//! [`renderer::Renderer::setup`] creates everything in order and starts the loops.

pub mod accel;
pub mod barrier;
pub mod config;
pub mod context;
pub mod driver;
pub mod pipeline;
pub mod renderer;
pub mod scene;
pub mod scheduler;
