#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Measurement pipeline of the weigh agent.
//!
//! A [`SampleSource`] feeds a [`FilterPipeline`], whose readings fan out to
//! the broker [`Publisher`] and the backend [`EventPusher`]. The [`Agent`]
//! owns all of them; build one with [`AgentBuilder`]. Every device and
//! network boundary is a `weigh_traits` seam, with in-memory stand-ins in
//! [`mocks`].

pub mod agent;
pub mod buffer;
pub mod builder;
pub mod config;
pub mod conversions;
pub mod delay_queue;
pub mod error;
pub mod filter;
pub mod framing;
pub mod health;
pub mod io_error;
pub mod mocks;
pub mod print_bridge;
pub mod publisher;
pub mod pusher;
pub mod simulate;
pub mod source;
pub mod types;
pub mod util;
pub mod worker;

pub use agent::{Agent, StatusReport};
pub use builder::AgentBuilder;
pub use config::AgentCfg;
pub use error::{AgentError, BuildError, Result};
pub use filter::{FilterPipeline, ReadingSink};
pub use health::{HealthSnapshot, HealthStatus};
pub use publisher::{ControlMessage, PrintCommand, Publisher, Topics};
pub use pusher::EventPusher;
pub use source::{SampleSource, SourceMode};
pub use types::{AgentStatus, ConnectionState, FilteredReading, OutboundEvent, RawSample};
