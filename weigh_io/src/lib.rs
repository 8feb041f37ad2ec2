//! Concrete adapters for the `weigh_traits` seams: serial scale, MQTT broker,
//! HTTP backend and the system print spooler.
#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod http;
pub mod mqtt;
pub mod printer;
pub mod serial;

pub use error::IoError;
pub use http::{HttpEventTransport, HttpFetcher};
pub use mqtt::MqttConnector;
pub use printer::CommandPrinter;
pub use serial::{AUTO_PORT, SerialOpener, pick_port};
