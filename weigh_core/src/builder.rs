//! Assembles an [`Agent`] from its runtime config and trait-object seams.
//!
//! `build()` checks that every required seam is present and that the
//! config is internally consistent before any thread is spawned.
use std::sync::Arc;

use weigh_traits::{BrokerConnector, Clock, DocumentFetcher, EventTransport, MonotonicClock, Printer, TransportOpener, BoxError};

use crate::agent::Agent;
use crate::config::AgentCfg;
use crate::error::{BuildError, Result};

enum SourceChoice {
    Transport(Box<dyn TransportOpener>),
    Simulated,
}

/// Stand-in transport for a disabled backend; the pusher never calls it.
struct NoBackend;

impl EventTransport for NoBackend {
    fn post(&mut self, _body: &[u8]) -> std::result::Result<(), BoxError> {
        Err("backend disabled".into())
    }
}

pub struct AgentBuilder {
    cfg: AgentCfg,
    source: Option<SourceChoice>,
    broker: Option<Box<dyn BrokerConnector>>,
    events: Option<Box<dyn EventTransport>>,
    printer: Option<Arc<dyn Printer>>,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AgentBuilder {
    pub fn new(cfg: AgentCfg) -> Self {
        Self {
            cfg,
            source: None,
            broker: None,
            events: None,
            printer: None,
            fetcher: None,
            clock: None,
        }
    }

    /// Read samples from a byte transport.
    pub fn transport(mut self, opener: impl TransportOpener + 'static) -> Self {
        self.source = Some(SourceChoice::Transport(Box::new(opener)));
        self
    }

    pub fn boxed_transport(mut self, opener: Box<dyn TransportOpener>) -> Self {
        self.source = Some(SourceChoice::Transport(opener));
        self
    }

    /// Generate samples with the configured simulator instead.
    pub fn simulated(mut self) -> Self {
        self.source = Some(SourceChoice::Simulated);
        self
    }

    pub fn broker(mut self, connector: impl BrokerConnector + 'static) -> Self {
        self.broker = Some(Box::new(connector));
        self
    }

    pub fn boxed_broker(mut self, connector: Box<dyn BrokerConnector>) -> Self {
        self.broker = Some(connector);
        self
    }

    pub fn events(mut self, transport: impl EventTransport + 'static) -> Self {
        self.events = Some(Box::new(transport));
        self
    }

    pub fn boxed_events(mut self, transport: Box<dyn EventTransport>) -> Self {
        self.events = Some(transport);
        self
    }

    pub fn printer(mut self, printer: Arc<dyn Printer>) -> Self {
        self.printer = Some(printer);
        self
    }

    /// Needed only for `pdfUrl` print commands.
    pub fn fetcher(mut self, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Clock for the backend reading throttle.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let cfg = self.cfg;
        if cfg.machine_id.trim().is_empty() {
            return Err(BuildError::InvalidConfig("machine_id must not be empty".into()).into());
        }
        if cfg.filter.ma_window == 0 || cfg.filter.stability_window == 0 {
            return Err(BuildError::InvalidConfig("filter windows must be >= 1".into()).into());
        }
        if cfg.pusher.queue_capacity == 0 {
            return Err(BuildError::InvalidConfig("backend queue capacity must be >= 1".into()).into());
        }
        let source = self.source.ok_or(BuildError::MissingSource)?;
        let broker = self.broker.ok_or(BuildError::MissingBroker)?;
        let events: Box<dyn EventTransport> = match (self.events, cfg.pusher.enabled) {
            (Some(t), _) => t,
            (None, false) => Box::new(NoBackend),
            (None, true) => return Err(BuildError::MissingEvents.into()),
        };
        let printer = self.printer.ok_or(BuildError::MissingPrinter)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock));
        let opener = match source {
            SourceChoice::Transport(o) => Some(o),
            SourceChoice::Simulated => None,
        };
        Ok(Agent::assemble(cfg, opener, broker, events, printer, self.fetcher, clock))
    }
}
