//! MQTT adapter over the synchronous `rumqttc` client.
//!
//! Each `connect` builds a fresh client so the Last-Will in the request is
//! the one registered with the broker. The session is only considered
//! established once the broker's ConnAck arrives within the timeout.
//! Publishes stay in the session's ledger until the broker confirms them, so
//! a lost connection hands them back instead of dropping them.
use crate::error::IoError;
use rand::Rng;
use rumqttc::{
    Client, ClientError, ConnectReturnCode, Connection, Event, LastWill, MqttOptions, Outgoing, Packet,
    QoS, RecvTimeoutError,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use weigh_config::MqttSection;
use weigh_traits::{BoxError, BrokerConnector, BrokerMessage, BrokerSession, ConnectRequest};

/// Requests buffered inside the rumqttc client before `try_publish` fails.
const REQUEST_CAPACITY: usize = 64;
/// Upper bound on the outgoing flush during a clean disconnect.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);
/// How long `publish` waits for room in a full request queue.
const PUBLISH_BACKPRESSURE: Duration = Duration::from_secs(1);

pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn qos_level(q: QoS) -> u8 {
    match q {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// `weigh-agent-<machine>-<host>-<rand>`, unique per connect.
pub fn client_id(machine_id: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "host".to_string());
    let suffix: u16 = rand::thread_rng().r#gen();
    format!("weigh-agent-{machine_id}-{host}-{suffix:04x}")
}

#[derive(Debug, Clone)]
pub struct MqttConnector {
    machine_id: String,
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
}

impl MqttConnector {
    pub fn from_section(m: &MqttSection, machine_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            host: m.host.clone(),
            port: m.port,
            credentials: (!m.username.is_empty()).then(|| (m.username.clone(), m.password.clone())),
            keep_alive: Duration::from_secs(m.keepalive_s.max(5)),
        }
    }

    fn options(&self, req: &ConnectRequest) -> MqttOptions {
        let mut opts = MqttOptions::new(client_id(&self.machine_id), self.host.clone(), self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some((user, pass)) = &self.credentials {
            opts.set_credentials(user.clone(), pass.clone());
        }
        let will = &req.last_will;
        opts.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            qos(will.qos),
            will.retain,
        ));
        opts
    }
}

impl BrokerConnector for MqttConnector {
    fn connect(&mut self, req: &ConnectRequest) -> Result<Box<dyn BrokerSession>, BoxError> {
        let (client, mut connection) = Client::new(self.options(req), REQUEST_CAPACITY);
        let deadline = Instant::now() + req.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Box::new(IoError::Timeout));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(Box::new(IoError::Mqtt(format!("connection refused: {:?}", ack.code))));
                    }
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(Box::new(IoError::Mqtt(e.to_string()))),
                Err(RecvTimeoutError::Timeout) => return Err(Box::new(IoError::Timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Box::new(IoError::Mqtt("event loop closed".into())));
                }
            }
        }
        client
            .try_subscribe(req.subscribe.clone(), QoS::AtLeastOnce)
            .map_err(client_err)?;
        tracing::debug!(host = %self.host, port = self.port, "mqtt session established");
        Ok(Box::new(MqttSession {
            client,
            connection,
            inbound: VecDeque::new(),
            ledger: Ledger::default(),
        }))
    }
}

fn client_err(e: ClientError) -> BoxError {
    Box::new(IoError::Mqtt(e.to_string()))
}

/// Messages handed to the client that the broker has not confirmed.
///
/// rumqttc writes requests in the order they were queued, so every
/// `Outgoing::Publish` event belongs to the oldest queued entry. QoS 0 is
/// settled once written; QoS 1 and 2 wait for PubAck or PubComp.
#[derive(Debug, Default)]
struct Ledger {
    queued: VecDeque<BrokerMessage>,
    inflight: Vec<(u16, BrokerMessage)>,
}

impl Ledger {
    fn accepted(&mut self, msg: BrokerMessage) {
        self.queued.push_back(msg);
    }

    fn written(&mut self, pkid: u16) {
        let Some(msg) = self.queued.pop_front() else {
            return;
        };
        if msg.qos > 0 {
            self.inflight.push((pkid, msg));
        }
    }

    fn confirmed(&mut self, pkid: u16) {
        self.inflight.retain(|(id, _)| *id != pkid);
    }

    fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.inflight.is_empty()
    }

    /// Written messages first, then those still queued.
    fn take(&mut self) -> Vec<BrokerMessage> {
        let mut out: Vec<_> = self.inflight.drain(..).map(|(_, m)| m).collect();
        out.extend(self.queued.drain(..));
        out
    }
}

struct MqttSession {
    client: Client,
    connection: Connection,
    /// Publishes received while pumping the event loop for an outbound send.
    inbound: VecDeque<BrokerMessage>,
    ledger: Ledger,
}

impl MqttSession {
    /// Drive the event loop once. `Ok(None)` on timeout or non-publish events.
    fn pump(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BoxError> {
        match self.connection.recv_timeout(timeout) {
            Ok(Ok(Event::Incoming(Packet::Publish(p)))) => Ok(Some(BrokerMessage::new(
                p.topic,
                p.payload.to_vec(),
                qos_level(p.qos),
                p.retain,
            ))),
            Ok(Ok(Event::Incoming(Packet::PubAck(ack)))) => {
                self.ledger.confirmed(ack.pkid);
                Ok(None)
            }
            Ok(Ok(Event::Incoming(Packet::PubComp(comp)))) => {
                self.ledger.confirmed(comp.pkid);
                Ok(None)
            }
            Ok(Ok(Event::Outgoing(Outgoing::Publish(pkid)))) => {
                self.ledger.written(pkid);
                Ok(None)
            }
            Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                Err(Box::new(IoError::Mqtt("broker closed the connection".into())))
            }
            Ok(Ok(_)) | Err(RecvTimeoutError::Timeout) => Ok(None),
            Ok(Err(e)) => Err(Box::new(IoError::Mqtt(e.to_string()))),
            Err(RecvTimeoutError::Disconnected) => Err(Box::new(IoError::Mqtt("event loop closed".into()))),
        }
    }

    fn pump_stash(&mut self, timeout: Duration) -> Result<(), BoxError> {
        if let Some(m) = self.pump(timeout)? {
            self.inbound.push_back(m);
        }
        Ok(())
    }
}

impl BrokerSession for MqttSession {
    fn publish(&mut self, msg: &BrokerMessage) -> Result<(), BoxError> {
        let deadline = Instant::now() + PUBLISH_BACKPRESSURE;
        loop {
            match self
                .client
                .try_publish(msg.topic.clone(), qos(msg.qos), msg.retain, msg.payload.clone())
            {
                Ok(()) => {
                    self.ledger.accepted(msg.clone());
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => return Err(client_err(e)),
                // Request queue full: let the event loop write some of it out.
                Err(_) => self.pump_stash(Duration::from_millis(20))?,
            }
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BoxError> {
        if let Some(m) = self.inbound.pop_front() {
            return Ok(Some(m));
        }
        self.pump(timeout)
    }

    fn disconnect(&mut self) {
        let deadline = Instant::now() + DISCONNECT_FLUSH;
        while !self.ledger.is_empty() && Instant::now() < deadline {
            if self.pump_stash(Duration::from_millis(20)).is_err() {
                return;
            }
        }
        if self.client.try_disconnect().is_err() {
            return;
        }
        while Instant::now() < deadline {
            match self.connection.recv_timeout(Duration::from_millis(50)) {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) | Ok(Err(_)) => break,
                Err(RecvTimeoutError::Disconnected) => break,
                _ => {}
            }
        }
    }

    fn take_unconfirmed(&mut self) -> Vec<BrokerMessage> {
        self.ledger.take()
    }
}
