//! Inbound message dispatch.
//!
//! Each decoded payload goes through PARSE → VALIDATE-TYPE → UPDATE-LIVENESS
//! → ROUTE, and the result tells the caller what (if anything) to send back:
//!
//! - malformed JSON, a missing/non-string `type`, an unknown type or a
//!   send-only type are dropped without a reply;
//! - `PING` is echoed, `INFO` answers with [`DeviceInfo`];
//! - `SET`/`GET` go to the [`DomainService`]; a service that is not ready or
//!   fails yields an `ERROR` reply with a fixed message.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::error::ProtocolFault;
use crate::protocol::{Command, Inbound, Outbound};
use crate::registry::ConnectionRegistry;
use crate::service::DomainService;

/// `ERROR` message when the service has not finished starting.
pub const NOT_READY_MESSAGE: &str = "Service is not ready";

/// `ERROR` message when routing fails.
pub const FAILURE_MESSAGE: &str = "Failed to handle the packet";

/// Static device description served by `INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Two-letter region code.
    pub region: String,
    pub version: String,
    /// Hardware serial, hex.
    pub serial: String,
    pub service_type: u8,
    pub network: String,
    /// Whether the last boot was caused by the watchdog.
    pub watchdog: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            region: "PL".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            serial: "0000000000000000".to_string(),
            service_type: 0,
            network: String::new(),
            watchdog: false,
        }
    }
}

#[derive(Serialize)]
struct InfoPayload<'a> {
    uptime: u64,
    #[serde(flatten)]
    info: &'a DeviceInfo,
}

/// What the dispatcher decided for one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Send this document back to the client.
    Reply(Outbound),
    /// Dropped without a reply.
    Dropped(ProtocolFault),
    /// The session was evicted while the payload was in flight.
    Gone,
}

/// Routes parsed messages to built-in handlers or the domain service.
pub struct Dispatcher {
    info: DeviceInfo,
    service: Option<Arc<dyn DomainService>>,
    started: Instant,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("info", &self.info)
            .field("has_service", &self.service.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(info: DeviceInfo, service: Option<Arc<dyn DomainService>>) -> Self {
        Self {
            info,
            service,
            started: Instant::now(),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Run one payload through the full state machine.
    ///
    /// The registry lock is only held to refresh liveness, never while the
    /// domain service runs.
    pub fn dispatch(
        &self,
        registry: &Mutex<ConnectionRegistry>,
        identity: &str,
        session_id: u64,
        payload: &[u8],
        now: Instant,
    ) -> DispatchOutcome {
        let inbound = match Inbound::parse(payload) {
            Ok(inbound) => inbound,
            Err(fault) => {
                tracing::warn!(%identity, "Dropping message: {}", fault);
                return DispatchOutcome::Dropped(fault);
            }
        };

        {
            let mut registry = registry.lock();
            let Some(session) = registry.lookup_session_mut(identity, session_id) else {
                return DispatchOutcome::Gone;
            };
            if inbound.command == Command::Heartbeat {
                session.record_heartbeat(now);
            } else {
                session.touch(now);
            }
        }

        DispatchOutcome::Reply(self.route(identity, &inbound, now))
    }

    /// Produce the reply for a validated message.
    pub fn route(&self, identity: &str, inbound: &Inbound, now: Instant) -> Outbound {
        match inbound.command {
            Command::Heartbeat => Outbound::heartbeat(&inbound.id, identity),
            Command::Identity => match self.info_payload(now) {
                Ok(data) => Outbound::reply(&inbound.id, identity, Command::Identity, data),
                Err(e) => {
                    tracing::warn!(%identity, "Failed to build INFO payload: {}", e);
                    Outbound::error(identity, FAILURE_MESSAGE)
                }
            },
            Command::Configure | Command::Query => self.forward(identity, inbound),
            Command::Error | Command::Unrecognized => {
                // Parse rejects these; keep the routing total anyway.
                Outbound::error(identity, FAILURE_MESSAGE)
            }
        }
    }

    fn forward(&self, identity: &str, inbound: &Inbound) -> Outbound {
        let Some(service) = self.service.as_ref().filter(|s| s.is_ready()) else {
            tracing::debug!(%identity, command = %inbound.command, "Service not ready");
            return Outbound::error(identity, NOT_READY_MESSAGE);
        };

        match service.handle_command(inbound.command, &inbound.body) {
            Ok(data) => Outbound::reply(&inbound.id, identity, inbound.command, data),
            Err(e) => {
                tracing::warn!(%identity, command = %inbound.command, "Service failed: {}", e);
                Outbound::error(identity, FAILURE_MESSAGE)
            }
        }
    }

    fn info_payload(&self, now: Instant) -> serde_json::Result<Value> {
        serde_json::to_value(InfoPayload {
            uptime: now.saturating_duration_since(self.started).as_secs(),
            info: &self.info,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::error::{HomewireError, Result};
    use crate::registry::{RegistryConfig, SessionLink};

    const PEER: &str = "10.0.0.2:5000";

    struct Echo {
        ready: AtomicBool,
    }

    impl DomainService for Echo {
        fn service_type(&self) -> u8 {
            9
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Acquire)
        }

        fn handle_command(&self, command: Command, body: &Value) -> Result<Value> {
            if body.get("fail").is_some() {
                return Err(HomewireError::Service("asked to fail".into()));
            }
            Ok(json!({ "command": command.as_wire(), "body": body }))
        }
    }

    fn setup(ready: bool) -> (Dispatcher, Mutex<ConnectionRegistry>, u64, Instant) {
        let service = Arc::new(Echo {
            ready: AtomicBool::new(ready),
        });
        let dispatcher = Dispatcher::new(
            DeviceInfo {
                serial: "e6614103e7452d2f".into(),
                service_type: 9,
                network: "home".into(),
                ..DeviceInfo::default()
            },
            Some(service),
        );
        let mut registry = ConnectionRegistry::new(RegistryConfig::default());
        let start = Instant::now();
        let session_id = registry
            .admit(PEER, SessionLink::detached(), start)
            .unwrap()
            .session_id();
        (dispatcher, Mutex::new(registry), session_id, start)
    }

    fn reply_json(outcome: DispatchOutcome) -> Value {
        match outcome {
            DispatchOutcome::Reply(out) => serde_json::from_slice(&out.to_json().unwrap()).unwrap(),
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_echo() {
        let (d, reg, sid, start) = setup(true);
        let now = start + Duration::from_secs(3);

        let out = reply_json(d.dispatch(&reg, PEER, sid, br#"{"type":"PING"}"#, now));
        assert_eq!(out, json!({"id": "", "client_id": PEER, "type": "PING"}));

        let reg = reg.lock();
        let session = reg.lookup(PEER).unwrap();
        assert_eq!(session.last_heartbeat(), Some(now));
        assert_eq!(session.last_activity(), now);
    }

    #[test]
    fn test_heartbeat_echoes_id() {
        let (d, reg, sid, start) = setup(true);
        let out = reply_json(d.dispatch(&reg, PEER, sid, br#"{"id":"42","type":"PING"}"#, start));
        assert_eq!(out["id"], "42");
    }

    #[test]
    fn test_info_payload() {
        let (d, reg, sid, start) = setup(true);
        let out = reply_json(d.dispatch(&reg, PEER, sid, br#"{"id":"i","type":"INFO"}"#, start));

        assert_eq!(out["type"], "INFO");
        assert_eq!(out["client_id"], PEER);
        let data = &out["data"];
        assert_eq!(data["region"], "PL");
        assert_eq!(data["serial"], "e6614103e7452d2f");
        assert_eq!(data["service_type"], 9);
        assert_eq!(data["network"], "home");
        assert_eq!(data["watchdog"], false);
        assert_eq!(data["version"], env!("CARGO_PKG_VERSION"));
        assert!(data["uptime"].is_u64());
    }

    #[test]
    fn test_domain_commands_forwarded() {
        let (d, reg, sid, start) = setup(true);
        let out = reply_json(d.dispatch(
            &reg,
            PEER,
            sid,
            br#"{"id":"s","type":"SET","body":{"winter":true}}"#,
            start,
        ));

        assert_eq!(out["type"], "SET");
        assert_eq!(out["id"], "s");
        assert_eq!(out["data"], json!({"command": "SET", "body": {"winter": true}}));
    }

    #[test]
    fn test_service_not_ready() {
        let (d, reg, sid, start) = setup(false);
        let out = reply_json(d.dispatch(&reg, PEER, sid, br#"{"type":"GET"}"#, start));
        assert_eq!(
            out,
            json!({"client_id": PEER, "type": "ERROR", "message": NOT_READY_MESSAGE})
        );
    }

    #[test]
    fn test_service_failure_replies_error() {
        let (d, reg, sid, start) = setup(true);
        let out = reply_json(d.dispatch(&reg, PEER, sid, br#"{"type":"SET","body":{"fail":1}}"#, start));
        assert_eq!(out["type"], "ERROR");
        assert_eq!(out["message"], FAILURE_MESSAGE);
    }

    #[test]
    fn test_no_service_is_not_ready() {
        let d = Dispatcher::new(DeviceInfo::default(), None);
        let inbound = Inbound::parse(br#"{"type":"GET"}"#).unwrap();
        let out = d.route(PEER, &inbound, Instant::now());
        assert_eq!(out, Outbound::error(PEER, NOT_READY_MESSAGE));
    }

    #[test]
    fn test_faults_dropped_without_touching_session() {
        let (d, reg, sid, start) = setup(true);
        let later = start + Duration::from_secs(10);

        for payload in [
            &br#"{"type":"BOGUS"}"#[..],
            br#"{"type":"ERROR"}"#,
            br#"{"type":7}"#,
            br#"{"id":"x"}"#,
            b"not json",
            b"[1,2]",
        ] {
            assert!(matches!(
                d.dispatch(&reg, PEER, sid, payload, later),
                DispatchOutcome::Dropped(_)
            ));
        }
        assert_eq!(reg.lock().lookup(PEER).unwrap().last_activity(), start);
    }

    #[test]
    fn test_evicted_session_is_gone() {
        let (d, reg, sid, start) = setup(true);
        reg.lock().evict(PEER);
        assert_eq!(
            d.dispatch(&reg, PEER, sid, br#"{"type":"PING"}"#, start),
            DispatchOutcome::Gone
        );
    }
}
