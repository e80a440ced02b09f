//! Packet vocabulary: the closed set of command kinds and their wire names.
//!
//! ```text
//! PING  -> Heartbeat   (inbound + outbound echo)
//! INFO  -> Identity    (inbound, replied with device info)
//! SET   -> Configure   (inbound, forwarded to the domain service)
//! GET   -> Query       (inbound, forwarded; also used for broadcasts)
//! ERROR -> Error       (outbound only)
//! ```

use std::fmt;

/// Command carried in a message's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Liveness probe, echoed back immediately.
    Heartbeat,
    /// Static device information request.
    Identity,
    /// Change domain-service state.
    Configure,
    /// Read domain-service state.
    Query,
    /// Server-emitted failure notice. Never legal inbound.
    Error,
    /// Sentinel for any other string. Never a legal wire value.
    Unrecognized,
}

impl Command {
    /// Every command with a wire name, in wire order.
    pub const ALL: [Command; 5] = [
        Command::Heartbeat,
        Command::Identity,
        Command::Configure,
        Command::Query,
        Command::Error,
    ];

    /// Wire name of the command. `Unrecognized` maps to the empty string.
    pub fn as_wire(self) -> &'static str {
        match self {
            Command::Heartbeat => "PING",
            Command::Identity => "INFO",
            Command::Configure => "SET",
            Command::Query => "GET",
            Command::Error => "ERROR",
            Command::Unrecognized => "",
        }
    }

    /// Map a wire name to a command (case-sensitive).
    pub fn from_wire(value: &str) -> Command {
        match value {
            "PING" => Command::Heartbeat,
            "INFO" => Command::Identity,
            "SET" => Command::Configure,
            "GET" => Command::Query,
            "ERROR" => Command::Error,
            _ => Command::Unrecognized,
        }
    }

    /// Whether a client may send this command.
    #[inline]
    pub fn is_inbound(self) -> bool {
        !matches!(self, Command::Error | Command::Unrecognized)
    }

    /// Whether the command is answered by the domain service rather than locally.
    #[inline]
    pub fn is_domain(self) -> bool {
        matches!(self, Command::Configure | Command::Query)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unrecognized => f.write_str("UNRECOGNIZED"),
            other => f.write_str(other.as_wire()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_map_back() {
        for command in Command::ALL {
            assert_eq!(Command::from_wire(command.as_wire()), command);
        }
    }

    #[test]
    fn test_unknown_names_are_unrecognized() {
        assert_eq!(Command::from_wire("BOGUS"), Command::Unrecognized);
        assert_eq!(Command::from_wire(""), Command::Unrecognized);
        assert_eq!(Command::from_wire("ping"), Command::Unrecognized);
    }

    #[test]
    fn test_inbound_legality() {
        assert!(Command::Heartbeat.is_inbound());
        assert!(Command::Query.is_inbound());
        assert!(!Command::Error.is_inbound());
        assert!(!Command::Unrecognized.is_inbound());
    }

    #[test]
    fn test_domain_commands() {
        assert!(Command::Configure.is_domain());
        assert!(Command::Query.is_domain());
        assert!(!Command::Heartbeat.is_domain());
        assert!(!Command::Identity.is_domain());
    }

    #[test]
    fn test_display() {
        assert_eq!(Command::Configure.to_string(), "SET");
        assert_eq!(Command::Unrecognized.to_string(), "UNRECOGNIZED");
        assert_eq!(Command::Unrecognized.as_wire(), "");
    }
}
