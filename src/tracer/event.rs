use std::fmt;

/// Process name used when the upstream tool gives none.
pub const UNKNOWN_COMM: &str = "[unknown]";

/// Longest textual IP address (IPv6 with embedded IPv4).
pub const IP_ADDR_MAX_LEN: usize = 45;

/// Platform path-length bound applied to process names and composite
/// `addr:port` fields.
pub const PATH_MAX_LEN: usize = 4096;

/// EventKind identifies which upstream tracing tool produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Accept = 0,
    Connect = 1,
    ConnLat = 2,
    Life = 3,
    Retrans = 4,
}

/// Number of EventKind variants, used for array sizing.
pub const EVENT_KIND_CARDINALITY: usize = 5;

impl EventKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::ConnLat => "connlat",
            Self::Life => "life",
            Self::Retrans => "retrans",
        }
    }

    /// Name of the upstream tool whose output this kind parses.
    pub const fn tool(self) -> &'static str {
        match self {
            Self::Accept => "tcpaccept",
            Self::Connect => "tcpconnect",
            Self::ConnLat => "tcpconnlat",
            Self::Life => "tcplife",
            Self::Retrans => "tcpretrans",
        }
    }

    /// Return all kinds in polling order.
    pub fn all() -> &'static [Self] {
        &[
            Self::Accept,
            Self::Connect,
            Self::ConnLat,
            Self::Life,
            Self::Retrans,
        ]
    }

    /// Field separator used by the upstream tool for this kind.
    pub const fn delimiter(self) -> char {
        match self {
            Self::Life => ',',
            _ => ' ',
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every event kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub pid: u32,
    /// IP version as reported upstream. Normally 4 or 6.
    pub ip_version: u32,
    pub comm: String,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            pid: 0,
            ip_version: 4,
            comm: UNKNOWN_COMM.to_string(),
        }
    }
}

/// Accepted inbound connection (tcpaccept).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcceptEvent {
    pub event: Event,
    pub remote_addr: String,
    pub remote_port: u16,
    pub local_addr: String,
    pub local_port: u16,
}

/// Outbound connection attempt (tcpconnect).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectEvent {
    pub event: Event,
    pub source_addr: String,
    pub dest_addr: String,
    pub dest_port: u16,
}

/// Outbound connection with measured setup latency (tcpconnlat).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnLatEvent {
    pub event: Event,
    pub source_addr: String,
    pub dest_addr: String,
    pub dest_port: u16,
    pub latency_ms: f64,
}

/// Closed connection with its lifetime totals (tcplife).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LifeEvent {
    pub event: Event,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub tx_kb: i64,
    pub rx_kb: i64,
    pub duration_ms: f64,
}

/// Retransmitted segment (tcpretrans).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetransEvent {
    pub event: Event,
    /// Local endpoint as `addr:port`.
    pub local: String,
    /// Remote endpoint as `addr:port`.
    pub remote: String,
    pub state: String,
}

/// Union of all typed event records.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedEvent {
    Accept(AcceptEvent),
    Connect(ConnectEvent),
    ConnLat(ConnLatEvent),
    Life(LifeEvent),
    Retrans(RetransEvent),
}

impl TypedEvent {
    /// Returns the kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Accept(_) => EventKind::Accept,
            Self::Connect(_) => EventKind::Connect,
            Self::ConnLat(_) => EventKind::ConnLat,
            Self::Life(_) => EventKind::Life,
            Self::Retrans(_) => EventKind::Retrans,
        }
    }

    /// Returns the common fields.
    pub fn event(&self) -> &Event {
        match self {
            Self::Accept(e) => &e.event,
            Self::Connect(e) => &e.event,
            Self::ConnLat(e) => &e.event,
            Self::Life(e) => &e.event,
            Self::Retrans(e) => &e.event,
        }
    }

    pub fn pid(&self) -> u32 {
        self.event().pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_kinds_in_discriminant_order() {
        let kinds = EventKind::all();
        assert_eq!(kinds.len(), EVENT_KIND_CARDINALITY);
        for (i, kind) in kinds.iter().enumerate() {
            assert_eq!(*kind as usize, i, "{kind}");
        }
    }

    #[test]
    fn test_only_life_is_comma_delimited() {
        for kind in EventKind::all() {
            let expected = if *kind == EventKind::Life { ',' } else { ' ' };
            assert_eq!(kind.delimiter(), expected, "{kind}");
        }
    }

    #[test]
    fn test_default_event_uses_unknown_comm() {
        let e = Event::default();
        assert_eq!(e.comm, UNKNOWN_COMM);
        assert_eq!(e.ip_version, 4);
    }

    #[test]
    fn test_typed_event_accessors() {
        let ev = TypedEvent::Life(LifeEvent {
            event: Event {
                pid: 55,
                ip_version: 6,
                comm: "nginx".to_string(),
            },
            ..Default::default()
        });
        assert_eq!(ev.kind(), EventKind::Life);
        assert_eq!(ev.pid(), 55);
        assert_eq!(ev.event().comm, "nginx");
    }
}
