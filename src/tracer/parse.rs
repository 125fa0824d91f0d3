//! Line parsing for tcp tracing tool output.
//!
//! Each parser turns one line (newline already stripped) into a typed
//! record. Tokens are positional; the 0-based index of the first missing or
//! malformed token is reported in the error so the caller can log it. A line
//! that fails to parse is never partially applied.

use thiserror::Error;

use super::event::{
    AcceptEvent, ConnLatEvent, ConnectEvent, Event, EventKind, LifeEvent, RetransEvent,
    TypedEvent, IP_ADDR_MAX_LEN, PATH_MAX_LEN, UNKNOWN_COMM,
};

/// Longest dotted-quad IPv4 address.
const IPV4_MAX_LEN: usize = 15;

/// Longest colon-hex IPv6 address.
const IPV6_MAX_LEN: usize = 39;

const _: () = assert!(IPV4_MAX_LEN <= IP_ADDR_MAX_LEN && IPV6_MAX_LEN <= IP_ADDR_MAX_LEN);

/// Errors that can occur during line parsing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("missing expected token {index}")]
    MissingToken { index: usize },

    #[error("token {index}: invalid IPv{ip_version} address {value:?}")]
    InvalidAddress {
        index: usize,
        ip_version: u32,
        value: String,
    },

    #[error("token {index}: invalid number {value:?}")]
    InvalidNumber { index: usize, value: String },

    #[error("token {index}: field is {len} bytes, limit is {max}")]
    FieldTooLong { index: usize, len: usize, max: usize },
}

impl ParseError {
    /// Token index the error refers to.
    pub fn index(&self) -> usize {
        match self {
            Self::MissingToken { index }
            | Self::InvalidAddress { index, .. }
            | Self::InvalidNumber { index, .. }
            | Self::FieldTooLong { index, .. } => *index,
        }
    }

    /// Short label used for metrics.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MissingToken { .. } => "missing_token",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::InvalidNumber { .. } => "invalid_number",
            Self::FieldTooLong { .. } => "field_too_long",
        }
    }
}

/// Parse a line of the given kind into a [`TypedEvent`].
pub fn parse_line(kind: EventKind, line: &str) -> Result<TypedEvent, ParseError> {
    Ok(match kind {
        EventKind::Accept => TypedEvent::Accept(parse_accept(line)?),
        EventKind::Connect => TypedEvent::Connect(parse_connect(line)?),
        EventKind::ConnLat => TypedEvent::ConnLat(parse_connlat(line)?),
        EventKind::Life => TypedEvent::Life(parse_life(line)?),
        EventKind::Retrans => TypedEvent::Retrans(parse_retrans(line)?),
    })
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Splits a line on a delimiter, collapsing runs of delimiters so that no
/// token is ever empty.
struct Tokens<'a> {
    rest: &'a str,
    delim: char,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str, delim: char) -> Self {
        Self { rest: line, delim }
    }

    fn for_kind(line: &'a str, kind: EventKind) -> Self {
        Self::new(line, kind.delimiter())
    }

    fn next_token(&mut self) -> Option<&'a str> {
        let delim = self.delim;
        let is_delim = move |c: char| {
            if delim == ' ' {
                c.is_whitespace()
            } else {
                c == delim
            }
        };

        let start = self.rest.trim_start_matches(is_delim);
        if start.is_empty() {
            self.rest = start;
            return None;
        }

        let end = start.find(is_delim).unwrap_or(start.len());
        let (token, rest) = start.split_at(end);
        self.rest = rest;

        // CSV fields may carry stray padding; whitespace tokens never do.
        let token = if delim == ' ' { token } else { token.trim() };
        if token.is_empty() {
            return self.next_token();
        }
        Some(token)
    }

    fn expect(&mut self, index: usize) -> Result<&'a str, ParseError> {
        self.next_token().ok_or(ParseError::MissingToken { index })
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn parse_pid(token: &str, index: usize) -> Result<u32, ParseError> {
    token.parse().map_err(|_| invalid_number(token, index))
}

fn parse_port(token: &str, index: usize) -> Result<u16, ParseError> {
    token.parse().map_err(|_| invalid_number(token, index))
}

fn parse_kb(token: &str, index: usize) -> Result<i64, ParseError> {
    token.parse().map_err(|_| invalid_number(token, index))
}

fn parse_ms(token: &str, index: usize) -> Result<f64, ParseError> {
    match token.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(invalid_number(token, index)),
    }
}

fn invalid_number(token: &str, index: usize) -> ParseError {
    ParseError::InvalidNumber {
        index,
        value: token.to_string(),
    }
}

/// Reads the leading decimal integer of a token, yielding 0 when there is
/// none. Process names that contain spaces rely on this: a name fragment in
/// the IP version slot reads as 0 and triggers the connect recovery loop.
fn leading_int(token: &str) -> u32 {
    let digits = token
        .as_bytes()
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    token
        .get(..digits)
        .and_then(|d| d.parse().ok())
        .unwrap_or(0)
}

fn parse_comm(token: &str, index: usize) -> Result<String, ParseError> {
    bounded(token, index, PATH_MAX_LEN)
}

fn bounded(token: &str, index: usize, max: usize) -> Result<String, ParseError> {
    if token.len() > max {
        return Err(ParseError::FieldTooLong {
            index,
            len: token.len(),
            max,
        });
    }
    Ok(token.to_string())
}

/// Validates an address against the character class of its IP version.
/// Version 4 accepts digits and `.`; anything else is treated as version 6
/// and accepts digits, `a-f` and `:`.
fn parse_addr(token: &str, ip_version: u32, index: usize) -> Result<String, ParseError> {
    let (max, valid): (usize, fn(u8) -> bool) = if ip_version == 4 {
        (IPV4_MAX_LEN, |b| b.is_ascii_digit() || b == b'.')
    } else {
        (IPV6_MAX_LEN, |b| {
            b.is_ascii_digit() || (b'a'..=b'f').contains(&b) || b == b':'
        })
    };

    if token.len() > max || !token.bytes().all(valid) {
        return Err(ParseError::InvalidAddress {
            index,
            ip_version,
            value: token.to_string(),
        });
    }

    Ok(token.to_string())
}

// ---------------------------------------------------------------------------
// Per-kind parsers
// ---------------------------------------------------------------------------

/// tcpaccept: `pid comm ip raddr rport laddr lport`.
pub fn parse_accept(line: &str) -> Result<AcceptEvent, ParseError> {
    let mut t = Tokens::for_kind(line, EventKind::Accept);

    let pid = parse_pid(t.expect(0)?, 0)?;
    let comm = parse_comm(t.expect(1)?, 1)?;
    let ip_version = leading_int(t.expect(2)?);
    let remote_addr = parse_addr(t.expect(3)?, ip_version, 3)?;
    let remote_port = parse_port(t.expect(4)?, 4)?;
    let local_addr = parse_addr(t.expect(5)?, ip_version, 5)?;
    let local_port = parse_port(t.expect(6)?, 6)?;

    Ok(AcceptEvent {
        event: Event {
            pid,
            ip_version,
            comm,
        },
        remote_addr,
        remote_port,
        local_addr,
        local_port,
    })
}

/// tcpconnect: `pid comm ip saddr daddr dport`.
///
/// The process name may contain spaces, which shifts every later token
/// right. Tokens are folded into the name until one reads as a non-zero IP
/// version; they all count as position 2 for error reporting.
pub fn parse_connect(line: &str) -> Result<ConnectEvent, ParseError> {
    let mut t = Tokens::for_kind(line, EventKind::Connect);

    let pid = parse_pid(t.expect(0)?, 0)?;
    let mut comm = t.expect(1)?.to_string();
    let mut token = t.expect(2)?;
    let mut ip_version = leading_int(token);
    while ip_version == 0 {
        comm.push(' ');
        comm.push_str(token);
        token = t.expect(2)?;
        ip_version = leading_int(token);
    }
    let comm = parse_comm(&comm, 1)?;
    let source_addr = parse_addr(t.expect(3)?, ip_version, 3)?;
    let dest_addr = parse_addr(t.expect(4)?, ip_version, 4)?;
    let dest_port = parse_port(t.expect(5)?, 5)?;

    Ok(ConnectEvent {
        event: Event {
            pid,
            ip_version,
            comm,
        },
        source_addr,
        dest_addr,
        dest_port,
    })
}

/// tcpconnlat: `pid comm ip saddr daddr dport lat_ms`.
pub fn parse_connlat(line: &str) -> Result<ConnLatEvent, ParseError> {
    let mut t = Tokens::for_kind(line, EventKind::ConnLat);

    let pid = parse_pid(t.expect(0)?, 0)?;
    let comm = parse_comm(t.expect(1)?, 1)?;
    let ip_version = leading_int(t.expect(2)?);
    let source_addr = parse_addr(t.expect(3)?, ip_version, 3)?;
    let dest_addr = parse_addr(t.expect(4)?, ip_version, 4)?;
    let dest_port = parse_port(t.expect(5)?, 5)?;
    let latency_ms = parse_ms(t.expect(6)?, 6)?;

    Ok(ConnLatEvent {
        event: Event {
            pid,
            ip_version,
            comm,
        },
        source_addr,
        dest_addr,
        dest_port,
        latency_ms,
    })
}

/// tcplife CSV: `pid,comm,ip,laddr,lport,raddr,rport,tx_kb,rx_kb,ms`.
pub fn parse_life(line: &str) -> Result<LifeEvent, ParseError> {
    let mut t = Tokens::for_kind(line, EventKind::Life);

    let pid = parse_pid(t.expect(0)?, 0)?;
    let comm = parse_comm(t.expect(1)?, 1)?;
    let ip_version = leading_int(t.expect(2)?);
    let local_addr = parse_addr(t.expect(3)?, ip_version, 3)?;
    let local_port = parse_port(t.expect(4)?, 4)?;
    let remote_addr = parse_addr(t.expect(5)?, ip_version, 5)?;
    let remote_port = parse_port(t.expect(6)?, 6)?;
    let tx_kb = parse_kb(t.expect(7)?, 7)?;
    let rx_kb = parse_kb(t.expect(8)?, 8)?;
    let duration_ms = parse_ms(t.expect(9)?, 9)?;

    Ok(LifeEvent {
        event: Event {
            pid,
            ip_version,
            comm,
        },
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        tx_kb,
        rx_kb,
        duration_ms,
    })
}

/// tcpretrans: `pid ip laddr:lport raddr:rport state`.
///
/// Best effort: the upstream layout is not pinned down, so only these five
/// positions are read and the endpoints are kept as opaque strings. The
/// tool reports no process name.
pub fn parse_retrans(line: &str) -> Result<RetransEvent, ParseError> {
    let mut t = Tokens::for_kind(line, EventKind::Retrans);

    let pid = parse_pid(t.expect(0)?, 0)?;
    let ip_version = leading_int(t.expect(1)?);
    let local = bounded(t.expect(2)?, 2, PATH_MAX_LEN)?;
    let remote = bounded(t.expect(3)?, 3, PATH_MAX_LEN)?;
    let state = bounded(t.expect(4)?, 4, PATH_MAX_LEN)?;

    Ok(RetransEvent {
        event: Event {
            pid,
            ip_version,
            comm: UNKNOWN_COMM.to_string(),
        },
        local,
        remote,
        state,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    // -- Accept --

    #[test]
    fn test_accept() {
        let e = parse_accept("812 sshd 4 192.168.1.20 51234 192.168.1.5 22").unwrap();
        assert_eq!(e.event.pid, 812);
        assert_eq!(e.event.comm, "sshd");
        assert_eq!(e.event.ip_version, 4);
        assert_eq!(e.remote_addr, "192.168.1.20");
        assert_eq!(e.remote_port, 51234);
        assert_eq!(e.local_addr, "192.168.1.5");
        assert_eq!(e.local_port, 22);
    }

    #[test]
    fn test_accept_ipv6() {
        let e = parse_accept("9 nginx 6 fe80::1 443 ::1 8443").unwrap();
        assert_eq!(e.event.ip_version, 6);
        assert_eq!(e.remote_addr, "fe80::1");
        assert_eq!(e.local_addr, "::1");
    }

    #[test]
    fn test_accept_missing_last_token() {
        let err = parse_accept("812 sshd 4 192.168.1.20 51234 192.168.1.5").unwrap_err();
        assert_eq!(err, ParseError::MissingToken { index: 6 });
    }

    #[test]
    fn test_empty_line_missing_first_token() {
        for kind in EventKind::all() {
            let err = parse_line(*kind, "").unwrap_err();
            assert_eq!(err, ParseError::MissingToken { index: 0 }, "{kind}");
        }
    }

    // -- Connect --

    #[test]
    fn test_connect_comm_with_space() {
        let e = parse_connect("1234 my proc 4 10.0.0.1 10.0.0.2 443").unwrap();
        assert_eq!(e.event.pid, 1234);
        assert_eq!(e.event.comm, "my proc");
        assert_eq!(e.event.ip_version, 4);
        assert_eq!(e.source_addr, "10.0.0.1");
        assert_eq!(e.dest_addr, "10.0.0.2");
        assert_eq!(e.dest_port, 443);
    }

    #[test]
    fn test_connect_comm_with_several_spaces() {
        let e = parse_connect("77 Web Content Main 6 ::1 2001:db8::7 80").unwrap();
        assert_eq!(e.event.comm, "Web Content Main");
        assert_eq!(e.event.ip_version, 6);
        assert_eq!(e.dest_addr, "2001:db8::7");
    }

    #[test]
    fn test_connect_recovery_runs_out_of_tokens() {
        let err = parse_connect("77 a b c").unwrap_err();
        assert_eq!(err, ParseError::MissingToken { index: 2 });
    }

    #[test]
    fn test_connect_repeated_spaces_collapse() {
        let e = parse_connect("  5   curl   4  10.1.1.1   10.1.1.2  8080 ").unwrap();
        assert_eq!(e.event.comm, "curl");
        assert_eq!(e.dest_port, 8080);
    }

    // -- ConnLat --

    #[test]
    fn test_connlat() {
        let e = parse_connlat("3011 wget 4 10.0.0.3 93.184.216.34 80 12.75").unwrap();
        assert_eq!(e.event.comm, "wget");
        assert_eq!(e.dest_port, 80);
        assert!((e.latency_ms - 12.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_connlat_bad_latency() {
        let err = parse_connlat("3011 wget 4 10.0.0.3 10.0.0.4 80 fast").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidNumber {
                index: 6,
                value: "fast".to_string()
            }
        );
    }

    // -- Life --

    #[test]
    fn test_life() {
        let e = parse_life("55,nginx,4,127.0.0.1,8080,10.0.0.9,33000,120,340,15.25").unwrap();
        assert_eq!(e.event.pid, 55);
        assert_eq!(e.event.comm, "nginx");
        assert_eq!(e.local_addr, "127.0.0.1");
        assert_eq!(e.local_port, 8080);
        assert_eq!(e.remote_addr, "10.0.0.9");
        assert_eq!(e.remote_port, 33000);
        assert_eq!(e.tx_kb, 120);
        assert_eq!(e.rx_kb, 340);
        assert!((e.duration_ms - 15.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_life_comm_keeps_spaces() {
        let e = parse_life("8,Web Content,4,10.0.0.1,1,10.0.0.2,2,0,0,0.5").unwrap();
        assert_eq!(e.event.comm, "Web Content");
    }

    #[test]
    fn test_life_missing_duration() {
        let err = parse_life("55,nginx,4,127.0.0.1,8080,10.0.0.9,33000,120,340").unwrap_err();
        assert_eq!(err, ParseError::MissingToken { index: 9 });
    }

    // -- Retrans --

    #[test]
    fn test_retrans_best_effort() {
        let e = parse_retrans("1500 4 10.0.0.1:22 10.0.0.2:51000 ESTABLISHED").unwrap();
        assert_eq!(e.event.pid, 1500);
        assert_eq!(e.event.ip_version, 4);
        assert_eq!(e.event.comm, UNKNOWN_COMM);
        assert_eq!(e.local, "10.0.0.1:22");
        assert_eq!(e.remote, "10.0.0.2:51000");
        assert_eq!(e.state, "ESTABLISHED");
    }

    #[test]
    fn test_retrans_missing_state() {
        let err = parse_retrans("1500 4 10.0.0.1:22 10.0.0.2:51000").unwrap_err();
        assert_eq!(err, ParseError::MissingToken { index: 4 });
    }

    // -- Address validation --

    #[test]
    fn test_ipv4_rejects_letters() {
        let err = parse_accept("1 a 4 10.0.0.x 1 10.0.0.1 2").unwrap_err();
        assert!(matches!(err, ParseError::InvalidAddress { index: 3, .. }));
    }

    #[test]
    fn test_ipv4_rejects_ipv6_text() {
        let err = parse_connect("1 a 4 ::1 10.0.0.1 2").unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidAddress {
                index: 3,
                ip_version: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_ipv4_length_limit() {
        let err = parse_accept("1 a 4 1000.1000.1000.1 1 10.0.0.1 2").unwrap_err();
        assert!(matches!(err, ParseError::InvalidAddress { index: 3, .. }));
    }

    #[test]
    fn test_ipv6_rejects_uppercase() {
        let err = parse_accept("1 a 6 FE80::1 1 ::1 2").unwrap_err();
        assert!(matches!(err, ParseError::InvalidAddress { index: 3, .. }));
    }

    #[test]
    fn test_ipv6_length_limit() {
        let long = "2001:0db8:0000:0000:0000:ff00:0042:8329:1";
        let err = parse_accept(&format!("1 a 6 {long} 1 ::1 2")).unwrap_err();
        assert!(matches!(err, ParseError::InvalidAddress { index: 3, .. }));
    }

    // -- Numbers --

    #[test]
    fn test_non_numeric_pid_rejected() {
        let err = parse_accept("PID COMM IP RADDR RPORT LADDR LPORT").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidNumber {
                index: 0,
                value: "PID".to_string()
            }
        );
    }

    #[test]
    fn test_port_out_of_range() {
        let err = parse_accept("1 a 4 10.0.0.1 70000 10.0.0.2 2").unwrap_err();
        assert!(matches!(err, ParseError::InvalidNumber { index: 4, .. }));
    }

    #[test]
    fn test_leading_int() {
        assert_eq!(leading_int("4"), 4);
        assert_eq!(leading_int("6x"), 6);
        assert_eq!(leading_int("proc"), 0);
        assert_eq!(leading_int("0"), 0);
        assert_eq!(leading_int(""), 0);
    }

    #[test]
    fn test_comm_length_limit() {
        let comm = "x".repeat(PATH_MAX_LEN + 1);
        let err = parse_accept(&format!("1 {comm} 4 10.0.0.1 1 10.0.0.2 2")).unwrap_err();
        assert_eq!(
            err,
            ParseError::FieldTooLong {
                index: 1,
                len: PATH_MAX_LEN + 1,
                max: PATH_MAX_LEN
            }
        );
    }

    // -- Structured round trip --

    #[test]
    fn test_life_fields_reserialize() {
        let line = "901,postgres,6,::1,5432,fe80::2,41000,7,9,0.125";
        let e = parse_life(line).unwrap();
        let rebuilt = format!(
            "{},{},{},{},{},{},{},{},{},{}",
            e.event.pid,
            e.event.comm,
            e.event.ip_version,
            e.local_addr,
            e.local_port,
            e.remote_addr,
            e.remote_port,
            e.tx_kb,
            e.rx_kb,
            e.duration_ms
        );
        assert_eq!(parse_life(&rebuilt).unwrap(), e);
    }

    #[test]
    fn test_connect_fields_reserialize() {
        let e = parse_connect("1234 my proc 4 10.0.0.1 10.0.0.2 443").unwrap();
        let rebuilt = format!(
            "{} {} {} {} {} {}",
            e.event.pid,
            e.event.comm,
            e.event.ip_version,
            e.source_addr,
            e.dest_addr,
            e.dest_port
        );
        assert_eq!(parse_connect(&rebuilt).unwrap(), e);
    }

    #[test]
    fn test_parse_line_dispatch() {
        let ev = parse_line(EventKind::Life, "55,nginx,4,127.0.0.1,8080,10.0.0.9,33000,1,2,3").unwrap();
        assert_eq!(ev.kind(), EventKind::Life);

        let ev = parse_line(EventKind::Retrans, "1 4 a:1 b:2 SYN_SENT").unwrap();
        assert_eq!(ev.kind(), EventKind::Retrans);
    }

    #[test]
    fn test_parse_error_display() {
        let e = ParseError::MissingToken { index: 3 };
        assert_eq!(e.to_string(), "missing expected token 3");
        assert_eq!(e.label(), "missing_token");
        assert_eq!(e.index(), 3);

        let e = ParseError::InvalidAddress {
            index: 4,
            ip_version: 4,
            value: "a.b".to_string(),
        };
        assert_eq!(e.to_string(), "token 4: invalid IPv4 address \"a.b\"");
    }
}
