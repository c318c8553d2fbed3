//! AT command codec for the HFP control channel.
//!
//! The RFCOMM transport gives no line framing: one read may hold half a line,
//! several lines, or noise. Everything here works on raw byte chunks with
//! substring search and never assumes a chunk ends on a line boundary.

// ── Command lines ─────────────────────────────────────────────────────────────

pub const CIND_TEST: &str = "AT+CIND=?\r";
pub const CIND_READ: &str = "AT+CIND?\r";
pub const CMER_ENABLE: &str = "AT+CMER=3,0,0,1\r";
pub const CMER_FALLBACK: &str = "AT+CMER=3,0,0,0\r";
pub const NREC_DISABLE: &str = "AT+NREC=0\r";
pub const CLIP_ENABLE: &str = "AT+CLIP=1\r";
pub const ANSWER: &str = "ATA\r";
pub const HANG_UP: &str = "AT+CHUP\r";

/// `AT+BRSF=<features>\r`
pub fn brsf(features: u32) -> String {
    format!("AT+BRSF={features}\r")
}

/// `ATD<number>;\r` (the trailing `;` requests a voice call).
pub fn dial(number: &str) -> String {
    format!("ATD{number};\r")
}

// ── Indicator / caller-ID parsing ─────────────────────────────────────────────

/// Indicator numbers the phone reports in `+CIEV`.
pub const IND_CALL: i32 = 1;
pub const IND_CALL_SETUP: i32 = 2;

/// Parse the first `+CIEV: <ind>,<value>` in `buf`.
pub fn parse_ciev(buf: &[u8]) -> Option<(i32, i32)> {
    let at = find(buf, b"+CIEV:")?;
    parse_ciev_body(&buf[at + b"+CIEV:".len()..])
}

/// Every well-formed `+CIEV` in `buf`, in order of appearance.
pub fn parse_all_ciev(buf: &[u8]) -> Vec<(i32, i32)> {
    let mut events = Vec::new();
    let mut rest = buf;
    while let Some(at) = find(rest, b"+CIEV:") {
        rest = &rest[at + b"+CIEV:".len()..];
        if let Some(event) = parse_ciev_body(rest) {
            events.push(event);
        }
    }
    events
}

fn parse_ciev_body(body: &[u8]) -> Option<(i32, i32)> {
    let body = skip_blanks(body);
    let (indicator, body) = parse_int(body)?;
    let body = skip_blanks(body);
    let body = body.strip_prefix(b",")?;
    let body = skip_blanks(body);
    let (value, _) = parse_int(body)?;
    Some((indicator, value))
}

/// Caller identity carried by `+CLIP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId {
    pub number: String,
    pub name: Option<String>,
}

/// Parse the first `+CLIP:` line in `buf`.
///
/// Layout: `+CLIP: "<number>",<type>,<subaddr>,<satype>,"<alpha>"`. The number
/// is the first quoted field; the name is the fifth field when it is present
/// and quoted. Missing name is normal.
pub fn parse_clip(buf: &[u8]) -> Option<CallerId> {
    let at = find(buf, b"+CLIP:")?;
    let body = &buf[at + b"+CLIP:".len()..];
    let end = body
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(body.len());
    let line = &body[..end];

    let fields = split_fields(line);
    let number = fields.first().and_then(|f| unquote(f))?;
    if number.is_empty() {
        return None;
    }
    let name = fields
        .get(4)
        .and_then(|f| unquote(f))
        .filter(|n| !n.is_empty())
        .map(|n| String::from_utf8_lossy(n).into_owned());

    Some(CallerId {
        number: String::from_utf8_lossy(number).into_owned(),
        name,
    })
}

/// Comma-split that does not break inside double quotes. A field whose
/// quote never closes is kept as-is, so [`unquote`] rejects it.
fn split_fields(line: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, &b) in line.iter().enumerate() {
        match b {
            b'"' => quoted = !quoted,
            b',' if !quoted => {
                fields.push(trim_blanks(&line[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(trim_blanks(&line[start..]));
    fields
}

fn unquote(field: &[u8]) -> Option<&[u8]> {
    field.strip_prefix(b"\"")?.strip_suffix(b"\"")
}

// ── Result codes ──────────────────────────────────────────────────────────────

/// Independent token flags found in one received chunk.
///
/// A chunk may carry any combination; callers check every flag they care
/// about instead of branching on the first hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    pub ring: bool,
    pub ok: bool,
    pub error: bool,
    pub no_carrier: bool,
    pub busy: bool,
    pub no_answer: bool,
    pub connect: bool,
    pub ciev: bool,
    pub clip: bool,
}

impl Signals {
    pub fn scan(buf: &[u8]) -> Self {
        Self {
            ring: contains(buf, b"RING"),
            ok: contains(buf, b"OK"),
            error: contains(buf, b"ERROR"),
            no_carrier: contains(buf, b"NO CARRIER"),
            busy: contains(buf, b"BUSY"),
            no_answer: contains(buf, b"NO ANSWER"),
            connect: contains(buf, b"CONNECT"),
            ciev: contains(buf, b"+CIEV"),
            clip: contains(buf, b"+CLIP"),
        }
    }

    /// `NO CARRIER`, `BUSY` or `NO ANSWER`: the phone ended the call.
    pub fn call_ended(&self) -> bool {
        self.no_carrier || self.busy || self.no_answer
    }

    /// A final result code: the phone is done answering the last command.
    pub fn is_final(&self) -> bool {
        self.ok || self.error || self.call_ended()
    }
}

/// Stop condition for ordinary command exchanges.
pub fn is_final_response(buf: &[u8]) -> bool {
    Signals::scan(buf).is_final()
}

/// Stop condition for `ATD`: call-setup indicators count as an answer too.
pub fn is_dial_response(buf: &[u8]) -> bool {
    let s = Signals::scan(buf);
    s.is_final() || s.ciev || s.connect
}

/// A command reply minus the line carrying its `OK` or `ERROR` status.
///
/// Phones send indicators and unsolicited codes in the same read as the
/// reply; what is left here still has to reach the dispatcher.
pub fn unsolicited(reply: &[u8]) -> Vec<u8> {
    let mut rest = Vec::with_capacity(reply.len());
    let mut status_seen = false;
    for line in reply.split_inclusive(|&b| b == b'\n') {
        if !status_seen && (contains(line, b"OK") || contains(line, b"ERROR")) {
            status_seen = true;
            continue;
        }
        rest.extend_from_slice(line);
    }
    rest
}

/// How a phone answered `ATD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialResponse {
    /// `OK`, `+CIEV` or `CONNECT`.
    Accepted,
    /// `ERROR` or `NO CARRIER`.
    Rejected(String),
    /// Anything else, including silence. Phones are inconsistent here, so
    /// callers treat this as a tentative success.
    Unrecognized(String),
}

pub fn classify_dial(buf: &[u8]) -> DialResponse {
    let s = Signals::scan(buf);
    if s.ok || s.ciev || s.connect {
        DialResponse::Accepted
    } else if s.error {
        DialResponse::Rejected("ERROR".into())
    } else if s.no_carrier {
        DialResponse::Rejected("NO CARRIER".into())
    } else {
        DialResponse::Unrecognized(preview(buf, 60))
    }
}

/// Printable single-line rendering of a received chunk for logs.
pub fn preview(buf: &[u8], max_chars: usize) -> String {
    String::from_utf8_lossy(buf)
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect()
}

// ── Byte helpers ──────────────────────────────────────────────────────────────

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

fn skip_blanks(buf: &[u8]) -> &[u8] {
    let n = buf.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
    &buf[n..]
}

fn trim_blanks(buf: &[u8]) -> &[u8] {
    let buf = skip_blanks(buf);
    let n = buf
        .iter()
        .rev()
        .take_while(|&&b| b == b' ' || b == b'\t')
        .count();
    &buf[..buf.len() - n]
}

/// Optional sign followed by at least one ASCII digit.
fn parse_int(buf: &[u8]) -> Option<(i32, &[u8])> {
    let (negative, digits) = match buf.first() {
        Some(b'-') => (true, &buf[1..]),
        Some(b'+') => (false, &buf[1..]),
        _ => (false, buf),
    };
    let len = digits.iter().take_while(|b| b.is_ascii_digit()).count();
    if len == 0 {
        return None;
    }
    let mut value: i32 = 0;
    for &d in &digits[..len] {
        value = value.checked_mul(10)?.checked_add(i32::from(d - b'0'))?;
    }
    Some((if negative { -value } else { value }, &digits[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsolicited_drops_only_the_status_line() {
        let rest = unsolicited(b"\r\nOK\r\n+CIEV: 1,1\r\n");
        assert_eq!(parse_ciev(&rest), Some((1, 1)));
        assert!(!Signals::scan(&rest).ok);

        let rest = unsolicited(b"+CIEV: 2,2\r\nOK\r\nOK\r\n");
        assert!(Signals::scan(&rest).ciev);
        assert!(Signals::scan(&rest).ok);

        assert!(unsolicited(b"\r\nERROR\r\n").iter().all(u8::is_ascii_whitespace));
        assert_eq!(unsolicited(b"NO CARRIER"), b"NO CARRIER".to_vec());
    }

    #[test]
    fn ciev_plain_and_padded() {
        assert_eq!(parse_ciev(b"+CIEV: 2,1"), Some((2, 1)));
        assert_eq!(parse_ciev(b"+CIEV:1,0"), Some((1, 0)));
        assert_eq!(parse_ciev(b"+CIEV:\t 3 ,\t 2\r\n"), Some((3, 2)));
        assert_eq!(parse_ciev(b"+CIEV: -1,+4"), Some((-1, 4)));
    }

    #[test]
    fn ciev_embedded_in_noise() {
        assert_eq!(parse_ciev(b"garbage+CIEV: 2,1\r\nOK\r\n"), Some((2, 1)));
        assert_eq!(parse_ciev(b"\r\n\x00\xff+CIEV: 1,1"), Some((1, 1)));
    }

    #[test]
    fn ciev_malformed() {
        assert_eq!(parse_ciev(b"+CIEV: 2 1"), None);
        assert_eq!(parse_ciev(b"+CIEV: x,1"), None);
        assert_eq!(parse_ciev(b"+CIEV: 2,"), None);
        assert_eq!(parse_ciev(b"+CIEV: 2,y"), None);
        assert_eq!(parse_ciev(b"+CIEV"), None);
        assert_eq!(parse_ciev(b"OK"), None);
        assert_eq!(parse_ciev(b"+CIEV: 99999999999,1"), None);
    }

    #[test]
    fn ciev_truncated_chunk_does_not_read_past_end() {
        assert_eq!(parse_ciev(b"+CIEV: 2"), None);
        assert_eq!(parse_ciev(b"+CIEV: "), None);
    }

    #[test]
    fn all_ciev_in_order() {
        let chunk = b"+CIEV: 2,0\r\n+CIEV: bad\r\n+CIEV: 1,1\r\n";
        assert_eq!(parse_all_ciev(chunk), vec![(2, 0), (1, 1)]);
    }

    #[test]
    fn clip_with_name() {
        let id = parse_clip(b"+CLIP: \"12345\",129,,,\"Alice\"").unwrap();
        assert_eq!(id.number, "12345");
        assert_eq!(id.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn clip_without_name() {
        let id = parse_clip(b"+CLIP: \"12345\",129").unwrap();
        assert_eq!(id.number, "12345");
        assert_eq!(id.name, None);

        let id = parse_clip(b"+CLIP: \"12345\",129,,,\"\"\r\n").unwrap();
        assert_eq!(id.name, None);
    }

    #[test]
    fn clip_quoted_subaddress_and_trailing_validity() {
        let id = parse_clip(b"RING\r\n+CLIP: \"+90555\",145,\"\",,\"Bob, Jr\",0\r\nRING").unwrap();
        assert_eq!(id.number, "+90555");
        assert_eq!(id.name.as_deref(), Some("Bob, Jr"));
    }

    #[test]
    fn clip_partial_line_is_ignored() {
        assert_eq!(parse_clip(b"+CLIP: \"1234"), None);
        assert_eq!(parse_clip(b"+CLIP: 12345,129"), None);
        assert_eq!(parse_clip(b"+CLIP: \"\",128"), None);
    }

    #[test]
    fn signals_are_independent() {
        let s = Signals::scan(b"RING\r\n+CLIP: \"5551234\",129,,,\"Bob\"\r\n");
        assert!(s.ring && s.clip);
        assert!(!s.ok && !s.ciev && !s.call_ended());

        let s = Signals::scan(b"+CIEV: 1,0\r\nNO CARRIER\r\n");
        assert!(s.ciev && s.no_carrier && s.call_ended() && s.is_final());
    }

    #[test]
    fn dial_classification() {
        assert_eq!(classify_dial(b"\r\nOK\r\n"), DialResponse::Accepted);
        assert_eq!(classify_dial(b"+CIEV: 2,2"), DialResponse::Accepted);
        assert_eq!(classify_dial(b"CONNECT"), DialResponse::Accepted);
        assert_eq!(classify_dial(b"ERROR"), DialResponse::Rejected("ERROR".into()));
        assert_eq!(
            classify_dial(b"NO CARRIER"),
            DialResponse::Rejected("NO CARRIER".into())
        );
        assert_eq!(
            classify_dial(b"\r\n+BSIR: 0\r\n"),
            DialResponse::Unrecognized("+BSIR: 0".into())
        );
        assert_eq!(classify_dial(b""), DialResponse::Unrecognized(String::new()));
    }

    #[test]
    fn command_lines() {
        assert_eq!(brsf(0), "AT+BRSF=0\r");
        assert_eq!(dial("5550000"), "ATD5550000;\r");
    }
}
