//! Minimal HL7 v2 parsing — just enough of the MSH segment to classify a
//! message and build an ACK. Everything else in the payload is opaque bytes.

use crate::config::Hl7Settings;
use bytes::Bytes;

/// HL7 segment terminator.
pub const SEGMENT_TERMINATOR: u8 = 0x0D;

const DEFAULT_FIELD_SEPARATOR: char = '|';
const DEFAULT_ENCODING_CHARS: &str = "^~\\&";

/// Locates the MSH segment: the first segment whose first three bytes are
/// `MSH`. Usually segment zero, but garbage-tolerant.
fn msh_segment(payload: &[u8]) -> Option<&[u8]> {
    payload
        .split(|b| *b == SEGMENT_TERMINATOR)
        .find(|seg| seg.starts_with(b"MSH"))
}

/// Splits the MSH segment on its own field separator (the byte at MSH\[3\]).
fn msh_fields(payload: &[u8]) -> Option<Vec<&[u8]>> {
    let msh = msh_segment(payload)?;
    let sep = *msh.get(3)?;
    Some(msh.split(move |b| *b == sep).collect())
}

fn field(fields: &Option<Vec<&[u8]>>, index: usize) -> Option<String> {
    fields
        .as_ref()
        .and_then(|f| f.get(index))
        .filter(|f| !f.is_empty())
        .map(|f| String::from_utf8_lossy(f).into_owned())
}

/// The message type (MSH-9), e.g. `ORU^R01`. None when MSH is absent or short.
pub fn message_type(payload: &[u8]) -> Option<String> {
    field(&msh_fields(payload), 8)
}

/// The message control ID (MSH-10), or empty when absent.
pub fn control_id(payload: &[u8]) -> String {
    field(&msh_fields(payload), 9).unwrap_or_default()
}

/// True iff the message type begins with `ACK`. A payload without a parsable
/// MSH is never an ACK.
pub fn is_ack(payload: &[u8]) -> bool {
    message_type(payload).is_some_and(|t| t.starts_with("ACK"))
}

/// Message type via a plain split on `|`, ignoring the declared separator.
/// This is the lookup the standalone listener's event filter historically
/// used, kept for compatibility with existing configurations.
pub fn message_type_naive(payload: &[u8]) -> Option<String> {
    let msh = msh_segment(payload)?;
    let fields: Vec<&[u8]> = msh.split(|b| *b == b'|').collect();
    fields
        .get(8)
        .filter(|f| !f.is_empty())
        .map(|f| String::from_utf8_lossy(f).into_owned())
}

/// Builds an `ACK^R01` payload (no MLLP framing) for an incoming message.
///
/// Sender and receiver app/facility are swapped from the incoming MSH, with
/// the configured defaults filling any gaps; the incoming field separator
/// and encoding characters are reused; MSH-10 is echoed into both the MSH
/// and the MSA segment. A payload without an MSH still yields a valid ACK
/// built entirely from settings defaults and an empty control ID.
pub fn build_ack(incoming: &[u8], settings: &Hl7Settings) -> Bytes {
    let fields = msh_fields(incoming);

    let fs = msh_segment(incoming)
        .and_then(|m| m.get(3))
        .map(|b| *b as char)
        .unwrap_or(DEFAULT_FIELD_SEPARATOR);
    let enc = field(&fields, 1).unwrap_or_else(|| DEFAULT_ENCODING_CHARS.to_string());

    // swap: incoming sender becomes our receiver and vice versa
    let sending_app = field(&fields, 4).unwrap_or_else(|| settings.sending_application.clone());
    let sending_fac = field(&fields, 5).unwrap_or_else(|| settings.sending_facility.clone());
    let receiving_app = field(&fields, 2).unwrap_or_else(|| settings.receiving_application.clone());
    let receiving_fac = field(&fields, 3).unwrap_or_else(|| settings.receiving_facility.clone());

    let control = field(&fields, 9).unwrap_or_default();
    let ts = timestamp(&settings.message_date_time_format);

    let ack = format!(
        "MSH{fs}{enc}{fs}{sending_app}{fs}{sending_fac}{fs}{receiving_app}{fs}{receiving_fac}\
         {fs}{ts}{fs}{fs}ACK^R01{fs}{control}{fs}P{fs}2.3.1\r\
         MSA{fs}{ack_mode}{fs}{control}\r",
        ack_mode = settings.ack_mode,
    );
    Bytes::from(ack)
}

/// Local current time rendered per the configured .NET-style format.
fn timestamp(format: &str) -> String {
    chrono::Local::now()
        .format(&dotnet_to_strftime(format))
        .to_string()
}

/// Translates the supported .NET date format tokens into strftime ones.
/// Unknown characters pass through literally.
fn dotnet_to_strftime(format: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("fff", "%3f"),
    ];
    let mut out = String::with_capacity(format.len());
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (pat, repl) in TOKENS {
            if let Some(stripped) = rest.strip_prefix(pat) {
                out.push_str(repl);
                rest = stripped;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            if ch == '%' {
                out.push_str("%%");
            } else {
                out.push(ch);
            }
            rest = chars.as_str();
        }
    }
    out
}
