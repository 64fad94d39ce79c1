//! Compact syslog frame parser.
//!
//! Reference implementation of the `bytes -> parsed record | error` function
//! the core treats as an external collaborator. Handles the common RFC5424
//! and RFC3164 shapes plus one-JSON-document-per-frame; it is not a complete
//! RFC parser.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use logship_core::config::{SyslogFormat, SyslogSourceConfig};
use logship_core::model::ParsedRecord;

/// Parse failure. The caller counts and drops; nothing is stashed.
#[derive(Debug, thiserror::Error)]
#[error("syslog parse error: {0}")]
pub struct ParseError(String);

fn err(message: impl Into<String>) -> ParseError {
    ParseError(message.into())
}

/// Parse one frame according to the source configuration.
pub fn parse_frame(
    payload: &[u8],
    config: &SyslogSourceConfig,
    received_at: DateTime<Utc>,
) -> Result<ParsedRecord, ParseError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| err("frame is not valid UTF-8"))?
        .trim_end_matches(['\r', '\n'])
        .trim_start_matches('\u{feff}');
    if text.is_empty() {
        return Err(err("empty frame"));
    }

    match config.format {
        SyslogFormat::Json => parse_json(text, received_at),
        SyslogFormat::Rfc5424 => parse_rfc5424(text, config, received_at),
        SyslogFormat::Rfc3164 => parse_rfc3164(text, received_at),
        SyslogFormat::Auto => {
            if text.starts_with('{') {
                parse_json(text, received_at)
            } else {
                let (_, rest) = split_priority(text)?;
                if rest.starts_with("1 ") {
                    parse_rfc5424(text, config, received_at)
                } else {
                    parse_rfc3164(text, received_at)
                }
            }
        }
    }
}

fn split_priority(text: &str) -> Result<(u8, &str), ParseError> {
    let rest = text.strip_prefix('<').ok_or_else(|| err("missing <PRI>"))?;
    let close = rest.find('>').ok_or_else(|| err("unterminated <PRI>"))?;
    let priority: u16 = rest[..close]
        .parse()
        .map_err(|_| err("non-numeric priority"))?;
    if priority > 191 {
        return Err(err("priority out of range"));
    }
    Ok((priority as u8, &rest[close + 1..]))
}

fn blank_record(priority: u8, received_at: DateTime<Utc>) -> ParsedRecord {
    ParsedRecord {
        facility: priority >> 3,
        severity: priority & 7,
        priority,
        hostname: String::new(),
        appname: String::new(),
        procid: String::new(),
        msgid: String::new(),
        timestamp_reported: received_at,
        timestamp_generated: received_at,
        message: String::new(),
        structured_data: HashMap::new(),
        properties: HashMap::new(),
    }
}

fn dash_empty(token: &str) -> String {
    if token == "-" {
        String::new()
    } else {
        token.to_string()
    }
}

fn parse_rfc5424(
    text: &str,
    config: &SyslogSourceConfig,
    received_at: DateTime<Utc>,
) -> Result<ParsedRecord, ParseError> {
    let (priority, rest) = split_priority(text)?;
    let rest = rest
        .strip_prefix("1 ")
        .ok_or_else(|| err("unsupported syslog version"))?;

    let mut record = blank_record(priority, received_at);
    let mut parts = rest.splitn(7, ' ');
    let timestamp = parts.next().ok_or_else(|| err("missing timestamp"))?;
    record.hostname = dash_empty(parts.next().ok_or_else(|| err("missing hostname"))?);
    record.appname = dash_empty(parts.next().ok_or_else(|| err("missing appname"))?);
    record.procid = dash_empty(parts.next().ok_or_else(|| err("missing procid"))?);
    record.msgid = dash_empty(parts.next().ok_or_else(|| err("missing msgid"))?);
    let tail = parts.next().unwrap_or("-");
    let trailing = parts.next();

    // Use the reported timestamp only when it actually parses.
    if timestamp != "-" {
        if let Ok(reported) = DateTime::parse_from_rfc3339(timestamp) {
            record.timestamp_reported = reported.with_timezone(&Utc);
        }
    }

    let message_after_sd;
    if tail.starts_with('[') && !config.dont_parse_structured_data {
        let (sd, remainder) = parse_structured_data(tail, trailing)?;
        record.structured_data = sd;
        message_after_sd = remainder;
    } else if tail == "-" {
        message_after_sd = trailing.unwrap_or("").to_string();
    } else {
        let mut message = tail.to_string();
        if let Some(trailing) = trailing {
            message.push(' ');
            message.push_str(trailing);
        }
        message_after_sd = message;
    }
    record.message = message_after_sd.trim_start().to_string();
    Ok(record)
}

type StructuredData = HashMap<String, HashMap<String, String>>;

/// Parse `[id k="v" ...]...` elements. Returns the elements and the message
/// remainder.
fn parse_structured_data(
    tail: &str,
    trailing: Option<&str>,
) -> Result<(StructuredData, String), ParseError> {
    let mut full = tail.to_string();
    if let Some(trailing) = trailing {
        full.push(' ');
        full.push_str(trailing);
    }

    let mut sd = HashMap::new();
    let bytes = full.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() && bytes[pos] == b'[' {
        pos += 1;
        let id_end = full[pos..]
            .find([' ', ']'])
            .map(|i| pos + i)
            .ok_or_else(|| err("unterminated structured data element"))?;
        let id = full[pos..id_end].to_string();
        let mut params = HashMap::new();
        pos = id_end;

        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
            let eq = full[pos..]
                .find('=')
                .map(|i| pos + i)
                .ok_or_else(|| err("malformed structured data param"))?;
            let name = full[pos..eq].to_string();
            pos = eq + 1;
            if bytes.get(pos) != Some(&b'"') {
                return Err(err("unquoted structured data value"));
            }
            pos += 1;
            let mut value = String::new();
            loop {
                match bytes.get(pos) {
                    None => return Err(err("unterminated structured data value")),
                    Some(b'"') => {
                        pos += 1;
                        break;
                    }
                    Some(b'\\') => {
                        if let Some(&escaped) = bytes.get(pos + 1) {
                            value.push(escaped as char);
                            pos += 2;
                        } else {
                            return Err(err("dangling escape in structured data"));
                        }
                    }
                    Some(&b) => {
                        value.push(b as char);
                        pos += 1;
                    }
                }
            }
            params.insert(name, value);
        }

        if bytes.get(pos) != Some(&b']') {
            return Err(err("unterminated structured data element"));
        }
        pos += 1;
        sd.insert(id, params);
    }

    let remainder = full[pos..].to_string();
    Ok((sd, remainder))
}

fn parse_rfc3164(text: &str, received_at: DateTime<Utc>) -> Result<ParsedRecord, ParseError> {
    let (priority, rest) = split_priority(text)?;
    let mut record = blank_record(priority, received_at);

    // Mmm dd hh:mm:ss
    let (timestamp, rest) = if rest.len() >= 16 && rest.as_bytes().get(15) == Some(&b' ') {
        (&rest[..15], &rest[16..])
    } else {
        ("", rest)
    };
    if !timestamp.is_empty() {
        if let Some(reported) = parse_bsd_timestamp(timestamp, received_at) {
            record.timestamp_reported = reported;
        }
    }

    let mut parts = rest.splitn(2, ' ');
    record.hostname = parts.next().unwrap_or("").to_string();
    let tail = parts.next().unwrap_or("");

    // TAG[pid]: message
    if let Some(colon) = tail.find(": ") {
        let tag = &tail[..colon];
        record.message = tail[colon + 2..].to_string();
        if let Some(open) = tag.find('[') {
            record.appname = tag[..open].to_string();
            record.procid = tag[open + 1..].trim_end_matches(']').to_string();
        } else {
            record.appname = tag.to_string();
        }
    } else {
        record.message = tail.to_string();
    }

    Ok(record)
}

fn parse_bsd_timestamp(text: &str, received_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let month = MONTHS.iter().position(|m| text.starts_with(m))? as u32 + 1;
    let day: u32 = text.get(4..6)?.trim().parse().ok()?;
    let hour: u32 = text.get(7..9)?.parse().ok()?;
    let minute: u32 = text.get(10..12)?.parse().ok()?;
    let second: u32 = text.get(13..15)?.parse().ok()?;

    // BSD timestamps have no year; borrow it from the reception time.
    let date = NaiveDate::from_ymd_opt(received_at.year(), month, day)?;
    let naive = date.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}

fn parse_json(text: &str, received_at: DateTime<Utc>) -> Result<ParsedRecord, ParseError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| err(format!("invalid JSON frame: {}", e)))?;
    let obj = value.as_object().ok_or_else(|| err("JSON frame is not an object"))?;

    let str_field = |name: &str| -> String {
        obj.get(name)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    let int_field = |name: &str, max: u8| -> u8 {
        obj.get(name)
            .and_then(|v| v.as_u64())
            .map(|v| (v as u8).min(max))
            .unwrap_or(0)
    };

    let facility = int_field("facility", 23);
    let severity = int_field("severity", 7);
    let mut record = blank_record(facility * 8 + severity, received_at);
    record.hostname = str_field("hostname");
    record.appname = str_field("appname");
    record.procid = str_field("procid");
    record.msgid = str_field("msgid");
    record.message = str_field("message");
    if let Some(ts) = obj.get("timestamp").and_then(|v| v.as_str()) {
        if let Ok(reported) = DateTime::parse_from_rfc3339(ts) {
            record.timestamp_reported = reported.with_timezone(&Utc);
        }
    }

    const KNOWN: [&str; 8] = [
        "facility", "severity", "hostname", "appname", "procid", "msgid", "message", "timestamp",
    ];
    for (key, value) in obj {
        if !KNOWN.contains(&key.as_str()) {
            record.properties.insert(key.clone(), value.clone());
        }
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(format: SyslogFormat) -> SyslogSourceConfig {
        SyslogSourceConfig {
            format,
            ..SyslogSourceConfig::default()
        }
    }

    #[test]
    fn test_rfc5424_full() {
        let frame = b"<165>1 2026-07-30T09:14:07.003Z web-01 nginx 4321 ID47 [origin ip=\"198.51.100.7\"] GET /index.html";
        let record =
            parse_frame(frame, &config(SyslogFormat::Rfc5424), Utc::now()).unwrap();
        assert_eq!(record.facility, 20);
        assert_eq!(record.severity, 5);
        assert_eq!(record.hostname, "web-01");
        assert_eq!(record.appname, "nginx");
        assert_eq!(record.procid, "4321");
        assert_eq!(record.msgid, "ID47");
        assert_eq!(record.structured_data["origin"]["ip"], "198.51.100.7");
        assert_eq!(record.message, "GET /index.html");
        assert_eq!(
            record.timestamp_reported,
            "2026-07-30T09:14:07.003Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_rfc5424_nil_fields() {
        let frame = b"<34>1 - - - - - - core dumped";
        let received = Utc::now();
        let record = parse_frame(frame, &config(SyslogFormat::Rfc5424), received).unwrap();
        assert_eq!(record.hostname, "");
        assert_eq!(record.appname, "");
        assert_eq!(record.message, "core dumped");
        // Unparseable reported timestamp falls back to reception time.
        assert_eq!(record.timestamp_reported, received);
    }

    #[test]
    fn test_rfc5424_skip_structured_data() {
        let frame = b"<165>1 - host app - - [origin ip=\"x\"] msg";
        let mut cfg = config(SyslogFormat::Rfc5424);
        cfg.dont_parse_structured_data = true;
        let record = parse_frame(frame, &cfg, Utc::now()).unwrap();
        assert!(record.structured_data.is_empty());
        assert!(record.message.contains("[origin"));
    }

    #[test]
    fn test_rfc3164() {
        let received = Utc.with_ymd_and_hms(2026, 7, 30, 12, 0, 0).unwrap();
        let frame = b"<13>Jul 30 09:14:07 db-03 postgres[771]: checkpoint complete";
        let record = parse_frame(frame, &config(SyslogFormat::Rfc3164), received).unwrap();
        assert_eq!(record.facility, 1);
        assert_eq!(record.severity, 5);
        assert_eq!(record.hostname, "db-03");
        assert_eq!(record.appname, "postgres");
        assert_eq!(record.procid, "771");
        assert_eq!(record.message, "checkpoint complete");
        assert_eq!(record.timestamp_reported.month(), 7);
        assert_eq!(record.timestamp_reported.day(), 30);
        assert_eq!(record.timestamp_reported.year(), 2026);
    }

    #[test]
    fn test_json_frame() {
        let frame = br#"{"severity": 4, "facility": 16, "hostname": "app-02", "message": "slow request", "latency_ms": 2100}"#;
        let record = parse_frame(frame, &config(SyslogFormat::Json), Utc::now()).unwrap();
        assert_eq!(record.severity, 4);
        assert_eq!(record.hostname, "app-02");
        assert_eq!(record.message, "slow request");
        assert_eq!(record.properties["latency_ms"], 2100);
    }

    #[test]
    fn test_auto_detection() {
        let received = Utc::now();
        let rfc5424 = b"<165>1 - host app - - - hi";
        let rfc3164 = b"<13>Jul 30 09:14:07 host app: hi";
        let json = br#"{"message": "hi"}"#;
        let cfg = config(SyslogFormat::Auto);
        assert_eq!(parse_frame(rfc5424, &cfg, received).unwrap().appname, "app");
        assert_eq!(parse_frame(rfc3164, &cfg, received).unwrap().appname, "app");
        assert_eq!(parse_frame(json, &cfg, received).unwrap().message, "hi");
    }

    #[test]
    fn test_rejects_garbage() {
        let cfg = config(SyslogFormat::Auto);
        assert!(parse_frame(b"", &cfg, Utc::now()).is_err());
        assert!(parse_frame(b"no priority here", &cfg, Utc::now()).is_err());
        assert!(parse_frame(b"<999>1 - - - - - - x", &cfg, Utc::now()).is_err());
        assert!(parse_frame(&[0xff, 0xfe, 0x00], &cfg, Utc::now()).is_err());
    }
}
