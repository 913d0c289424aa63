//! Line-protocol measurement parsing.
//!
//! A measurement is one text line: `name[,tag=value...] field=value[,...] [timestamp]`.
//! The parser validates UTF-8 up front so everything downstream of it can
//! treat names and values as already-checked strings.

use std::borrow::Cow;

use anyhow::bail;

/// Timestamp value meaning "stamp with the receiver clock".
pub const NULL_TIMESTAMP: i64 = i64::MIN;

/// Unit of the trailing timestamp field on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampUnit {
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl TimestampUnit {
    pub fn to_micros(self, value: i64) -> i64 {
        match self {
            TimestampUnit::Nanos => value / 1_000,
            TimestampUnit::Micros => value,
            TimestampUnit::Millis => value.saturating_mul(1_000),
            TimestampUnit::Seconds => value.saturating_mul(1_000_000),
        }
    }
}

impl std::str::FromStr for TimestampUnit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "ns" | "nanos" => Ok(TimestampUnit::Nanos),
            "us" | "micros" => Ok(TimestampUnit::Micros),
            "ms" | "millis" => Ok(TimestampUnit::Millis),
            "s" | "seconds" => Ok(TimestampUnit::Seconds),
            other => bail!("unknown timestamp unit {other:?}"),
        }
    }
}

/// Wire-level entity kind. The numeric values are also the event-buffer tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntityType {
    Tag = 0,
    Float = 1,
    Integer = 2,
    String = 3,
    Boolean = 4,
    Long256 = 5,
    CachedTag = 6,
}

impl EntityType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => EntityType::Tag,
            1 => EntityType::Float,
            2 => EntityType::Integer,
            3 => EntityType::String,
            4 => EntityType::Boolean,
            5 => EntityType::Long256,
            6 => EntityType::CachedTag,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntityValue<'a> {
    Tag(Cow<'a, str>),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Str(Cow<'a, str>),
    Long256(Cow<'a, str>),
}

impl EntityValue<'_> {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityValue::Tag(_) => EntityType::Tag,
            EntityValue::Integer(_) => EntityType::Integer,
            EntityValue::Float(_) => EntityType::Float,
            EntityValue::Boolean(_) => EntityType::Boolean,
            EntityValue::Str(_) => EntityType::String,
            EntityValue::Long256(_) => EntityType::Long256,
        }
    }
}

/// One tag or field of a parsed line.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity<'a> {
    pub name: Cow<'a, str>,
    pub value: EntityValue<'a>,
}

/// A fully parsed measurement line. Tags come before fields in `entities`,
/// matching their order on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedLine<'a> {
    pub measurement: Cow<'a, str>,
    pub entities: Vec<Entity<'a>>,
    /// Microseconds, or [`NULL_TIMESTAMP`] when the line carried none.
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct LineParser {
    pub timestamp_unit: TimestampUnit,
}

impl Default for LineParser {
    fn default() -> Self {
        Self {
            timestamp_unit: TimestampUnit::Nanos,
        }
    }
}

impl LineParser {
    pub fn new(timestamp_unit: TimestampUnit) -> Self {
        Self { timestamp_unit }
    }

    /// Parse one complete line (no trailing newline).
    pub fn parse<'a>(&self, line: &'a [u8]) -> anyhow::Result<ParsedLine<'a>> {
        let mut pos = 0usize;

        // Measurement names stop at `,` or space only; `=` is legal in them.
        let (measurement, stop) = take_until(line, &mut pos, &[b',', b' '])?;
        if measurement.is_empty() {
            bail!("empty measurement name");
        }

        let mut entities = Vec::new();

        // Tag set: `,key=value` until the first unescaped space.
        let mut stop = stop;
        while stop == Some(b',') {
            let (name, s) = take_name(line, &mut pos)?;
            if s != Some(b'=') {
                bail!("expected '=' after tag name {name:?}");
            }
            let (value, s) = take_tag_value(line, &mut pos)?;
            if name.is_empty() || value.is_empty() {
                bail!("empty tag name or value");
            }
            entities.push(Entity {
                name,
                value: EntityValue::Tag(value),
            });
            stop = s;
        }
        if stop != Some(b' ') {
            bail!("expected field set after measurement");
        }

        // Field set: `key=value` comma separated until space or end of line.
        loop {
            let (name, s) = take_name(line, &mut pos)?;
            if s != Some(b'=') {
                bail!("expected '=' after field name {name:?}");
            }
            if name.is_empty() {
                bail!("empty field name");
            }
            let (value, s) = take_field_value(line, &mut pos)?;
            entities.push(Entity { name, value });
            match s {
                Some(b',') => continue,
                Some(b' ') => break,
                None => {
                    return Ok(ParsedLine {
                        measurement,
                        entities,
                        timestamp: NULL_TIMESTAMP,
                    });
                }
                other => bail!("unexpected separator {other:?} in field set"),
            }
        }

        // Trailing timestamp.
        let raw = &line[pos..];
        let text = utf8(raw)?;
        let value: i64 = text
            .trim_end_matches('\r')
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid timestamp {text:?}"))?;
        Ok(ParsedLine {
            measurement,
            entities,
            timestamp: self.timestamp_unit.to_micros(value),
        })
    }
}

/// Find the exclusive end of the next line in `buf` starting at `from`,
/// honoring quoted field values and backslash escapes. Returns the index of
/// the terminating `\n`.
pub fn find_line_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, &b) in buf.iter().enumerate().skip(from) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b'\n' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

fn utf8(raw: &[u8]) -> anyhow::Result<&str> {
    std::str::from_utf8(raw).map_err(|_| anyhow::anyhow!("invalid UTF8 in line"))
}

fn utf8_cow(raw: Cow<'_, [u8]>) -> anyhow::Result<Cow<'_, str>> {
    match raw {
        Cow::Borrowed(b) => Ok(Cow::Borrowed(utf8(b)?)),
        Cow::Owned(v) => match String::from_utf8(v) {
            Ok(s) => Ok(Cow::Owned(s)),
            Err(_) => bail!("invalid UTF8 in line"),
        },
    }
}

/// Scan a measurement/tag/field name. Stops at an unescaped `,`, `=` or space.
fn take_name<'a>(line: &'a [u8], pos: &mut usize) -> anyhow::Result<(Cow<'a, str>, Option<u8>)> {
    take_until(line, pos, &[b',', b'=', b' '])
}

/// Scan a tag value. Stops at an unescaped `,` or space.
fn take_tag_value<'a>(
    line: &'a [u8],
    pos: &mut usize,
) -> anyhow::Result<(Cow<'a, str>, Option<u8>)> {
    take_until(line, pos, &[b',', b' '])
}

fn take_until<'a>(
    line: &'a [u8],
    pos: &mut usize,
    stops: &[u8],
) -> anyhow::Result<(Cow<'a, str>, Option<u8>)> {
    let start = *pos;
    let mut owned: Option<Vec<u8>> = None;
    let mut i = start;
    while i < line.len() {
        let b = line[i];
        if b == b'\\' && i + 1 < line.len() {
            // Unescape in a copy; untouched prefix is carried over first.
            let buf = owned.get_or_insert_with(|| line[start..i].to_vec());
            buf.push(line[i + 1]);
            i += 2;
            continue;
        }
        if stops.contains(&b) {
            *pos = i + 1;
            let raw = match owned {
                Some(v) => Cow::Owned(v),
                None => Cow::Borrowed(&line[start..i]),
            };
            return Ok((utf8_cow(raw)?, Some(b)));
        }
        if let Some(buf) = owned.as_mut() {
            buf.push(b);
        }
        i += 1;
    }
    *pos = line.len();
    let raw = match owned {
        Some(v) => Cow::Owned(v),
        None => Cow::Borrowed(&line[start..]),
    };
    Ok((utf8_cow(raw)?, None))
}

/// Parse one field value and return it with the separator that ended it.
fn take_field_value<'a>(
    line: &'a [u8],
    pos: &mut usize,
) -> anyhow::Result<(EntityValue<'a>, Option<u8>)> {
    if *pos < line.len() && line[*pos] == b'"' {
        *pos += 1;
        let s = take_quoted(line, pos)?;
        // The closing quote must be followed by a separator or end of line.
        let sep = match line.get(*pos) {
            None => None,
            Some(&b) if b == b',' || b == b' ' => {
                *pos += 1;
                Some(b)
            }
            Some(&b) => bail!("unexpected byte {b:?} after quoted string"),
        };
        return Ok((EntityValue::Str(s), sep));
    }

    let (raw, sep) = take_until(line, pos, &[b',', b' '])?;
    let text: &str = &raw;
    if text.is_empty() {
        bail!("empty field value");
    }

    let value = if let Some(num) = text.strip_suffix('i') {
        match num.parse::<i64>() {
            Ok(v) => EntityValue::Integer(v),
            Err(_) => bail!("invalid integer field {text:?}"),
        }
    } else if text == "t" || text == "T" || text == "true" || text == "True" {
        EntityValue::Boolean(true)
    } else if text == "f" || text == "F" || text == "false" || text == "False" {
        EntityValue::Boolean(false)
    } else if let Some(hex) = text.strip_prefix("0x") {
        if hex.is_empty() || hex.len() > 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("invalid long256 field {text:?}");
        }
        EntityValue::Long256(raw)
    } else {
        match text.parse::<f64>() {
            Ok(v) => EntityValue::Float(v),
            Err(_) => bail!("invalid field value {text:?}"),
        }
    };
    Ok((value, sep))
}

/// Scan a quoted string value; `pos` starts just past the opening quote and
/// ends just past the closing one.
fn take_quoted<'a>(line: &'a [u8], pos: &mut usize) -> anyhow::Result<Cow<'a, str>> {
    let start = *pos;
    let mut owned: Option<Vec<u8>> = None;
    let mut i = start;
    while i < line.len() {
        let b = line[i];
        if b == b'\\' && i + 1 < line.len() {
            let buf = owned.get_or_insert_with(|| line[start..i].to_vec());
            buf.push(line[i + 1]);
            i += 2;
            continue;
        }
        if b == b'"' {
            *pos = i + 1;
            let raw = match owned {
                Some(v) => Cow::Owned(v),
                None => Cow::Borrowed(&line[start..i]),
            };
            return utf8_cow(raw);
        }
        if let Some(buf) = owned.as_mut() {
            buf.push(b);
        }
        i += 1;
    }
    bail!("unterminated string value");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ParsedLine<'_> {
        LineParser::default().parse(line.as_bytes()).unwrap()
    }

    #[test]
    fn parses_tags_fields_and_timestamp() {
        let line = parse("weather,loc=eu temp=21.5 1000");
        assert_eq!(line.measurement, "weather");
        assert_eq!(line.entities.len(), 2);
        assert_eq!(line.entities[0].name, "loc");
        assert_eq!(
            line.entities[0].value,
            EntityValue::Tag(Cow::Borrowed("eu"))
        );
        assert_eq!(line.entities[1].name, "temp");
        assert_eq!(line.entities[1].value, EntityValue::Float(21.5));
        // 1000ns -> 1us
        assert_eq!(line.timestamp, 1);
    }

    #[test]
    fn missing_timestamp_is_the_null_sentinel() {
        let line = parse("m f=1i");
        assert_eq!(line.timestamp, NULL_TIMESTAMP);
        assert_eq!(line.entities[0].value, EntityValue::Integer(1));
    }

    #[test]
    fn field_value_forms() {
        let line = parse(r#"m i=42i,f=1.25,b=t,s="hi there",h=0xabcd 2000"#);
        let values: Vec<_> = line.entities.iter().map(|e| e.value.clone()).collect();
        assert_eq!(
            values,
            vec![
                EntityValue::Integer(42),
                EntityValue::Float(1.25),
                EntityValue::Boolean(true),
                EntityValue::Str(Cow::Borrowed("hi there")),
                EntityValue::Long256(Cow::Borrowed("0xabcd")),
            ]
        );
    }

    #[test]
    fn unescapes_names_and_tag_values() {
        let line = parse(r"cpu\,0,host\ name=a\=b v=1i");
        assert_eq!(line.measurement, "cpu,0");
        assert_eq!(line.entities[0].name, "host name");
        assert_eq!(
            line.entities[0].value,
            EntityValue::Tag(Cow::Owned("a=b".to_string()))
        );
    }

    #[test]
    fn quoted_strings_keep_separators_and_escapes() {
        let line = parse(r#"m s="a,b \"c\" d",v=2i"#);
        assert_eq!(
            line.entities[0].value,
            EntityValue::Str(Cow::Owned(r#"a,b "c" d"#.to_string()))
        );
        assert_eq!(line.entities[1].value, EntityValue::Integer(2));
    }

    #[test]
    fn rejects_malformed_lines() {
        let parser = LineParser::default();
        assert!(parser.parse(b"").is_err());
        assert!(parser.parse(b"m").is_err());
        assert!(parser.parse(b"m,tag v=").is_err());
        assert!(parser.parse(b"m v=12x").is_err());
        assert!(parser.parse(b"m s=\"unterminated").is_err());
        assert!(parser.parse(b"m v=1i junk extra").is_err());
        assert!(parser.parse(&[b'm', b' ', b'v', b'=', 0xff, 0xfe]).is_err());
    }

    #[test]
    fn line_framing_respects_quotes() {
        let buf = b"m s=\"a\nb\" 1\nnext v=1i\n";
        let end = find_line_end(buf, 0).unwrap();
        assert_eq!(&buf[..end], b"m s=\"a\nb\" 1");
        let end2 = find_line_end(buf, end + 1).unwrap();
        assert_eq!(&buf[end + 1..end2], b"next v=1i");
    }

    #[test]
    fn timestamp_units_convert_to_micros() {
        let parser = LineParser::new(TimestampUnit::Millis);
        let line = parser.parse(b"m v=1i 5").unwrap();
        assert_eq!(line.timestamp, 5_000);
        assert_eq!(TimestampUnit::Seconds.to_micros(2), 2_000_000);
        assert_eq!(TimestampUnit::Nanos.to_micros(1_500), 1);
    }
}
