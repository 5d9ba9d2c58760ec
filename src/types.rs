//! PostgreSQL type OIDs, host values, and text-format codecs.
//!
//! Everything on the wire is text format. A codec turns the text form of one
//! PostgreSQL type into a host [`Value`] and back; the registry maps type OIDs
//! to codecs with an infallible text fallback for unknown OIDs.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::{Error, Result};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// The pseudo-OID of the fallback text codec.
    pub const UNKNOWN: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

// ============================================================================
// Host values
// ============================================================================

/// A host-side PostgreSQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    /// Microseconds since the Unix epoch, UTC.
    Timestamptz(i64),
    Json(serde_json::Value),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Widen any integer variant to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int2(v) => Some(*v as i64),
            Value::Int4(v) => Some(*v as i64),
            Value::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float4(v) => Some(*v as f64),
            Value::Float8(v) => Some(*v),
            Value::Int2(v) => Some(*v as f64),
            Value::Int4(v) => Some(*v as f64),
            Value::Int8(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytea(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int2(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int4(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int8(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float4(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float8(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytea(v)
    }
}
impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytea(v.to_vec())
    }
}
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

// ============================================================================
// Codecs
// ============================================================================

/// Text-format codec for one PostgreSQL type.
///
/// `parse` reads the server's text representation; `format` renders a host
/// value for a `Bind` parameter. Null never reaches a codec.
pub trait Codec: Send + Sync {
    fn parse(&self, text: &str) -> Result<Value>;
    fn format(&self, value: &Value) -> Result<String>;
}

fn type_err(msg: impl Into<String>) -> Error {
    Error::Type(msg.into())
}

/// Fallback codec: identity parse, best-effort format.
struct TextCodec;

impl Codec for TextCodec {
    fn parse(&self, text: &str) -> Result<Value> {
        Ok(Value::Text(text.to_string()))
    }

    fn format(&self, value: &Value) -> Result<String> {
        Ok(match value {
            // Null is stripped before codec dispatch.
            Value::Null => return Err(type_err("null has no text form")),
            Value::Bool(b) => if *b { "t" } else { "f" }.to_string(),
            Value::Int2(v) => v.to_string(),
            Value::Int4(v) => v.to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Float4(v) => format_float(*v as f64),
            Value::Float8(v) => format_float(*v),
            Value::Text(s) => s.clone(),
            Value::Bytea(b) => format_hex(b),
            Value::Timestamptz(us) => format_timestamptz(*us),
            Value::Json(j) => j.to_string(),
        })
    }
}

struct BoolCodec;

impl Codec for BoolCodec {
    fn parse(&self, text: &str) -> Result<Value> {
        match text {
            "t" => Ok(Value::Bool(true)),
            "f" => Ok(Value::Bool(false)),
            other => Err(type_err(format!("invalid bool text {other:?}"))),
        }
    }

    fn format(&self, value: &Value) -> Result<String> {
        let b = match value {
            Value::Bool(b) => *b,
            Value::Int2(v) => *v != 0,
            Value::Int4(v) => *v != 0,
            Value::Int8(v) => *v != 0,
            Value::Text(s) => match s.as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" => true,
                "f" | "false" | "n" | "no" | "off" | "0" => false,
                other => return Err(type_err(format!("cannot coerce {other:?} to bool"))),
            },
            other => return Err(type_err(format!("cannot coerce {other:?} to bool"))),
        };
        Ok(if b { "t" } else { "f" }.to_string())
    }
}

/// Integer codec parameterized by the declared range.
struct IntCodec {
    min: i64,
    max: i64,
    width: IntWidth,
}

enum IntWidth {
    Two,
    Four,
    Eight,
}

impl IntCodec {
    fn coerce(&self, value: &Value) -> Result<i64> {
        let n = match value {
            Value::Int2(v) => *v as i64,
            Value::Int4(v) => *v as i64,
            Value::Int8(v) => *v,
            Value::Float4(v) => coerce_integral(*v as f64)?,
            Value::Float8(v) => coerce_integral(*v)?,
            Value::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| type_err(format!("cannot coerce {s:?} to integer")))?,
            Value::Bool(b) => *b as i64,
            other => return Err(type_err(format!("cannot coerce {other:?} to integer"))),
        };
        if n < self.min || n > self.max {
            return Err(type_err(format!(
                "integer {n} out of range [{}, {}]",
                self.min, self.max
            )));
        }
        Ok(n)
    }
}

fn coerce_integral(v: f64) -> Result<i64> {
    if v.fract() != 0.0 || !v.is_finite() {
        return Err(type_err(format!("cannot coerce {v} to integer")));
    }
    Ok(v as i64)
}

impl Codec for IntCodec {
    fn parse(&self, text: &str) -> Result<Value> {
        let n = text
            .parse::<i64>()
            .map_err(|_| type_err(format!("invalid integer text {text:?}")))?;
        Ok(match self.width {
            IntWidth::Two => Value::Int2(n as i16),
            IntWidth::Four => Value::Int4(n as i32),
            IntWidth::Eight => Value::Int8(n),
        })
    }

    fn format(&self, value: &Value) -> Result<String> {
        Ok(self.coerce(value)?.to_string())
    }
}

struct FloatCodec {
    single: bool,
}

impl Codec for FloatCodec {
    fn parse(&self, text: &str) -> Result<Value> {
        let v = parse_float(text)?;
        Ok(if self.single {
            Value::Float4(v as f32)
        } else {
            Value::Float8(v)
        })
    }

    fn format(&self, value: &Value) -> Result<String> {
        let v = value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| parse_float(s).ok()))
            .ok_or_else(|| type_err(format!("cannot coerce {value:?} to float")))?;
        Ok(format_float(v))
    }
}

fn parse_float(text: &str) -> Result<f64> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        other => other
            .parse::<f64>()
            .map_err(|_| type_err(format!("invalid float text {other:?}"))),
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}

/// Bytea in the `\x` hex form (the startup parameters force
/// `bytea_output=hex`).
struct ByteaCodec;

impl Codec for ByteaCodec {
    fn parse(&self, text: &str) -> Result<Value> {
        let hex = text
            .strip_prefix("\\x")
            .ok_or_else(|| type_err(format!("invalid bytea text {text:?}")))?;
        if hex.len() % 2 != 0 {
            return Err(type_err("odd-length bytea hex string"));
        }
        let mut out = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            let byte = u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| type_err(format!("invalid bytea hex digits {:?}", &hex[i..i + 2])))?;
            out.push(byte);
        }
        Ok(Value::Bytea(out))
    }

    fn format(&self, value: &Value) -> Result<String> {
        let bytes = value
            .as_bytes()
            .ok_or_else(|| type_err(format!("cannot coerce {value:?} to bytea")))?;
        Ok(format_hex(bytes))
    }
}

fn format_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

struct JsonCodec;

impl Codec for JsonCodec {
    fn parse(&self, text: &str) -> Result<Value> {
        serde_json::from_str(text)
            .map(Value::Json)
            .map_err(|e| type_err(format!("invalid json text: {e}")))
    }

    fn format(&self, value: &Value) -> Result<String> {
        match value {
            Value::Json(j) => Ok(j.to_string()),
            Value::Text(s) => {
                // Validate client-side so malformed payloads fail as type
                // errors rather than server errors.
                serde_json::from_str::<serde_json::Value>(s)
                    .map_err(|e| type_err(format!("invalid json text: {e}")))?;
                Ok(s.clone())
            }
            other => Err(type_err(format!("cannot coerce {other:?} to json"))),
        }
    }
}

/// Timestamptz in the ISO DateStyle the startup parameters force, stored as
/// microseconds since the Unix epoch.
struct TimestamptzCodec;

impl Codec for TimestamptzCodec {
    fn parse(&self, text: &str) -> Result<Value> {
        parse_timestamptz(text).map(Value::Timestamptz)
    }

    fn format(&self, value: &Value) -> Result<String> {
        match value {
            Value::Timestamptz(us) => Ok(format_timestamptz(*us)),
            Value::Int8(us) => Ok(format_timestamptz(*us)),
            // Pass literal text through; the server parses it.
            Value::Text(s) => Ok(s.clone()),
            other => Err(type_err(format!("cannot coerce {other:?} to timestamptz"))),
        }
    }
}

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = (mp + 2) % 12 + 1;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Parse `YYYY-MM-DD[ T]HH:MM:SS[.ffffff][+HH[:MM[:SS]]]` into epoch
/// microseconds. The trailing offset defaults to UTC when absent.
fn parse_timestamptz(text: &str) -> Result<i64> {
    let bad = || type_err(format!("invalid timestamptz text {text:?}"));
    let bytes = text.as_bytes();
    if bytes.len() < 19 {
        return Err(bad());
    }

    let num = |s: &str| s.parse::<i64>().map_err(|_| bad());
    let year = num(text.get(0..4).ok_or_else(bad)?)?;
    let month = num(text.get(5..7).ok_or_else(bad)?)?;
    let day = num(text.get(8..10).ok_or_else(bad)?)?;
    let hour = num(text.get(11..13).ok_or_else(bad)?)?;
    let minute = num(text.get(14..16).ok_or_else(bad)?)?;
    let second = num(text.get(17..19).ok_or_else(bad)?)?;

    let mut micros = 0i64;
    let mut rest = text.get(19..).ok_or_else(bad)?;
    if let Some(frac) = rest.strip_prefix('.') {
        let end = frac
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(frac.len());
        let digits = &frac[..end];
        if digits.is_empty() || digits.len() > 6 {
            return Err(bad());
        }
        micros = num(digits)? * 10i64.pow(6 - digits.len() as u32);
        rest = &frac[end..];
    }

    let mut offset_secs = 0i64;
    if !rest.is_empty() {
        let sign = match rest.as_bytes()[0] {
            b'+' => 1,
            b'-' => -1,
            _ => return Err(bad()),
        };
        let mut parts = rest[1..].split(':');
        let hh = num(parts.next().ok_or_else(bad)?)?;
        let mm = parts.next().map(num).transpose()?.unwrap_or(0);
        let ss = parts.next().map(num).transpose()?.unwrap_or(0);
        offset_secs = sign * (hh * 3600 + mm * 60 + ss);
    }

    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hour * 3600 + minute * 60 + second - offset_secs;
    Ok(secs * 1_000_000 + micros)
}

fn format_timestamptz(us: i64) -> String {
    let days = us.div_euclid(MICROS_PER_DAY);
    let rem = us.rem_euclid(MICROS_PER_DAY);
    let (y, m, d) = civil_from_days(days);
    let secs = rem / 1_000_000;
    let micros = rem % 1_000_000;
    let (hh, mm, ss) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if micros == 0 {
        format!("{y:04}-{m:02}-{d:02} {hh:02}:{mm:02}:{ss:02}+00")
    } else {
        format!("{y:04}-{m:02}-{d:02} {hh:02}:{mm:02}:{ss:02}.{micros:06}+00")
    }
}

// ============================================================================
// Registry
// ============================================================================

/// OID-indexed codec registry. Lookups never fail: unknown OIDs fall back to
/// the text codec.
#[derive(Clone)]
pub struct Codecs {
    by_oid: HashMap<Oid, Arc<dyn Codec>>,
    fallback: Arc<dyn Codec>,
}

impl Codecs {
    /// Registry with the built-in codecs.
    pub fn builtin() -> Self {
        let mut by_oid: HashMap<Oid, Arc<dyn Codec>> = HashMap::new();
        by_oid.insert(Oid::BOOL, Arc::new(BoolCodec));
        by_oid.insert(
            Oid::INT2,
            Arc::new(IntCodec {
                min: i16::MIN as i64,
                max: i16::MAX as i64,
                width: IntWidth::Two,
            }),
        );
        by_oid.insert(
            Oid::INT4,
            Arc::new(IntCodec {
                min: i32::MIN as i64,
                max: i32::MAX as i64,
                width: IntWidth::Four,
            }),
        );
        by_oid.insert(
            Oid::INT8,
            Arc::new(IntCodec {
                min: i64::MIN,
                max: i64::MAX,
                width: IntWidth::Eight,
            }),
        );
        by_oid.insert(Oid::FLOAT4, Arc::new(FloatCodec { single: true }));
        by_oid.insert(Oid::FLOAT8, Arc::new(FloatCodec { single: false }));
        by_oid.insert(Oid::BYTEA, Arc::new(ByteaCodec));
        by_oid.insert(Oid::TIMESTAMPTZ, Arc::new(TimestamptzCodec));
        by_oid.insert(Oid::JSON, Arc::new(JsonCodec));
        by_oid.insert(Oid::JSONB, Arc::new(JsonCodec));
        Self {
            by_oid,
            fallback: Arc::new(TextCodec),
        }
    }

    /// Register or replace the codec for an OID.
    pub fn register(&mut self, oid: Oid, codec: Arc<dyn Codec>) {
        self.by_oid.insert(oid, codec);
    }

    /// The codec for an OID, or the text fallback.
    pub fn lookup(&self, oid: Oid) -> &Arc<dyn Codec> {
        self.by_oid.get(&oid).unwrap_or(&self.fallback)
    }

    /// Parse the text form of a column value.
    pub fn parse(&self, oid: Oid, text: &str) -> Result<Value> {
        self.lookup(oid).parse(text)
    }

    /// Render a bind parameter; `Null` becomes `None`.
    pub fn format(&self, oid: Oid, value: &Value) -> Result<Option<String>> {
        if value.is_null() {
            return Ok(None);
        }
        self.lookup(oid).format(value).map(Some)
    }
}

impl Default for Codecs {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for Codecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codecs")
            .field("registered", &self.by_oid.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codecs() -> Codecs {
        Codecs::builtin()
    }

    #[test]
    fn bool_round_trip_and_coercion() {
        let c = codecs();
        assert_eq!(c.parse(Oid::BOOL, "t").unwrap(), Value::Bool(true));
        assert_eq!(c.parse(Oid::BOOL, "f").unwrap(), Value::Bool(false));
        assert_eq!(
            c.format(Oid::BOOL, &Value::Bool(true)).unwrap(),
            Some("t".to_string())
        );
        assert_eq!(
            c.format(Oid::BOOL, &Value::Text("n".to_string())).unwrap(),
            Some("f".to_string())
        );
        assert!(c.format(Oid::BOOL, &Value::Text("maybe".into())).is_err());
    }

    #[test]
    fn int_range_checks() {
        let c = codecs();
        assert_eq!(
            c.format(Oid::INT2, &Value::Int4(256)).unwrap(),
            Some("256".to_string())
        );
        let err = c.format(Oid::INT2, &Value::Int4(100_000)).unwrap_err();
        assert!(matches!(err, Error::Type(_)));

        assert_eq!(c.parse(Oid::INT2, "256").unwrap(), Value::Int2(256));
        assert_eq!(c.parse(Oid::INT8, "1234").unwrap(), Value::Int8(1234));
    }

    #[test]
    fn int_text_coercion() {
        let c = codecs();
        assert_eq!(
            c.format(Oid::INT8, &Value::Text("1234".into())).unwrap(),
            Some("1234".to_string())
        );
        assert!(c.format(Oid::INT4, &Value::Text("abc".into())).is_err());
    }

    #[test]
    fn float_special_values() {
        let c = codecs();
        assert_eq!(
            c.format(Oid::FLOAT8, &Value::Float8(f64::INFINITY))
                .unwrap(),
            Some("Infinity".to_string())
        );
        match c.parse(Oid::FLOAT8, "NaN").unwrap() {
            Value::Float8(v) => assert!(v.is_nan()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            c.parse(Oid::FLOAT8, "1.5").unwrap(),
            Value::Float8(1.5)
        );
    }

    #[test]
    fn bytea_hex_round_trip() {
        let c = codecs();
        let data = vec![0xde, 0xad, 0xbe, 0xef];
        let text = c
            .format(Oid::BYTEA, &Value::Bytea(data.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(text, "\\xdeadbeef");
        assert_eq!(c.parse(Oid::BYTEA, &text).unwrap(), Value::Bytea(data));

        // Strings format as their UTF-8 bytes.
        assert_eq!(
            c.format(Oid::BYTEA, &Value::Text("hi".into()))
                .unwrap()
                .unwrap(),
            "\\x6869"
        );
        assert!(c.parse(Oid::BYTEA, "deadbeef").is_err());
    }

    #[test]
    fn timestamptz_round_trip() {
        let c = codecs();
        // 2000-01-01 00:00:00 UTC = 946684800s after the epoch.
        let us = 946_684_800_000_000i64;
        let text = c
            .format(Oid::TIMESTAMPTZ, &Value::Timestamptz(us))
            .unwrap()
            .unwrap();
        assert_eq!(text, "2000-01-01 00:00:00+00");
        assert_eq!(
            c.parse(Oid::TIMESTAMPTZ, &text).unwrap(),
            Value::Timestamptz(us)
        );

        // Fractional seconds and non-UTC offsets.
        assert_eq!(
            c.parse(Oid::TIMESTAMPTZ, "2000-01-01 02:00:00.000001+02")
                .unwrap(),
            Value::Timestamptz(us + 1)
        );
        assert_eq!(
            c.parse(Oid::TIMESTAMPTZ, "1969-12-31 23:59:59+00").unwrap(),
            Value::Timestamptz(-1_000_000)
        );
    }

    #[test]
    fn json_round_trip() {
        let c = codecs();
        let v = serde_json::json!({"a": [1, 2, 3]});
        let text = c
            .format(Oid::JSONB, &Value::Json(v.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(c.parse(Oid::JSONB, &text).unwrap(), Value::Json(v));
        assert!(c.format(Oid::JSON, &Value::Text("{nope".into())).is_err());
    }

    #[test]
    fn unknown_oid_falls_back_to_text() {
        let c = codecs();
        assert_eq!(
            c.parse(Oid(99999), "anything").unwrap(),
            Value::Text("anything".to_string())
        );
        assert_eq!(
            c.format(Oid(99999), &Value::Int4(7)).unwrap(),
            Some("7".to_string())
        );
    }

    #[test]
    fn null_formats_as_none() {
        let c = codecs();
        assert_eq!(c.format(Oid::INT4, &Value::Null).unwrap(), None);
    }
}
