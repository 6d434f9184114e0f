//! Deterministic canonical encoding of JSON values and content ids.
//!
//! Output is compact JSON with object keys sorted by the byte order of their
//! UTF-8 encoding, arrays in their original order, and the minimal string
//! escaping of `serde_json`. Two values that are equal under a profile always
//! encode to the same bytes, so their CIDs match.
//!
//! Profiles:
//! - `null_strip` drops object members whose value is `null` (array slots are
//!   positional and keep their nulls).
//! - `num_norm` writes floats with a zero fraction as integers when they are
//!   below 2^53 in magnitude, and folds `-0.0` into `0`.

use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{PlatformError, Result};

/// Nesting limit for arrays and objects.
pub const MAX_DEPTH: usize = 128;

/// String values that are rejected outright; they are the usual textual
/// stand-ins for non-finite floats.
const DISALLOWED_MARKERS: [&str; 3] = ["NaN", "Infinity", "-Infinity"];

/// 2^53: the largest magnitude at which every integer is exactly representable.
const MAX_SAFE_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonProfile {
    #[serde(default)]
    pub null_strip: bool,
    #[serde(default)]
    pub num_norm: bool,
}

impl CanonProfile {
    /// No transforms: only ordering and whitespace are canonicalized.
    pub const RAW: CanonProfile = CanonProfile {
        null_strip: false,
        num_norm: false,
    };

    /// Both transforms; used for plan payloads.
    pub const PLAN: CanonProfile = CanonProfile {
        null_strip: true,
        num_norm: true,
    };
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode `value` into its canonical byte form under `profile`.
pub fn canonicalize(value: &Value, profile: CanonProfile) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    write_value(&mut out, value, profile, 0)?;
    Ok(out)
}

/// Parse JSON text and canonicalize it. Malformed text (including lone
/// surrogate escapes and non-finite literals) is a canonicalization error.
pub fn canonicalize_str(text: &str, profile: CanonProfile) -> Result<Vec<u8>> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| PlatformError::Canonical(e.to_string()))?;
    canonicalize(&value, profile)
}

/// Canonicalize any serializable value.
pub fn canonicalize_ser<T: Serialize>(value: &T, profile: CanonProfile) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| PlatformError::Canonical(e.to_string()))?;
    canonicalize(&value, profile)
}

/// Apply `profile` and return the resulting value, so callers can keep the
/// normalized form (e.g. a plan payload) instead of only its bytes.
pub fn normalize(value: &Value, profile: CanonProfile) -> Result<Value> {
    let bytes = canonicalize(value, profile)?;
    serde_json::from_slice(&bytes).map_err(|e| PlatformError::Canonical(e.to_string()))
}

/// Lowercase hex BLAKE3 digest of `bytes`.
pub fn hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Content id of `value` under `profile`.
pub fn cid(value: &Value, profile: CanonProfile) -> Result<String> {
    Ok(hash_hex(&canonicalize(value, profile)?))
}

/// Content id of a serializable value under the raw profile.
pub fn cid_of<T: Serialize>(value: &T) -> Result<String> {
    Ok(hash_hex(&canonicalize_ser(value, CanonProfile::RAW)?))
}

fn write_value(out: &mut Vec<u8>, value: &Value, profile: CanonProfile, depth: usize) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(out, n, profile)?,
        Value::String(s) => {
            if DISALLOWED_MARKERS.contains(&s.as_str()) {
                return Err(PlatformError::Canonical(format!(
                    "disallowed string marker '{s}'"
                )));
            }
            write_string(out, s)?;
        }
        Value::Array(items) => {
            check_depth(depth)?;
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item, profile, depth + 1)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            check_depth(depth)?;
            let mut entries: Vec<(&String, &Value)> = map
                .iter()
                .filter(|(_, v)| !(profile.null_strip && v.is_null()))
                .collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, k)?;
                out.push(b':');
                write_value(out, v, profile, depth + 1)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn check_depth(depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(PlatformError::Canonical(format!(
            "nesting exceeds {MAX_DEPTH} levels"
        )));
    }
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    serde_json::to_writer(&mut *out, s).map_err(|e| PlatformError::Canonical(e.to_string()))
}

fn write_number(out: &mut Vec<u8>, n: &Number, profile: CanonProfile) -> Result<()> {
    if n.is_i64() || n.is_u64() {
        write!(out, "{n}").map_err(|e| PlatformError::Canonical(e.to_string()))?;
        return Ok(());
    }
    let f = n
        .as_f64()
        .ok_or_else(|| PlatformError::Canonical(format!("unrepresentable number {n}")))?;
    if !f.is_finite() {
        return Err(PlatformError::Canonical("non-finite number".into()));
    }
    if profile.num_norm {
        if f == 0.0 {
            out.push(b'0');
            return Ok(());
        }
        if f.fract() == 0.0 && f.abs() < MAX_SAFE_FLOAT_INT {
            write!(out, "{}", f as i64).map_err(|e| PlatformError::Canonical(e.to_string()))?;
            return Ok(());
        }
    }
    serde_json::to_writer(&mut *out, n).map_err(|e| PlatformError::Canonical(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
