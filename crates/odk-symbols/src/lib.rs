//! OCC option symbology codec.
//!
//! Wire form: variable-length alphabetic root, six expiry digits (`YYMMDD`,
//! 2000-series years), one side char (`C`/`P`), eight strike digits encoding
//! strike × 1000. Example: `QQQ260320C00600000` → QQQ 2026-03-20 call 600.0.
//!
//! Roots are constrained to `[A-Z]+`. A digit-bearing root would make the
//! leading six-digit scan ambiguous, so it is a parse error here rather than
//! a silent mis-parse.

use chrono::NaiveDate;

/// A decoded OCC option symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct OccSymbol {
    /// Underlier root, uppercase `[A-Z]+`.
    pub root: String,
    /// Expiration date (exchange close on this day).
    pub expiry: NaiveDate,
    pub is_call: bool,
    /// Strike in dollars (wire form carries strike × 1000).
    pub strike: f64,
}

/// Why a symbol failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccParseError {
    TooShort,
    EmptyRoot,
    NonAlphabeticRoot,
    BadDate,
    BadSideChar,
    BadStrike,
    TrailingGarbage,
}

impl std::fmt::Display for OccParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OccParseError::TooShort => "symbol shorter than minimum OCC length",
            OccParseError::EmptyRoot => "empty root",
            OccParseError::NonAlphabeticRoot => "root must be A-Z only",
            OccParseError::BadDate => "expiry digits do not form a date",
            OccParseError::BadSideChar => "side char must be C or P",
            OccParseError::BadStrike => "strike field must be eight digits",
            OccParseError::TrailingGarbage => "unexpected trailing characters",
        };
        f.write_str(s)
    }
}

impl std::error::Error for OccParseError {}

impl OccSymbol {
    pub fn new(root: impl Into<String>, expiry: NaiveDate, is_call: bool, strike: f64) -> Self {
        Self {
            root: root.into().to_ascii_uppercase(),
            expiry,
            is_call,
            strike,
        }
    }

    /// Encode to the normalized wire form: uppercase root, zero-padded date
    /// and strike.
    pub fn emit(&self) -> String {
        let yy = self.expiry.format("%y%m%d");
        let side = if self.is_call { 'C' } else { 'P' };
        let strike_milli = (self.strike * 1000.0).round() as i64;
        format!("{}{}{}{:08}", self.root, yy, side, strike_milli)
    }
}

/// Decode an OCC symbol.
///
/// Scans for the first run of six consecutive digits (the expiry); everything
/// before it is the root, which must be non-empty and alphabetic.
pub fn parse_occ(sym: &str) -> Result<OccSymbol, OccParseError> {
    let s = sym.trim();
    // root(>=1) + date(6) + side(1) + strike(8)
    if s.len() < 1 + 6 + 1 + 8 {
        return Err(OccParseError::TooShort);
    }

    let bytes = s.as_bytes();
    let mut date_at = None;
    for i in 0..=bytes.len().saturating_sub(6) {
        if bytes[i..i + 6].iter().all(u8::is_ascii_digit) {
            date_at = Some(i);
            break;
        }
    }
    let idx = date_at.ok_or(OccParseError::BadDate)?;
    if idx == 0 {
        return Err(OccParseError::EmptyRoot);
    }
    // Date run must leave room for side char + eight strike digits.
    if idx + 6 + 1 + 8 > s.len() {
        return Err(OccParseError::TooShort);
    }

    let root = &s[..idx];
    if !root.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(OccParseError::NonAlphabeticRoot);
    }

    let yymmdd = &s[idx..idx + 6];
    let yy: u32 = yymmdd[0..2].parse().map_err(|_| OccParseError::BadDate)?;
    let mm: u32 = yymmdd[2..4].parse().map_err(|_| OccParseError::BadDate)?;
    let dd: u32 = yymmdd[4..6].parse().map_err(|_| OccParseError::BadDate)?;
    let expiry = NaiveDate::from_ymd_opt(2000 + yy as i32, mm, dd).ok_or(OccParseError::BadDate)?;

    let side = bytes[idx + 6];
    let is_call = match side {
        b'C' => true,
        b'P' => false,
        _ => return Err(OccParseError::BadSideChar),
    };

    let strike8 = &s[idx + 7..];
    if strike8.len() != 8 {
        return Err(OccParseError::TrailingGarbage);
    }
    if !strike8.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OccParseError::BadStrike);
    }
    let strike_milli: i64 = strike8.parse().map_err(|_| OccParseError::BadStrike)?;

    Ok(OccSymbol {
        root: root.to_string(),
        expiry,
        is_call,
        strike: strike_milli as f64 / 1000.0,
    })
}

/// Best-effort root extraction without a full decode. Empty string when the
/// symbol does not carry a six-digit expiry run.
pub fn underlier_of(sym: &str) -> &str {
    let s = sym.trim();
    let bytes = s.as_bytes();
    for i in 0..bytes.len().saturating_sub(5) {
        if bytes[i..i + 6].iter().all(u8::is_ascii_digit) {
            return &s[..i];
        }
    }
    ""
}
