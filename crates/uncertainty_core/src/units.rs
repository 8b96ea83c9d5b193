//! Physical units as dimension vectors plus a scale relative to SI base units.
//!
//! The engine only needs the narrow `to_base`/`from_base` contract of
//! [`UnitTag`] and a way to turn symbols into tags ([`UnitSystem`]). The
//! bundled [`SiUnits`] registry understands prefixed SI symbols combined
//! with `*`, `·`, `/`, spaces and integer exponents (`m^2`, `m2`, `m²`).

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exponents of the seven SI base quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimension {
    pub mass: i8,
    pub length: i8,
    pub time: i8,
    pub current: i8,
    pub temperature: i8,
    pub amount: i8,
    pub luminosity: i8,
}

impl Dimension {
    pub const DIMENSIONLESS: Self = Self::new(0, 0, 0, 0, 0, 0, 0);
    pub const MASS: Self = Self::new(1, 0, 0, 0, 0, 0, 0);
    pub const LENGTH: Self = Self::new(0, 1, 0, 0, 0, 0, 0);
    pub const TIME: Self = Self::new(0, 0, 1, 0, 0, 0, 0);
    pub const CURRENT: Self = Self::new(0, 0, 0, 1, 0, 0, 0);
    pub const TEMPERATURE: Self = Self::new(0, 0, 0, 0, 1, 0, 0);
    pub const AMOUNT: Self = Self::new(0, 0, 0, 0, 0, 1, 0);
    pub const LUMINOSITY: Self = Self::new(0, 0, 0, 0, 0, 0, 1);

    pub const fn new(
        mass: i8,
        length: i8,
        time: i8,
        current: i8,
        temperature: i8,
        amount: i8,
        luminosity: i8,
    ) -> Self {
        Self {
            mass,
            length,
            time,
            current,
            temperature,
            amount,
            luminosity,
        }
    }

    fn exponents(&self) -> [i8; 7] {
        [
            self.mass,
            self.length,
            self.time,
            self.current,
            self.temperature,
            self.amount,
            self.luminosity,
        ]
    }

    fn from_exponents(e: [i8; 7]) -> Self {
        Self::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6])
    }

    fn combine(a: [i8; 7], f: impl Fn(usize) -> Option<i8>) -> Option<Dimension> {
        let mut out = a;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = f(i)?;
        }
        Some(Self::from_exponents(out))
    }

    /// Adds exponents, as when multiplying quantities. `None` on `i8` overflow.
    pub fn mul(&self, other: &Dimension) -> Option<Dimension> {
        let (a, b) = (self.exponents(), other.exponents());
        Self::combine(a, |i| a[i].checked_add(b[i]))
    }

    /// Subtracts exponents, as when dividing quantities. `None` on `i8` overflow.
    pub fn div(&self, other: &Dimension) -> Option<Dimension> {
        let (a, b) = (self.exponents(), other.exponents());
        Self::combine(a, |i| a[i].checked_sub(b[i]))
    }

    pub fn pow(&self, n: i8) -> Option<Dimension> {
        let a = self.exponents();
        Self::combine(a, |i| a[i].checked_mul(n))
    }

    pub fn is_dimensionless(&self) -> bool {
        *self == Self::DIMENSIONLESS
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SYMBOLS: [&str; 7] = ["M", "L", "T", "I", "Θ", "N", "J"];
        if self.is_dimensionless() {
            return write!(f, "[1]");
        }
        let parts: Vec<String> = self
            .exponents()
            .iter()
            .zip(SYMBOLS)
            .filter(|(e, _)| **e != 0)
            .map(|(e, s)| if *e == 1 { s.to_string() } else { format!("{s}^{e}") })
            .collect();
        write!(f, "[{}]", parts.join(" "))
    }
}

/// A unit: dimension plus the factor that takes a value in this unit to SI base units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitTag {
    pub dimension: Dimension,
    pub scale: f64,
}

impl UnitTag {
    pub const DIMENSIONLESS: Self = Self::new(Dimension::DIMENSIONLESS, 1.0);

    pub const fn new(dimension: Dimension, scale: f64) -> Self {
        Self { dimension, scale }
    }

    /// Expresses `value` (in this unit) in SI base units.
    pub fn to_base(&self, value: f64) -> (f64, Dimension) {
        (value * self.scale, self.dimension)
    }

    /// Expresses a base-unit value in this unit.
    pub fn from_base(&self, value_in_base: f64, dimension: Dimension) -> Result<f64, ConfigurationError> {
        if dimension != self.dimension {
            return Err(ConfigurationError::IncompatibleUnits {
                from: dimension.to_string(),
                to: self.dimension.to_string(),
            });
        }
        Ok(value_in_base / self.scale)
    }

    pub fn is_compatible(&self, other: &UnitTag) -> bool {
        self.dimension == other.dimension
    }

    pub fn mul(&self, other: &UnitTag) -> Option<UnitTag> {
        Some(UnitTag::new(self.dimension.mul(&other.dimension)?, self.scale * other.scale))
    }

    pub fn div(&self, other: &UnitTag) -> Option<UnitTag> {
        Some(UnitTag::new(self.dimension.div(&other.dimension)?, self.scale / other.scale))
    }

    pub fn powi(&self, n: i8) -> Option<UnitTag> {
        Some(UnitTag::new(self.dimension.pow(n)?, self.scale.powi(n as i32)))
    }
}

/// Converts `value` between two units of the same dimension.
pub fn convert(value: f64, from: &UnitTag, to: &UnitTag) -> Result<f64, ConfigurationError> {
    let (base, dimension) = from.to_base(value);
    to.from_base(base, dimension)
}

/// A [`UnitTag`] together with the symbol it was parsed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub symbol: String,
    pub tag: UnitTag,
}

impl Unit {
    pub fn dimensionless() -> Self {
        Self {
            symbol: String::new(),
            tag: UnitTag::DIMENSIONLESS,
        }
    }

    /// Factor that multiplies a value in `self` to give the value in `target`.
    pub fn factor_to(&self, target: &Unit) -> Result<f64, ConfigurationError> {
        if !self.tag.is_compatible(&target.tag) {
            return Err(ConfigurationError::IncompatibleUnits {
                from: self.display_symbol().to_string(),
                to: target.display_symbol().to_string(),
            });
        }
        Ok(self.tag.scale / target.tag.scale)
    }

    pub fn display_symbol(&self) -> &str {
        if self.symbol.is_empty() {
            "1"
        } else {
            &self.symbol
        }
    }
}

/// Symbol to unit resolution.
pub trait UnitSystem: Send + Sync {
    fn parse(&self, symbol: &str) -> Result<UnitTag, ConfigurationError>;

    fn unit(&self, symbol: &str) -> Result<Unit, ConfigurationError> {
        Ok(Unit {
            symbol: symbol.trim().to_string(),
            tag: self.parse(symbol)?,
        })
    }
}

/// Built-in SI unit registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SiUnits;

struct Entry {
    symbol: &'static str,
    dimension: Dimension,
    scale: f64,
    prefixable: bool,
}

const fn entry(symbol: &'static str, dimension: Dimension, scale: f64, prefixable: bool) -> Entry {
    Entry {
        symbol,
        dimension,
        scale,
        prefixable,
    }
}

const UNITS: &[Entry] = &[
    entry("m", Dimension::LENGTH, 1.0, true),
    entry("g", Dimension::MASS, 1e-3, true),
    entry("s", Dimension::TIME, 1.0, true),
    entry("A", Dimension::CURRENT, 1.0, true),
    entry("K", Dimension::TEMPERATURE, 1.0, true),
    entry("mol", Dimension::AMOUNT, 1.0, true),
    entry("cd", Dimension::LUMINOSITY, 1.0, true),
    entry("Hz", Dimension::new(0, 0, -1, 0, 0, 0, 0), 1.0, true),
    entry("N", Dimension::new(1, 1, -2, 0, 0, 0, 0), 1.0, true),
    entry("Pa", Dimension::new(1, -1, -2, 0, 0, 0, 0), 1.0, true),
    entry("J", Dimension::new(1, 2, -2, 0, 0, 0, 0), 1.0, true),
    entry("W", Dimension::new(1, 2, -3, 0, 0, 0, 0), 1.0, true),
    entry("C", Dimension::new(0, 0, 1, 1, 0, 0, 0), 1.0, true),
    entry("V", Dimension::new(1, 2, -3, -1, 0, 0, 0), 1.0, true),
    entry("F", Dimension::new(-1, -2, 4, 2, 0, 0, 0), 1.0, true),
    entry("ohm", Dimension::new(1, 2, -3, -2, 0, 0, 0), 1.0, true),
    entry("Ω", Dimension::new(1, 2, -3, -2, 0, 0, 0), 1.0, true),
    entry("S", Dimension::new(-1, -2, 3, 2, 0, 0, 0), 1.0, true),
    entry("Wb", Dimension::new(1, 2, -2, -1, 0, 0, 0), 1.0, true),
    entry("T", Dimension::new(1, 0, -2, -1, 0, 0, 0), 1.0, true),
    entry("H", Dimension::new(1, 2, -2, -2, 0, 0, 0), 1.0, true),
    entry("L", Dimension::new(0, 3, 0, 0, 0, 0, 0), 1e-3, true),
    entry("min", Dimension::TIME, 60.0, false),
    entry("h", Dimension::TIME, 3600.0, false),
    entry("rad", Dimension::DIMENSIONLESS, 1.0, true),
    entry("sr", Dimension::DIMENSIONLESS, 1.0, false),
    entry("deg", Dimension::DIMENSIONLESS, 0.017453292519943295, false),
    entry("%", Dimension::DIMENSIONLESS, 1e-2, false),
    entry("ppm", Dimension::DIMENSIONLESS, 1e-6, false),
    entry("1", Dimension::DIMENSIONLESS, 1.0, false),
];

// Longer symbols first so "da" wins over "d".
const PREFIXES: &[(&str, f64)] = &[
    ("da", 1e1),
    ("Q", 1e30),
    ("R", 1e27),
    ("Y", 1e24),
    ("Z", 1e21),
    ("E", 1e18),
    ("P", 1e15),
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("h", 1e2),
    ("d", 1e-1),
    ("c", 1e-2),
    ("m", 1e-3),
    ("u", 1e-6),
    ("µ", 1e-6),
    ("μ", 1e-6),
    ("n", 1e-9),
    ("p", 1e-12),
    ("f", 1e-15),
    ("a", 1e-18),
    ("z", 1e-21),
    ("y", 1e-24),
    ("r", 1e-27),
    ("q", 1e-30),
];

impl SiUnits {
    fn lookup(symbol: &str) -> Option<UnitTag> {
        if let Some(e) = UNITS.iter().find(|e| e.symbol == symbol) {
            return Some(UnitTag::new(e.dimension, e.scale));
        }
        PREFIXES.iter().find_map(|(prefix, factor)| {
            let rest = symbol.strip_prefix(prefix)?;
            UNITS
                .iter()
                .find(|e| e.prefixable && e.symbol == rest)
                .map(|e| UnitTag::new(e.dimension, e.scale * factor))
        })
    }

    fn parse_factor(factor: &str, whole: &str) -> Result<UnitTag, ConfigurationError> {
        let unknown = || ConfigurationError::UnknownUnit(whole.to_string());
        let (base, exponent) = split_exponent(factor).ok_or_else(unknown)?;
        let tag = Self::lookup(base).ok_or_else(unknown)?;
        tag.powi(exponent).ok_or_else(unknown)
    }
}

/// Splits `m^2`, `m2`, `m²`, `s^-1` into symbol and exponent.
fn split_exponent(factor: &str) -> Option<(&str, i8)> {
    if let Some((base, exp)) = factor.split_once('^') {
        return Some((base, exp.trim().parse().ok()?));
    }
    if let Some(base) = factor.strip_suffix('²') {
        return Some((base, 2));
    }
    if let Some(base) = factor.strip_suffix('³') {
        return Some((base, 3));
    }
    // "1" on its own is the dimensionless unit, not an exponent.
    let digits = factor
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);
    match digits {
        Some(0) | None => Some((factor, 1)),
        Some(i) => Some((&factor[..i], factor[i..].parse().ok()?)),
    }
}

impl UnitSystem for SiUnits {
    fn parse(&self, symbol: &str) -> Result<UnitTag, ConfigurationError> {
        let trimmed = symbol.trim();
        if trimmed.is_empty() {
            return Ok(UnitTag::DIMENSIONLESS);
        }

        let mut tag = UnitTag::DIMENSIONLESS;
        let mut divide = false;
        let mut factor = String::new();
        let flush = |factor: &mut String, divide: bool, tag: &mut UnitTag| {
            let parsed = Self::parse_factor(factor, trimmed)?;
            let combined = if divide { tag.div(&parsed) } else { tag.mul(&parsed) };
            *tag = combined.ok_or_else(|| ConfigurationError::UnknownUnit(trimmed.to_string()))?;
            factor.clear();
            Ok::<(), ConfigurationError>(())
        };

        for c in trimmed.chars() {
            match c {
                '*' | '·' | ' ' => {
                    if !factor.is_empty() {
                        flush(&mut factor, divide, &mut tag)?;
                        divide = false;
                    }
                }
                '/' => {
                    if !factor.is_empty() {
                        flush(&mut factor, divide, &mut tag)?;
                    }
                    divide = true;
                }
                '(' | ')' => return Err(ConfigurationError::UnknownUnit(trimmed.to_string())),
                _ => factor.push(c),
            }
        }
        if factor.is_empty() && divide {
            return Err(ConfigurationError::UnknownUnit(trimmed.to_string()));
        }
        if !factor.is_empty() {
            flush(&mut factor, divide, &mut tag)?;
        }
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_err_contains<T: std::fmt::Debug>(
        result: Result<T, ConfigurationError>,
        needle: &str,
    ) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn rel_close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs())
    }

    #[test]
    fn parses_prefixed_base_units() {
        let mm = SiUnits.parse("mm").expect("mm should parse");
        assert_eq!(mm.dimension, Dimension::LENGTH);
        assert!(rel_close(mm.scale, 1e-3));

        let kg = SiUnits.parse("kg").expect("kg should parse");
        assert_eq!(kg.dimension, Dimension::MASS);
        assert!(rel_close(kg.scale, 1.0));

        for micro in ["uH", "µH", "μH"] {
            let tag = SiUnits.parse(micro).expect("micro henry should parse");
            assert!(rel_close(tag.scale, 1e-6));
        }
    }

    #[test]
    fn exact_symbols_win_over_prefix_splits() {
        let minute = SiUnits.parse("min").expect("min should parse");
        assert_eq!(minute.dimension, Dimension::TIME);
        assert!(rel_close(minute.scale, 60.0));

        let mol = SiUnits.parse("mmol").expect("mmol should parse");
        assert_eq!(mol.dimension, Dimension::AMOUNT);
        assert!(rel_close(mol.scale, 1e-3));

        let hpa = SiUnits.parse("hPa").expect("hPa should parse");
        assert!(rel_close(hpa.scale, 100.0));
    }

    #[test]
    fn composes_products_quotients_and_powers() {
        let permeability = SiUnits.parse("H/m").expect("H/m should parse");
        assert_eq!(permeability.dimension, Dimension::new(1, 1, -2, -2, 0, 0, 0));

        let force = SiUnits.parse("kg*m/s^2").expect("kg*m/s^2 should parse");
        let newton = SiUnits.parse("N").expect("N should parse");
        assert_eq!(force, newton);

        let area = SiUnits.parse("mm2").expect("mm2 should parse");
        assert_eq!(Some(area.dimension), Dimension::LENGTH.pow(2));
        assert!(rel_close(area.scale, 1e-6));
        assert_eq!(SiUnits.parse("mm²").expect("mm² should parse"), area);
        assert_eq!(SiUnits.parse("mm^2").expect("mm^2 should parse"), area);

        let torque = SiUnits.parse("N m").expect("N m should parse");
        assert_eq!(torque.dimension, Dimension::new(1, 2, -2, 0, 0, 0, 0));
    }

    #[test]
    fn dimensionless_forms() {
        assert_eq!(SiUnits.parse("").expect("empty"), UnitTag::DIMENSIONLESS);
        assert_eq!(SiUnits.parse("1").expect("one"), UnitTag::DIMENSIONLESS);
        let percent = SiUnits.parse("%").expect("percent");
        assert!(percent.dimension.is_dimensionless());
        assert!(rel_close(percent.scale, 0.01));
    }

    #[test]
    fn rejects_unknown_symbols() {
        assert_err_contains(SiUnits.parse("furlong"), "unknown unit 'furlong'");
        assert_err_contains(SiUnits.parse("m/"), "unknown unit");
        assert_err_contains(SiUnits.parse("(m)"), "unknown unit");
        assert_err_contains(SiUnits.parse("m^x"), "unknown unit");
        assert_err_contains(SiUnits.parse("H^100"), "unknown unit 'H^100'");
        assert_err_contains(SiUnits.parse("m^100 m^100"), "unknown unit 'm^100 m^100'");
        assert_err_contains(SiUnits.parse("m^-100/m^100"), "unknown unit");
    }

    #[test]
    fn from_base_rejects_dimension_mismatch() {
        let metre = SiUnits.parse("m").expect("m");
        let (base, _) = SiUnits.parse("s").expect("s").to_base(1.0);
        assert_err_contains(
            metre.from_base(base, Dimension::TIME),
            "incompatible units",
        );
    }

    #[test]
    fn unit_factor_to_converts_and_names_symbols() {
        let units = SiUnits;
        let mm = units.unit("mm").expect("mm");
        let m = units.unit("m").expect("m");
        assert!(rel_close(mm.factor_to(&m).expect("compatible"), 1e-3));

        let henry = units.unit("H").expect("H");
        assert_err_contains(mm.factor_to(&henry), "cannot convert mm to H");
    }

    #[test]
    fn dimension_display_lists_nonzero_exponents() {
        let velocity = Dimension::LENGTH.div(&Dimension::TIME).expect("small exponents");
        assert_eq!(velocity.to_string(), "[L T^-1]");
        assert_eq!(Dimension::DIMENSIONLESS.to_string(), "[1]");
    }

    const LENGTH_UNITS: &[&str] = &["m", "mm", "um", "km", "nm", "cm", "dam"];

    proptest! {
        #[test]
        fn base_round_trip_reproduces_value(
            value in -1e9_f64..1e9,
            idx in 0..LENGTH_UNITS.len(),
        ) {
            let tag = SiUnits.parse(LENGTH_UNITS[idx]).unwrap();
            let (base, dimension) = tag.to_base(value);
            let back = tag.from_base(base, dimension).unwrap();
            prop_assert!((back - value).abs() <= 1e-12 * value.abs().max(1e-300));
        }

        #[test]
        fn conversion_between_same_dimension_round_trips(
            value in -1e6_f64..1e6,
            a in 0..LENGTH_UNITS.len(),
            b in 0..LENGTH_UNITS.len(),
        ) {
            let from = SiUnits.parse(LENGTH_UNITS[a]).unwrap();
            let to = SiUnits.parse(LENGTH_UNITS[b]).unwrap();
            let there = convert(value, &from, &to).unwrap();
            let back = convert(there, &to, &from).unwrap();
            prop_assert!((back - value).abs() <= 1e-12 * value.abs().max(1e-300));
        }
    }
}
