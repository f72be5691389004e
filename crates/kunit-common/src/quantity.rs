//! Numeric comparison of Kubernetes resource quantities
//!
//! `Quantity` is a string on the wire, so "1" and "1000m" or "1Gi" and
//! "1024Mi" are different strings for the same amount. Drift detection and
//! storage resizing compare the parsed values instead.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a quantity string into its value in base units.
///
/// Returns `None` for strings that are not valid quantities.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }

    // "1e3" / "1E3" exponent form, checked before the "E" (exa) suffix
    if let Some(pos) = s.find(['e', 'E']) {
        let (mantissa, exponent) = (&s[..pos], &s[pos + 1..]);
        if !exponent.is_empty() {
            if let (Ok(m), Ok(e)) = (mantissa.parse::<f64>(), exponent.parse::<i32>()) {
                return Some(m * 10f64.powi(e));
            }
        }
    }

    for (suffix, factor) in DECIMAL_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }

    s.parse::<f64>().ok()
}

/// True when two quantities denote the same amount.
///
/// Unparseable quantities fall back to string equality.
pub fn quantity_eq(a: &Quantity, b: &Quantity) -> bool {
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Some(x), Some(y)) => approx_eq(x, y),
        _ => a.0 == b.0,
    }
}

/// Compare two optional quantities, treating absence as its own value
pub fn optional_quantity_eq(a: Option<&Quantity>, b: Option<&Quantity>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => quantity_eq(a, b),
        _ => false,
    }
}

/// True when `a` is strictly larger than `b`
pub fn quantity_gt(a: &Quantity, b: &Quantity) -> bool {
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Some(x), Some(y)) => x > y && !approx_eq(x, y),
        _ => false,
    }
}

fn approx_eq(x: f64, y: f64) -> bool {
    let scale = x.abs().max(y.abs()).max(1.0);
    (x - y).abs() <= scale * 1e-9
}
