use std::fmt;

use serde::{Deserialize, Serialize};

/// A point on the complex plane.
///
/// The escape-time loop works on the raw components, so this carries no
/// arithmetic beyond conjugation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub const ZERO: Self = Self::new(0.0, 0.0);

    #[inline]
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    /// Reflection about the real axis.
    #[inline]
    pub fn conj(self) -> Self {
        Self::new(self.re, -self.im)
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.im.is_sign_negative() { '-' } else { '+' };
        write!(f, "{} {sign} {}i", self.re, self.im.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conjugate_flips_imaginary_part() {
        let c = Complex::new(-0.75, 0.1).conj();
        assert_eq!(c, Complex::new(-0.75, -0.1));
        assert_eq!(c.conj(), Complex::new(-0.75, 0.1));
    }

    #[test]
    fn display_shows_sign() {
        assert_eq!(Complex::new(1.0, -2.0).to_string(), "1 - 2i");
        assert_eq!(Complex::new(-0.5, 0.25).to_string(), "-0.5 + 0.25i");
    }

    #[test]
    fn serializes_as_named_fields() {
        let json = serde_json::to_string(&Complex::new(-0.5, 0.25)).unwrap();
        assert_eq!(json, r#"{"re":-0.5,"im":0.25}"#);
        let back: Complex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Complex::new(-0.5, 0.25));
    }
}
