#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::ops::Neg;

/// Exact rational number in lowest terms with a positive denominator.
///
/// Distances and per-draw costs are folded exactly so that `x - x` and
/// `1/3 + 2/3` simplify without floating-point noise. Arithmetic is checked:
/// a result that leaves the `i128` range is `None`. Neither part is ever
/// `i128::MIN`, so negation and `abs` cannot overflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ratio {
    num: i128,
    den: i128,
}

impl Default for Ratio {
    fn default() -> Self {
        Ratio::ZERO
    }
}

impl Ratio {
    pub const ZERO: Ratio = Ratio { num: 0, den: 1 };
    pub const ONE: Ratio = Ratio { num: 1, den: 1 };

    pub fn new(num: i128, den: i128) -> Option<Self> {
        if den == 0 || num == i128::MIN || den == i128::MIN {
            return None;
        }
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num.abs(), den.abs()).max(1);
        Some(Ratio {
            num: sign * num / g,
            den: sign * den / g,
        })
    }

    /// Integral value from a literal or a configuration setting. Values read
    /// at run time go through [`Ratio::new`].
    pub fn integer(n: i128) -> Self {
        Ratio { num: n, den: 1 }
    }

    /// Parse a C numeric literal: `2`, `0.5`, `.25`, `3.0f`, `1e-3`.
    ///
    /// `None` for malformed text and for literals whose exact value needs
    /// more than 127 bits in numerator or denominator, such as `1e-40`.
    pub fn parse(text: &str) -> Option<Self> {
        let t = text.trim_end_matches(['f', 'F']);
        let (mantissa, exp) = match t.find(['e', 'E']) {
            Some(i) => (&t[..i], t[i + 1..].parse::<i32>().ok()?),
            None => (t, 0),
        };
        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((a, b)) => (a, b),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        let digits = format!("{int_part}{frac_part}");
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let num: i128 = digits.parse().ok()?;
        let scale = exp.checked_sub(i32::try_from(frac_part.len()).ok()?)?;
        let pow = 10i128.checked_pow(scale.unsigned_abs())?;
        if scale >= 0 {
            Ratio::new(num.checked_mul(pow)?, 1)
        } else {
            Ratio::new(num, pow)
        }
    }

    pub fn numer(self) -> i128 {
        self.num
    }

    pub fn denom(self) -> i128 {
        self.den
    }

    pub fn is_zero(self) -> bool {
        self.num == 0
    }

    pub fn is_integer(self) -> bool {
        self.den == 1
    }

    pub fn is_negative(self) -> bool {
        self.num < 0
    }

    pub fn abs(self) -> Self {
        Ratio {
            num: self.num.abs(),
            den: self.den,
        }
    }

    pub fn recip(self) -> Option<Self> {
        Ratio::new(self.den, self.num)
    }

    pub fn checked_add(self, rhs: Ratio) -> Option<Self> {
        let g = gcd(self.den, rhs.den);
        let den = (self.den / g).checked_mul(rhs.den)?;
        let left = self.num.checked_mul(den / self.den)?;
        let right = rhs.num.checked_mul(den / rhs.den)?;
        Ratio::new(left.checked_add(right)?, den)
    }

    pub fn checked_sub(self, rhs: Ratio) -> Option<Self> {
        self.checked_add(-rhs)
    }

    pub fn checked_mul(self, rhs: Ratio) -> Option<Self> {
        let g1 = gcd(self.num.abs(), rhs.den).max(1);
        let g2 = gcd(rhs.num.abs(), self.den).max(1);
        let num = (self.num / g1).checked_mul(rhs.num / g2)?;
        let den = (self.den / g2).checked_mul(rhs.den / g1)?;
        Ratio::new(num, den)
    }

    /// `None` on division by zero as well as on overflow.
    pub fn checked_div(self, rhs: Ratio) -> Option<Self> {
        self.checked_mul(rhs.recip()?)
    }

    /// Truncating remainder, as C's `%` on integers.
    pub fn rem(self, other: Ratio) -> Option<Self> {
        if !self.is_integer() || !other.is_integer() || other.is_zero() {
            return None;
        }
        Some(Ratio::integer(self.num % other.num))
    }

    /// Finite decimal spelling of a non-negative value (`0.5`, `0.125`), if
    /// the denominator only has factors 2 and 5.
    pub fn decimal(self) -> Option<String> {
        if self.is_negative() {
            return None;
        }
        if self.is_integer() {
            return Some(self.num.to_string());
        }
        let (mut twos, mut fives, mut d) = (0u32, 0u32, self.den);
        while d % 2 == 0 {
            d /= 2;
            twos += 1;
        }
        while d % 5 == 0 {
            d /= 5;
            fives += 1;
        }
        if d != 1 {
            return None;
        }
        let places = twos.max(fives);
        let pow = 10i128.checked_pow(places)?;
        let scaled = self.num.checked_mul(pow)? / self.den;
        let frac = format!("{:0width$}", scaled % pow, width = places as usize);
        Some(format!("{}.{}", scaled / pow, frac.trim_end_matches('0')))
    }

    pub fn to_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Compares `a/b` with `c/d` for positive `b` and `d` by their continued
/// fraction expansions, which never leaves the `i128` range.
fn cmp_fractions(a: i128, b: i128, c: i128, d: i128) -> Ordering {
    let (qa, ra) = (a.div_euclid(b), a.rem_euclid(b));
    let (qc, rc) = (c.div_euclid(d), c.rem_euclid(d));
    if qa != qc {
        return qa.cmp(&qc);
    }
    match (ra == 0, rc == 0) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => cmp_fractions(d, rc, b, ra),
    }
}

impl Ord for Ratio {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.den == other.den {
            return self.num.cmp(&other.num);
        }
        match (self.num.checked_mul(other.den), other.num.checked_mul(self.den)) {
            (Some(l), Some(r)) => l.cmp(&r),
            _ => cmp_fractions(self.num, self.den, other.num, other.den),
        }
    }
}

impl PartialOrd for Ratio {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Neg for Ratio {
    type Output = Ratio;

    fn neg(self) -> Ratio {
        Ratio {
            num: -self.num,
            den: self.den,
        }
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integer() {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(n: i128, d: i128) -> Ratio {
        Ratio::new(n, d).unwrap()
    }

    #[test]
    fn parses_c_literals() {
        assert_eq!(Ratio::parse("2"), Some(r(2, 1)));
        assert_eq!(Ratio::parse("2.0"), Some(r(2, 1)));
        assert_eq!(Ratio::parse("0.5"), Some(r(1, 2)));
        assert_eq!(Ratio::parse(".25"), Some(r(1, 4)));
        assert_eq!(Ratio::parse("3.0f"), Some(r(3, 1)));
        assert_eq!(Ratio::parse("1e-3"), Some(r(1, 1000)));
        assert_eq!(Ratio::parse("2.f"), Some(r(2, 1)));
        assert_eq!(Ratio::parse("abc"), None);
    }

    #[test]
    fn arithmetic_is_exact() {
        let third = r(1, 3);
        assert_eq!(third.checked_add(third).and_then(|t| t.checked_add(third)), Some(Ratio::ONE));
        assert_eq!(third.checked_sub(third), Some(Ratio::ZERO));
        assert_eq!(r(2, 3).checked_mul(r(3, 4)), Some(r(1, 2)));
        assert_eq!(r(1, 2).checked_div(r(1, 4)), Some(r(2, 1)));
        assert_eq!(Ratio::ONE.checked_div(Ratio::ZERO), None);
        assert!(r(-1, 2) < r(1, 3));
    }

    #[test]
    fn overflow_is_reported_not_wrapped() {
        let big = Ratio::integer(10i128.pow(20));
        assert_eq!(big.checked_mul(big), None);
        assert_eq!(Ratio::integer(i128::MAX).checked_add(Ratio::ONE), None);
        assert_eq!(Ratio::integer(-i128::MAX).checked_sub(Ratio::ONE), None);
        assert_eq!(r(1, i128::MAX).checked_add(r(1, i128::MAX - 1)), None);
        assert_eq!(Ratio::new(i128::MIN, 1), None);
        assert_eq!(big.checked_mul(Ratio::integer(10i128.pow(10))), Some(Ratio::integer(10i128.pow(30))));
    }

    #[test]
    fn ordering_survives_large_cross_products() {
        let a = r(i128::MAX - 1, i128::MAX);
        let b = r(i128::MAX - 2, i128::MAX - 1);
        assert!(b < a);
        assert!(a < Ratio::ONE);
        assert!(r(-(i128::MAX - 1), i128::MAX) < r(-(i128::MAX - 2), i128::MAX - 1));
        assert_eq!(r(i128::MAX, 3).cmp(&r(i128::MAX, 3)), Ordering::Equal);
        assert!(r(i128::MAX, 2) > r(i128::MAX, 3));
    }

    #[test]
    fn out_of_range_literals_are_unreadable() {
        assert_eq!(Ratio::parse("1e-40"), None);
        assert_eq!(Ratio::parse("1e40"), None);
        assert_eq!(Ratio::parse("1.5e-2147483648"), None);
        assert_eq!(Ratio::parse("1e-38"), Some(r(1, 10i128.pow(38))));
    }

    #[test]
    fn decimal_spelling() {
        assert_eq!(r(1, 2).decimal().as_deref(), Some("0.5"));
        assert_eq!(r(5, 4).decimal().as_deref(), Some("1.25"));
        assert_eq!(r(1, 8).decimal().as_deref(), Some("0.125"));
        assert_eq!(r(3, 1).decimal().as_deref(), Some("3"));
        assert_eq!(r(1, 3).decimal(), None);
        assert_eq!(r(1, 1 << 126).decimal(), None);
    }
}
