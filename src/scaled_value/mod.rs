use std::cmp::Ordering;
use std::fmt::Display;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Sub};

/// 2^256, exactly.
pub const SCALE_FACTOR: f64 =
    115792089237316195423570985008687907853269984665640564039457584007913129639936.0;
pub const SCALE_THRESHOLD: f64 = 1.0 / SCALE_FACTOR;

/// Scaler of the null value. Small enough that adding two of them does not
/// overflow.
pub const NULL_SCALER: i32 = i32::MAX / 2 - 1;

/// Differences smaller than this are treated as an exact zero on subtraction.
const SUBTRACTION_EPSILON: f64 = 1e-10;

/// A non-negative real number stored as `value * SCALE_THRESHOLD^scaler`, so
/// that products of many small probabilities do not underflow to zero.
///
/// A larger scaler means a smaller number. Values with different scalers are
/// never mixed: the sum of two values keeps the one with the smaller scaler,
/// the other one being negligible. Rescaling is explicit through
/// [`ScaledValue::scale`] so that hot loops only renormalise when needed.
///
/// # Example
/// ```
/// use species_dating::scaled_value::ScaledValue;
///
/// let mut p = ScaledValue::from(1e-200);
/// p.scale();
/// let q = p;
/// p *= q;
/// assert!(!p.is_null());
/// assert_eq!(f64::from(p), 0.0);
/// assert!((p.get_log_value() - 2.0 * (1e-200f64).ln()).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ScaledValue {
    pub value: f64,
    pub scaler: i32,
}

impl Default for ScaledValue {
    fn default() -> Self {
        Self::null()
    }
}

impl ScaledValue {
    pub fn null() -> Self {
        Self {
            value: 0.0,
            scaler: NULL_SCALER,
        }
    }

    pub fn new(value: f64, scaler: i32) -> Self {
        Self { value, scaler }
    }

    pub fn set_null(&mut self) {
        self.value = 0.0;
        self.scaler = NULL_SCALER;
    }

    pub fn check_null(&mut self) {
        if self.value == 0.0 {
            self.scaler = NULL_SCALER;
        }
    }

    /// Moves the value one scaling step up if it dropped below the threshold.
    pub fn scale(&mut self) {
        if self.value < SCALE_THRESHOLD {
            self.scaler += 1;
            self.value *= SCALE_FACTOR;
            self.check_null();
        }
    }

    pub fn is_null(&self) -> bool {
        self.value == 0.0
    }

    /// True if the value lies in [0, 1].
    pub fn is_proba(&self) -> bool {
        *self <= ScaledValue::from(1.0) && ScaledValue::null() <= *self
    }

    pub fn get_log_value(&self) -> f64 {
        if self.scaler == NULL_SCALER {
            return f64::NEG_INFINITY;
        }
        self.value.ln() + self.scaler as f64 * SCALE_THRESHOLD.ln()
    }
}

impl From<f64> for ScaledValue {
    fn from(value: f64) -> Self {
        Self { value, scaler: 0 }
    }
}

/// Anything that had to be scaled down converts to zero.
impl From<ScaledValue> for f64 {
    fn from(v: ScaledValue) -> f64 {
        if v.scaler == 0 {
            v.value
        } else {
            0.0
        }
    }
}

impl Display for ScaledValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.value, self.scaler)
    }
}

impl Add for ScaledValue {
    type Output = ScaledValue;

    fn add(self, other: ScaledValue) -> ScaledValue {
        match other.scaler.cmp(&self.scaler) {
            Ordering::Equal => ScaledValue::new(self.value + other.value, self.scaler),
            Ordering::Less => other,
            Ordering::Greater => self,
        }
    }
}

impl AddAssign for ScaledValue {
    fn add_assign(&mut self, other: ScaledValue) {
        *self = *self + other;
    }
}

impl Sub for ScaledValue {
    type Output = ScaledValue;

    /// # Panics
    /// Panics if the result would be negative, negative scaled values are not
    /// supported.
    fn sub(self, other: ScaledValue) -> ScaledValue {
        match other.scaler.cmp(&self.scaler) {
            Ordering::Equal => {
                let diff = self.value - other.value;
                if diff < 0.0 {
                    if diff.abs() < SUBTRACTION_EPSILON {
                        return ScaledValue::null();
                    }
                    panic!("Negative scaled value: {self} - {other}");
                }
                let mut res = ScaledValue::new(diff, self.scaler);
                res.scale();
                res
            }
            Ordering::Less => panic!("Negative scaled value: {self} - {other}"),
            Ordering::Greater => self,
        }
    }
}

impl Mul for ScaledValue {
    type Output = ScaledValue;

    fn mul(self, other: ScaledValue) -> ScaledValue {
        let mut res = ScaledValue::new(self.value * other.value, self.scaler + other.scaler);
        res.check_null();
        res
    }
}

impl MulAssign for ScaledValue {
    fn mul_assign(&mut self, other: ScaledValue) {
        *self = *self * other;
    }
}

impl Mul<f64> for ScaledValue {
    type Output = ScaledValue;

    fn mul(self, other: f64) -> ScaledValue {
        ScaledValue::new(self.value * other, self.scaler)
    }
}

impl MulAssign<f64> for ScaledValue {
    fn mul_assign(&mut self, other: f64) {
        self.value *= other;
    }
}

impl Div<f64> for ScaledValue {
    type Output = ScaledValue;

    fn div(self, other: f64) -> ScaledValue {
        ScaledValue::new(self.value / other, self.scaler)
    }
}

impl DivAssign<f64> for ScaledValue {
    fn div_assign(&mut self, other: f64) {
        self.value /= other;
    }
}

impl PartialEq for ScaledValue {
    fn eq(&self, other: &Self) -> bool {
        self.scaler == other.scaler && (other.value - self.value).abs() <= f64::EPSILON
    }
}

impl PartialOrd for ScaledValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match (self.is_null(), other.is_null()) {
            (true, true) => return Some(Ordering::Equal),
            (true, false) => return Some(Ordering::Less),
            (false, true) => return Some(Ordering::Greater),
            _ => {}
        }
        if self.scaler != other.scaler {
            // larger scaler, smaller value
            return Some(other.scaler.cmp(&self.scaler));
        }
        self.value.partial_cmp(&other.value)
    }
}

impl Sum for ScaledValue {
    fn sum<I: Iterator<Item = ScaledValue>>(iter: I) -> Self {
        iter.fold(ScaledValue::null(), |acc, v| acc + v)
    }
}

/// Renormalisation hook so that generic likelihood code runs unchanged over
/// plain floats and [`ScaledValue`].
pub trait Scale {
    fn scale(&mut self);
}

impl Scale for f64 {
    fn scale(&mut self) {}
}

impl Scale for f32 {
    fn scale(&mut self) {}
}

impl Scale for ScaledValue {
    fn scale(&mut self) {
        ScaledValue::scale(self);
    }
}

pub trait LogValue {
    fn log_value(&self) -> f64;
}

impl LogValue for f64 {
    fn log_value(&self) -> f64 {
        self.ln()
    }
}

impl LogValue for f32 {
    fn log_value(&self) -> f64 {
        (*self as f64).ln()
    }
}

impl LogValue for ScaledValue {
    fn log_value(&self) -> f64 {
        self.get_log_value()
    }
}
