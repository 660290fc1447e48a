//! 有理数类型, 用于时间基 (time_base) 与宽高比.

use std::fmt;

/// 有理数, 由分子和分母组成
///
/// 轨道时间基为 1/timescale, 例如 1/90000 表示 90kHz 时钟.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    /// 分子
    pub num: i32,
    /// 分母
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 未定义 (分母为 0)
    pub const UNDEFINED: Self = Self { num: 0, den: 0 };

    /// 由 box 中的 timescale (每秒 tick 数) 构造时间基
    ///
    /// timescale 为 0 或超出 i32 范围时返回 `UNDEFINED`.
    pub fn from_timescale(timescale: u32) -> Self {
        match i32::try_from(timescale) {
            Ok(den) if den > 0 => Self { num: 1, den },
            _ => Self::UNDEFINED,
        }
    }

    /// 分母不为 0
    pub const fn is_valid(&self) -> bool {
        self.den != 0
    }

    /// 以本时间基计的 `ticks` 对应的秒数, 时间基无效时返回 None
    pub fn ticks_to_secs(self, ticks: i64) -> Option<f64> {
        self.is_valid()
            .then(|| ticks as f64 * f64::from(self.num) / f64::from(self.den))
    }

    /// 约分, 结果的分母为正
    ///
    /// 用于帧率与像素宽高比; 无效值原样返回.
    pub fn reduce(self) -> Self {
        let (mut a, mut b) = (self.num.unsigned_abs(), self.den.unsigned_abs());
        while b != 0 {
            (a, b) = (b, a % b);
        }
        // a 为最大公约数, 分母为 0 时等于 |num|
        if self.den == 0 || a <= 1 {
            return if self.den < 0 {
                Self::new(self.num.wrapping_neg(), self.den.wrapping_neg())
            } else {
                self
            };
        }
        let g = a as i64;
        let sign = if self.den < 0 { -1 } else { 1 };
        Self {
            num: (sign * i64::from(self.num) / g) as i32,
            den: (sign * i64::from(self.den) / g) as i32,
        }
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_时间基_由timescale构造() {
        assert_eq!(Rational::from_timescale(90000), Rational::new(1, 90000));
        assert!(!Rational::from_timescale(0).is_valid());
        assert!(!Rational::from_timescale(u32::MAX).is_valid());
    }

    #[test]
    fn test_时间基_换算秒数() {
        let tb = Rational::from_timescale(3000);
        assert_eq!(tb.ticks_to_secs(1500), Some(0.5));
        assert_eq!(Rational::UNDEFINED.ticks_to_secs(10), None);
    }

    #[test]
    fn test_约分_帧率与宽高比() {
        assert_eq!(Rational::new(30000, 1000).reduce(), Rational::new(30, 1));
        assert_eq!(Rational::new(4, -8).reduce(), Rational::new(-1, 2));
        assert_eq!(Rational::new(30000, 1001).reduce(), Rational::new(30000, 1001));
        assert_eq!(Rational::UNDEFINED.reduce(), Rational::UNDEFINED);
    }

    #[test]
    fn test_显示格式() {
        assert_eq!(format!("{}", Rational::new(30000, 1001)), "30000/1001");
    }
}
