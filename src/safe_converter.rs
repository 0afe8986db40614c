//! Numeric conversions between the wire's fixed-width fields and in-memory `usize` / `u64`
//!  values.

/// Widening casts that can never lose information on supported targets
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self.into()
    }
}

/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

/// Narrowing casts that clamp to the target type's maximum, e.g. for timing hints on the wire
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}
impl SaturatingCast<u32> for u64 {
    fn saturating_cast(self) -> u32 {
        self.try_into().unwrap_or(u32::MAX)
    }
}
impl SaturatingCast<u64> for u128 {
    fn saturating_cast(self) -> u64 {
        self.try_into().unwrap_or(u64::MAX)
    }
}
impl SaturatingCast<u32> for usize {
    fn saturating_cast(self) -> u32 {
        self.try_into().unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::small(17, 17)]
    #[case::max(u32::MAX as u64, u32::MAX)]
    #[case::above(u32::MAX as u64 + 1, u32::MAX)]
    #[case::huge(u64::MAX, u32::MAX)]
    fn test_saturating_u64_to_u32(#[case] value: u64, #[case] expected: u32) {
        assert_eq!(SaturatingCast::<u32>::saturating_cast(value), expected);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u16 = 70_000usize.prechecked_cast();
    }
}
