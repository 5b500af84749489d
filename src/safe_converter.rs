//! Integer conversions between the wire types (`u16`, `u32`) and `usize`.

/// Widening conversion that can not lose information on the supported targets
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

macro_rules! widening {
    ($from:ty => $to:ty) => {
        impl SafeCast<$to> for $from {
            #[inline]
            fn safe_cast(self) -> $to {
                self as $to
            }
        }
    };
}

#[cfg(not(target_pointer_width = "16"))]
widening!(u32 => usize);
widening!(u16 => usize);
widening!(u16 => u32);

/// Narrowing conversion for values whose range is bounded by protocol constants, e.g. a
///  fragment length can never exceed the MTU. An out-of-range value is a bug and panics.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

macro_rules! narrowing {
    ($from:ty => $to:ty) => {
        impl PrecheckedCast<$to> for $from {
            #[inline]
            fn prechecked_cast(self) -> $to {
                match <$to>::try_from(self) {
                    Ok(v) => v,
                    Err(_) => panic!("{} does not fit into {} - bounds check missing", self, stringify!($to)),
                }
            }
        }
    };
}

narrowing!(usize => u32);
narrowing!(usize => u16);
narrowing!(u32 => u16);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::mtu(1400, 1400)]
    #[case::max(u16::MAX as usize, u16::MAX)]
    fn test_narrow_usize_to_u16(#[case] value: usize, #[case] expected: u16) {
        let v: u16 = value.prechecked_cast();
        assert_eq!(v, expected);
    }

    #[test]
    fn test_widen() {
        let v: usize = 4096u16.safe_cast();
        assert_eq!(v, 4096);
        let v: u32 = u16::MAX.safe_cast();
        assert_eq!(v, 65535);
        let v: u32 = 70_000usize.prechecked_cast();
        assert_eq!(v, 70_000);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u16 = 70_000u32.prechecked_cast();
    }
}
