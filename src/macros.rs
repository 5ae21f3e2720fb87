macro_rules! __flags {
    ($(
        $(#[$($meta:meta)*])*
        $vis:vis struct $name:ident($ty:ty) {
            $(
                $(#[$($fmeta:meta)*])*
                const $flag:ident = $value:expr;
            )*
        }
    )*) => {
        $(
            $(#[$($meta)*])*
            #[derive(Clone, Copy, Default, PartialEq, Eq)]
            #[repr(transparent)]
            $vis struct $name($ty);

            impl $name {
                $(
                    $(#[$($fmeta)*])*
                    $vis const $flag: Self = Self($value);
                )*

                /// Empty flag set.
                $vis const NONE: Self = Self(0);

                /// Whether every bit in `other` is set in `self`.
                #[inline]
                $vis fn contains(self, other: Self) -> bool {
                    self.0 & other.0 == other.0
                }

                /// Convert the flags to a raw value.
                #[inline]
                $vis fn into_raw(self) -> $ty {
                    self.0
                }

                /// Create flags from a raw value.
                #[inline]
                $vis fn from_raw(value: $ty) -> Self {
                    Self(value)
                }
            }

            impl core::ops::BitOr for $name {
                type Output = Self;

                #[inline]
                fn bitor(self, rhs: Self) -> Self::Output {
                    Self(self.0 | rhs.0)
                }
            }

            impl core::fmt::Debug for $name {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    if self.0 == 0 {
                        return write!(f, "NONE");
                    }

                    let mut first = true;

                    let mut write = |flag: &'static str| {
                        if !first {
                            write!(f, " | ")?;
                        }

                        f.write_str(flag)?;
                        first = false;
                        Ok(())
                    };

                    $(
                        if self.0 & Self::$flag.0 != 0 {
                            write(stringify!($flag))?;
                        }
                    )*

                    Ok(())
                }
            }
        )*
    }
}

pub(crate) use __flags as flags;
