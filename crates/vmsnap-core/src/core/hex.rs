/// A hexadecimal representation of a value.
///
/// Used in log fields and summaries where raw integers read better in hex.
///
/// # Examples
///
/// ```
/// # use vmsnap_core::Hex;
/// assert_eq!(format!("{}", Hex(42u16)), "0x002a");
/// assert_eq!(format!("{}", Hex(&[1u8, 2][..])), "[0x01, 0x02]");
/// ```
pub struct Hex<T>(pub T);

macro_rules! impl_hex {
    ($type:ty) => {
        impl ::std::fmt::Debug for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                fmt_scalar(f, self.0)
            }
        }

        impl ::std::fmt::Display for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                fmt_scalar(f, self.0)
            }
        }

        impl ::std::fmt::Display for Hex<&[$type]> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "[")?;
                for (index, item) in self.0.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    fmt_scalar(f, *item)?;
                }
                write!(f, "]")
            }
        }
    };
}

fn fmt_scalar<T>(f: &mut ::std::fmt::Formatter, data: T) -> ::std::fmt::Result
where
    T: Copy + ::std::fmt::LowerHex,
{
    match size_of::<T>() {
        1 => write!(f, "0x{:02x}", data),
        2 => write!(f, "0x{:04x}", data),
        4 => write!(f, "0x{:08x}", data),
        8 => write!(f, "0x{:016x}", data),
        _ => write!(f, "0x{:x}", data),
    }
}

impl_hex!(u8);
impl_hex!(u16);
impl_hex!(u32);
impl_hex!(u64);
impl_hex!(usize);
