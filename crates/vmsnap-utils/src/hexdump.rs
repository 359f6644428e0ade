use std::fmt::Write as _;

use vmsnap_core::{AccessContext, Architecture, SnapCore, SnapError};

/// Representation of memory for hexdump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// Display memory as 8-bit values.
    U8,

    /// Display memory as 32-bit values.
    U32,

    /// Display memory as 64-bit values.
    U64,
}

impl Representation {
    fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

const HEADER: &str =
    "--------------------|  0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F | 0123456789ABCDEF";

/// Formats a hexdump of `count` bytes of snapshot memory.
///
/// Each line holds 16 bytes: the address, the values in the chosen
/// representation and the printable ASCII column.
pub fn hexdump<Arch>(
    core: &SnapCore<Arch>,
    ctx: impl Into<AccessContext>,
    count: usize,
    representation: Representation,
) -> Result<String, SnapError>
where
    Arch: Architecture,
{
    let ctx = ctx.into();

    let mut buf = vec![0u8; count];
    core.read(ctx, &mut buf)?;

    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');

    let width = representation.width();
    let cell = match representation {
        Representation::U8 => 3,
        Representation::U32 => 12,
        Representation::U64 => 24,
    };

    for (index, chunk) in buf.chunks(16).enumerate() {
        let _ = write!(out, " 0x{:016X} |", ctx.address + (index * 16) as u64);

        for value in chunk.chunks(width) {
            let mut bytes = [0u8; 8];
            bytes[..value.len()].copy_from_slice(value);
            let value = u64::from_le_bytes(bytes);

            let _ = match representation {
                Representation::U8 => write!(out, " {:02X}", value),
                Representation::U32 => write!(out, "  0x{:08X}", value),
                Representation::U64 => write!(out, "      0x{:016X}", value),
            };
        }

        let missing = (16 - chunk.len()).div_ceil(width) * cell;
        out.extend(std::iter::repeat_n(' ', missing));

        out.push_str(" | ");

        for &byte in chunk {
            out.push(match byte.is_ascii_graphic() {
                true => byte as char,
                false => '.',
            });
        }

        out.extend(std::iter::repeat_n(' ', 16 - chunk.len()));
        out.push('\n');
    }

    Ok(out)
}
