/*++

Licensed under the Apache-2.0 license.

File Name:

    printer.rs

Abstract:

    File contains the log sink and the tagged print macros used by every
    SDCLE component.

--*/
use core::convert::Infallible;
use ufmt::{uDisplay, uWrite};

#[derive(Default)]
pub struct Printer;

impl uWrite for Printer {
    type Error = Infallible;

    /// Writes a string slice into this writer, returning whether the write succeeded.
    #[cfg(not(feature = "std"))]
    #[inline(never)]
    fn write_str(&mut self, _str: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Writes a string slice into this writer, returning whether the write succeeded.
    #[cfg(feature = "std")]
    fn write_str(&mut self, str: &str) -> Result<(), Self::Error> {
        print!("{str}");
        Ok(())
    }
}

#[macro_export]
macro_rules! cprint {
    ($($tt:tt)*) => {{
        let _ = ufmt::uwrite!(&mut $crate::printer::Printer::default(), $($tt)*);
    }}
}

#[macro_export]
macro_rules! cprintln {
    ($($tt:tt)*) => {{
        let _ = ufmt::uwriteln!(&mut $crate::printer::Printer::default(), $($tt)*);
    }}
}

/// Uppercase hex rendering of a byte slice.
pub struct HexBytes<'a>(pub &'a [u8]);
impl uDisplay for HexBytes<'_> {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: uWrite + ?Sized,
    {
        for &x in self.0.iter() {
            for c in [x >> 4, x & 0xf] {
                if c < 10 {
                    f.write_char((c + b'0') as char)?;
                } else {
                    f.write_char((c - 10 + b'A') as char)?;
                }
            }
        }
        Ok(())
    }
}

/// Renders a 16-bit SE object id as `0xE0E2`.
pub struct Oid(pub u16);
impl uDisplay for Oid {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: uWrite + ?Sized,
    {
        f.write_str("0x")?;
        HexBytes(&self.0.to_be_bytes()).fmt(f)
    }
}
