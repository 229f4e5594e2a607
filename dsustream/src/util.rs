/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt;

use num_traits::PrimInt;

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Parse a size with an optional binary suffix (`K`, `M`, `G`, `T`), eg.
/// `512K` or `8G`. Used for command line arguments and config values.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(format!("Invalid size suffix: {c:?}")),
            };
            (&s[..i], shift)
        }
        _ => (s, 0),
    };

    let value: u64 = digits
        .parse()
        .map_err(|e| format!("Invalid size {s:?}: {e}"))?;

    value
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("Size too large: {s:?}"))
}
