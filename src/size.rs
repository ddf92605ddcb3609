use std::{fmt, str::FromStr};

/// An exact byte count.
///
/// All allocator and grower math is done in exact integers; the
/// fractional divisions each algorithm needs round explicitly (see
/// `Chunk::grow_requests` in [`crate::partitioning::grower`]) rather
/// than through this type.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Default)]
pub struct Size(pub u64);

impl Size {
    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * Self::KIB;
    pub const GIB: u64 = 1024 * Self::MIB;
    pub const TIB: u64 = 1024 * Self::GIB;

    pub fn bytes(self) -> u64 { self.0 }

    pub fn from_mib(mib: u64) -> Size { Size(mib * Self::MIB) }

    pub fn from_gib(gib: u64) -> Size { Size(gib * Self::GIB) }

    pub fn saturating_sub(self, other: Size) -> Size { Size(self.0.saturating_sub(other.0)) }

    pub fn checked_sub(self, other: Size) -> Option<Size> { self.0.checked_sub(other.0).map(Size) }
}

impl From<u64> for Size {
    fn from(bytes: u64) -> Size { Size(bytes) }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            n if n >= Self::TIB => write!(f, "{:.2} TiB", n as f64 / Self::TIB as f64),
            n if n >= Self::GIB => write!(f, "{:.2} GiB", n as f64 / Self::GIB as f64),
            n if n >= Self::MIB => write!(f, "{:.2} MiB", n as f64 / Self::MIB as f64),
            n if n >= Self::KIB => write!(f, "{:.2} KiB", n as f64 / Self::KIB as f64),
            n => write!(f, "{} B", n),
        }
    }
}

/// Parses strings like `"4 MiB"`, `"20GiB"`, `"512"` (bytes) into a
/// [`Size`]. Unit suffixes recognized: `B`, `KiB`, `MiB`, `GiB`, `TiB`
/// (case-insensitive, whitespace between the number and unit optional).
impl FromStr for Size {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let split_at = input.find(|c: char| !c.is_ascii_digit() && c != '.');
        let (number, unit) = match split_at {
            Some(idx) => (&input[..idx], input[idx..].trim()),
            None => (input, ""),
        };

        let number: f64 = number.parse().map_err(|_| "invalid numeric size")?;
        let multiplier = match unit.to_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kib" => Size::KIB,
            "m" | "mib" => Size::MIB,
            "g" | "gib" => Size::GIB,
            "t" | "tib" => Size::TIB,
            _ => return Err("unrecognized size unit"),
        };

        Ok(Size((number * multiplier as f64) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_suffixes() {
        assert_eq!("4 MiB".parse::<Size>().unwrap(), Size::from_mib(4));
        assert_eq!("20GiB".parse::<Size>().unwrap(), Size::from_gib(20));
        assert_eq!("512".parse::<Size>().unwrap(), Size(512));
        assert_eq!("1.5GiB".parse::<Size>().unwrap(), Size((1.5 * Size::GIB as f64) as u64));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!("4 XiB".parse::<Size>().is_err());
    }

    #[test]
    fn display_picks_largest_unit() {
        assert_eq!(Size::from_gib(2).to_string(), "2.00 GiB");
        assert_eq!(Size(512).to_string(), "512 B");
    }
}
