use core::fmt;

/// Leaf page sizes shared by the supported paging schemes.
///
/// The discriminant order matches the page-table level at which the leaf is
/// installed (level 0 for 4 KiB, 1 for 2 MiB, 2 for 1 GiB).
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageSize {
    /// 4 KiB page (4096 bytes).
    #[default]
    Size4K,
    /// 2 MiB page (`2_097_152` bytes).
    Size2M,
    /// 1 GiB page (`1_073_741_824` bytes).
    Size1G,
}

impl PageSize {
    /// All sizes, smallest first.
    pub const ALL: [Self; 3] = [Self::Size4K, Self::Size2M, Self::Size1G];

    /// log2 of the page size in bytes.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size2M => 21,
            Self::Size1G => 30,
        }
    }

    /// Page size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }

    /// Number of 4 KiB frames spanned by one page of this size.
    #[inline]
    #[must_use]
    pub const fn frames(self) -> usize {
        1 << (self.shift() - 12)
    }

    /// Page-table level holding a leaf of this size.
    #[inline]
    #[must_use]
    pub const fn level(self) -> usize {
        match self {
            Self::Size4K => 0,
            Self::Size2M => 1,
            Self::Size1G => 2,
        }
    }

    /// Inverse of [`level`](Self::level).
    #[inline]
    #[must_use]
    pub const fn from_level(level: usize) -> Option<Self> {
        match level {
            0 => Some(Self::Size4K),
            1 => Some(Self::Size2M),
            2 => Some(Self::Size1G),
            _ => None,
        }
    }

    /// The next smaller size, if any.
    #[inline]
    #[must_use]
    pub const fn smaller(self) -> Option<Self> {
        match self {
            Self::Size4K => None,
            Self::Size2M => Some(Self::Size4K),
            Self::Size1G => Some(Self::Size2M),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size1G => "1G",
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_round_trip() {
        for size in PageSize::ALL {
            assert_eq!(PageSize::from_level(size.level()), Some(size));
        }
        assert_eq!(PageSize::from_level(3), None);
    }

    #[test]
    fn frames_per_page() {
        assert_eq!(PageSize::Size4K.frames(), 1);
        assert_eq!(PageSize::Size2M.frames(), 512);
        assert_eq!(PageSize::Size1G.frames(), 512 * 512);
        assert_eq!(PageSize::Size1G.smaller(), Some(PageSize::Size2M));
    }
}
