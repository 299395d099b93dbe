bitflags::bitflags! {
    /// Architecture-neutral page attributes.
    ///
    /// The protection bits mirror the `PROT_*` vocabulary. Each [`PteCodec`]
    /// translates them into its hardware layout; combinations an architecture
    /// cannot express are widened by [`PteCodec::normalize`].
    ///
    /// [`PteCodec`]: crate::PteCodec
    /// [`PteCodec::normalize`]: crate::PteCodec::normalize
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Attributes: u8 {
        /// Page may be read.
        const READ = 1 << 0;

        /// Page may be written.
        const WRITE = 1 << 1;

        /// Instructions may be fetched from the page.
        const EXEC = 1 << 2;

        /// Normal memory, not cached, writes may be combined.
        ///
        /// Used for frame buffers and DMA rings shared with devices.
        const WRITE_COMBINE = 1 << 3;

        /// Strongly ordered device memory (MMIO).
        const UNCACHED = 1 << 4;
    }
}

impl Attributes {
    /// `PROT_READ | PROT_WRITE`.
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// `PROT_READ | PROT_EXEC`.
    pub const RX: Self = Self::READ.union(Self::EXEC);

    /// `PROT_READ | PROT_WRITE | PROT_EXEC`.
    pub const RWX: Self = Self::RW.union(Self::EXEC);

    /// All protection bits.
    pub const PROTECTION: Self = Self::RWX;

    /// All caching bits.
    pub const CACHING: Self = Self::WRITE_COMBINE.union(Self::UNCACHED);

    /// The protection bits only.
    #[inline]
    #[must_use]
    pub const fn protection(self) -> Self {
        self.intersection(Self::PROTECTION)
    }

    /// Whether any access is permitted.
    #[inline]
    #[must_use]
    pub const fn is_accessible(self) -> bool {
        self.intersects(Self::PROTECTION)
    }
}

impl core::fmt::Display for Attributes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.contains(Self::READ), 'r'),
            flag(self.contains(Self::WRITE), 'w'),
            flag(self.contains(Self::EXEC), 'x'),
        )?;
        if self.contains(Self::UNCACHED) {
            f.write_str(" uc")?;
        } else if self.contains(Self::WRITE_COMBINE) {
            f.write_str(" wc")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_prot_style() {
        assert_eq!(Attributes::RW.to_string(), "rw-");
        assert_eq!(Attributes::RX.to_string(), "r-x");
        assert_eq!((Attributes::RW | Attributes::UNCACHED).to_string(), "rw- uc");
        assert_eq!(Attributes::empty().to_string(), "---");
    }

    #[test]
    fn protection_strips_caching() {
        let a = Attributes::RWX | Attributes::WRITE_COMBINE;
        assert_eq!(a.protection(), Attributes::RWX);
        assert!(!Attributes::UNCACHED.is_accessible());
    }
}
