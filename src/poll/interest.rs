//! Readiness interest flags.

/// Interest flags indicating which I/O conditions to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// No interest at all.
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b001);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b010);
    /// Interest in error conditions.
    ///
    /// Error readiness is reported by the kernel whether or not it is
    /// requested; the flag exists so masks can name it and so backends that
    /// can distinguish it have a way to report it.
    pub const ERROR: Interest = Interest(0b100);

    /// Readable plus error, the resting mask of an open socket.
    #[must_use]
    pub const fn readable() -> Self {
        Self(Self::READABLE.0 | Self::ERROR.0)
    }

    /// Writable plus error, the mask used while a connect is pending.
    #[must_use]
    pub const fn writable() -> Self {
        Self(Self::WRITABLE.0 | Self::ERROR.0)
    }

    /// Readable, writable and error.
    #[must_use]
    pub const fn all() -> Self {
        Self(Self::READABLE.0 | Self::WRITABLE.0 | Self::ERROR.0)
    }

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if error interest is set.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Combines two interests.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Self(self.0 | other.0)
    }

    /// Removes the flags of `other`.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if every flag of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_composition() {
        let i = Interest::READABLE | Interest::WRITABLE;
        assert!(i.is_readable());
        assert!(i.is_writable());
        assert!(!i.is_error());
        let i = i.remove(Interest::READABLE);
        assert!(!i.is_readable());
        assert!(i.is_writable());
    }

    #[test]
    fn contains_requires_all_flags() {
        assert!(Interest::all().contains(Interest::readable()));
        assert!(!Interest::READABLE.contains(Interest::readable()));
    }
}
