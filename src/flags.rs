use std::{fmt, ops};

/// Per-entry behavior bits (spec §3/§6). `READ` and `WRITE` are mutually
/// exclusive on one entry; unrecognized bits are preserved (callers may use
/// the high bits for their own bookkeeping) but must not collide with the
/// ones named here.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Flags(u32);

const READ: u32 = 0b0000_0001;
const WRITE: u32 = 0b0000_0010;
const PERIODIC: u32 = 0b0000_0100;
const SOCKET: u32 = 0b0000_1000;
const REMOVE_AT_POWEROFF: u32 = 0b0001_0000;

impl Flags {
    #[inline]
    pub fn empty() -> Flags {
        Flags(0)
    }

    #[inline]
    pub fn read() -> Flags {
        Flags(READ)
    }

    #[inline]
    pub fn write() -> Flags {
        Flags(WRITE)
    }

    #[inline]
    pub fn periodic() -> Flags {
        Flags(PERIODIC)
    }

    #[inline]
    pub fn socket() -> Flags {
        Flags(SOCKET)
    }

    #[inline]
    pub fn remove_at_poweroff() -> Flags {
        Flags(REMOVE_AT_POWEROFF)
    }

    #[inline]
    pub fn is_read(self) -> bool {
        self.contains(Flags(READ))
    }

    #[inline]
    pub fn is_write(self) -> bool {
        self.contains(Flags(WRITE))
    }

    #[inline]
    pub fn is_periodic(self) -> bool {
        self.contains(Flags(PERIODIC))
    }

    #[inline]
    pub fn is_socket(self) -> bool {
        self.contains(Flags(SOCKET))
    }

    #[inline]
    pub fn is_remove_at_poweroff(self) -> bool {
        self.contains(Flags(REMOVE_AT_POWEROFF))
    }

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        (self & other) == other
    }

    #[inline]
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    /// Normalizes a device registration's read/write bit per spec §4.2:
    /// neither bit set defaults to `READ`. Returns `None` if both are set
    /// (programmer error — `READ` and `WRITE` are mutually exclusive).
    pub fn normalized_device_direction(self) -> Option<Flags> {
        if self.is_read() && self.is_write() {
            return None;
        }
        if !self.is_read() && !self.is_write() {
            return Some(self | Flags::read());
        }
        Some(self)
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    #[inline]
    fn bitor(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

impl ops::BitAnd for Flags {
    type Output = Flags;

    #[inline]
    fn bitand(self, other: Flags) -> Flags {
        Flags(self.0 & other.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let named = [
            (Flags(READ), "READ"),
            (Flags(WRITE), "WRITE"),
            (Flags(PERIODIC), "PERIODIC"),
            (Flags(SOCKET), "SOCKET"),
            (Flags(REMOVE_AT_POWEROFF), "REMOVE_AT_POWEROFF"),
        ];

        write!(fmt, "Flags {{")?;
        for &(flag, name) in &named {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        write!(fmt, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::Flags;

    #[test]
    fn device_direction_defaults_to_read() {
        let normalized = Flags::empty().normalized_device_direction().unwrap();
        assert!(normalized.is_read());
        assert!(!normalized.is_write());
    }

    #[test]
    fn read_and_write_together_is_rejected() {
        let both = Flags::read() | Flags::write();
        assert!(both.normalized_device_direction().is_none());
    }
}
