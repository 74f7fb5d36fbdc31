//! Socket readiness, decoupled from any particular event library.
//!
//! The event loop translates its own readiness type into [`Ready`] before
//! handing control to the engine, and reads back the `interest` field to know
//! what to poll for. Keeping our own bitset lets the engine mute and unmute a
//! connection (read-side backpressure) without touching the poller directly.

use std::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ready(pub u16);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);
    pub const HUP: Ready = Ready(0b1000);
    pub const ALL: Ready = Ready(0b1111);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Ready::READABLE.0 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Ready::WRITABLE.0 != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Ready::ERROR.0 != 0
    }

    pub fn is_hup(&self) -> bool {
        self.0 & Ready::HUP.0 != 0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    pub fn contains(&self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl BitAndAssign for Ready {
    fn bitand_assign(&mut self, rhs: Ready) {
        self.0 &= rhs.0;
    }
}

impl Not for Ready {
    type Output = Ready;

    fn not(self) -> Ready {
        Ready(!self.0 & Ready::ALL.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (Ready::READABLE, "R"),
            (Ready::WRITABLE, "W"),
            (Ready::ERROR, "E"),
            (Ready::HUP, "H"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// What a connection wants to be polled for (`interest`) and what the event
/// loop last reported (`event`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub interest: Ready,
    pub event: Ready,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Readiness {
        Readiness {
            interest: Ready::EMPTY,
            event: Ready::EMPTY,
        }
    }

    pub fn reset(&mut self) {
        self.interest = Ready::EMPTY;
        self.event = Ready::EMPTY;
    }

    /// The intersection the event loop should act upon.
    pub fn filter_interest(&self) -> Ready {
        self.interest & self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_operations() {
        let mut ready = Ready::EMPTY;
        ready.insert(Ready::READABLE | Ready::HUP);
        assert!(ready.is_readable());
        assert!(ready.is_hup());
        assert!(!ready.is_writable());

        ready.remove(Ready::READABLE);
        assert!(!ready.is_readable());
        assert_eq!(ready, Ready::HUP);
    }

    #[test]
    fn filter_interest_masks_events() {
        let readiness = Readiness {
            interest: Ready::READABLE,
            event: Ready::READABLE | Ready::WRITABLE,
        };
        assert_eq!(readiness.filter_interest(), Ready::READABLE);
    }
}
