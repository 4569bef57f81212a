//! Page-fault error code bits.
//!
//! Uses the `PFERR_*` definitions from Linux
//! `arch/x86/include/asm/kvm_host.h`.

use std::fmt;

/// A single page-fault error code bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PfErrorBit {
    Present = 1 << 0,
    Write = 1 << 1,
    User = 1 << 2,
    Rsvd = 1 << 3,
    Fetch = 1 << 4,
    Pk = 1 << 5,
}

impl PfErrorBit {
    /// All bits, in rendering order.
    pub const ALL: [PfErrorBit; 6] = [
        PfErrorBit::Present,
        PfErrorBit::Write,
        PfErrorBit::User,
        PfErrorBit::Rsvd,
        PfErrorBit::Fetch,
        PfErrorBit::Pk,
    ];

    pub const fn mask(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            PfErrorBit::Present => "Present",
            PfErrorBit::Write => "Write",
            PfErrorBit::User => "User",
            PfErrorBit::Rsvd => "RSVD",
            PfErrorBit::Fetch => "Fetch",
            PfErrorBit::Pk => "PK",
        }
    }
}

impl fmt::Display for PfErrorBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// True if every bit in `bits` is set in `error_code`.  An empty list is
/// vacuously true.
pub fn are_set(error_code: u32, bits: &[PfErrorBit]) -> bool {
    bits.iter().all(|b| error_code & b.mask() != 0)
}

/// Names of the bits set in `code`, each followed by a single space.
///
/// Returns an empty string when no known bit is set.
pub fn error_code_to_string(code: u32) -> String {
    let mut out = String::new();
    for bit in PfErrorBit::ALL {
        if are_set(code, &[bit]) {
            out.push_str(bit.name());
            out.push(' ');
        }
    }
    out
}
