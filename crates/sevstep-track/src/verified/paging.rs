//! 4 KiB page arithmetic on guest addresses.

/// log2 of the x86 base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Page frame number of `addr` (address with the low 12 bits dropped).
pub const fn page_number(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Start address of the page containing `addr`.
pub const fn page_base(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// True iff `a` and `b` agree in every bit above bit 11.
///
/// # Properties
///
/// - Reflexive and symmetric.
/// - `on_same_page(a, b) == (page_base(a) == page_base(b))`.
pub fn on_same_page(a: u64, b: u64) -> bool {
    let result = page_number(a) == page_number(b);

    debug_assert_eq!(
        result,
        page_base(a) == page_base(b),
        "on_same_page: page_number and page_base disagree for {a:#x}, {b:#x}"
    );

    result
}
