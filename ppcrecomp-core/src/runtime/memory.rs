//! Guest Memory Accessors
//!
//! Emitted code reaches guest memory through `base`, the host address of
//! guest address 0. Mapping that memory is the host runtime's job; the
//! recompiler only ships these accessors so a build links end to end.
//!
//! # Address Space
//! Guest addresses are 32-bit, so the reservation behind `base` spans
//! [`GUEST_ADDRESS_LIMIT`] bytes.

use std::ptr::NonNull;

/// One past the highest guest address.
pub const GUEST_ADDRESS_LIMIT: u64 = 0x1_0000_0000;

/// Host address of guest address 0. `None` until a host runtime maps guest
/// memory.
#[inline]
pub fn guest_base() -> Option<NonNull<u8>> {
    None
}

/// Size of the guest address space in bytes.
#[inline]
pub fn guest_limit() -> u64 {
    GUEST_ADDRESS_LIMIT
}

/// True if `[address, address + len)` lies inside the guest address space.
#[inline]
pub fn in_guest_range(address: u64, len: u64) -> bool {
    address
        .checked_add(len)
        .is_some_and(|end| end <= guest_limit())
}

/// C entry point behind `ppc_guest_base()` in the register-context header.
#[no_mangle]
pub extern "C" fn ppc_guest_base() -> *mut u8 {
    guest_base().map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// C entry point behind `ppc_guest_limit()` in the register-context header.
#[no_mangle]
pub extern "C" fn ppc_guest_limit() -> u64 {
    guest_limit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stubs_report_an_unmapped_32_bit_space() {
        assert!(guest_base().is_none());
        assert!(ppc_guest_base().is_null());
        assert_eq!(ppc_guest_limit(), 0x1_0000_0000);
    }

    #[test]
    fn range_check_stops_at_the_limit() {
        assert!(in_guest_range(0xFFFF_FFFC, 4));
        assert!(!in_guest_range(0xFFFF_FFFC, 8));
        assert!(!in_guest_range(u64::MAX, 1));
    }
}
