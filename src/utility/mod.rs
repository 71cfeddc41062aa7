// defines macros, so must be included first
#[macro_use]
pub mod macros;

pub mod sockaddr;

/// Convert a `&[u8]` to `&[i8]`.
pub fn u8_to_i8_slice(s: &[u8]) -> &[i8] {
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const i8, s.len()) }
}

/// Convert a `&[i8]` to `&[u8]`.
pub fn i8_to_u8_slice(s: &[i8]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, s.len()) }
}
