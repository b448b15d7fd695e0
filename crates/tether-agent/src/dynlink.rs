//! Dynamic-linker commands and the function-call trampoline.
//!
//! Loading goes straight through the platform loader. Handles and symbol
//! addresses cross the wire as raw 64-bit words owned by the controller;
//! the agent tracks nothing. A call into a bad address is fatal to the
//! whole process by contract.

use std::ffi::CStr;
use std::mem;

use tracing::debug;

use tether_protocol::{wire, MAX_CALL_ARGS, PATH_FIELD_LEN};

use crate::error::{AgentError, Result};
use crate::session::ReadWrite;

/// Handle DLOPEN: fixed filename field + mode word, reply with the handle
/// (0 on failure; there is no error reply).
pub fn handle_dlopen(stream: &mut impl ReadWrite) -> Result<()> {
    let mut field = [0u8; PATH_FIELD_LEN];
    stream.read_exact(&mut field)?;
    let mode = wire::read_u32(stream)?;
    let filename = field_cstr(&field)?;

    // SAFETY: filename is NUL-terminated; mode bits pass through unchanged.
    let handle = unsafe { libc::dlopen(filename.as_ptr(), mode as libc::c_int) };
    if handle.is_null() {
        debug!(filename = %filename.to_string_lossy(), error = %dlerror_text(), "dlopen failed");
    }
    wire::write_u64(stream, handle as u64)?;
    Ok(())
}

/// Handle DLCLOSE: reply with the loader's integer status widened to 64
/// bits.
pub fn handle_dlclose(stream: &mut impl ReadWrite) -> Result<()> {
    let handle = wire::read_u64(stream)?;
    // SAFETY: the controller owns the handle; a stale one is its problem.
    let status = unsafe { libc::dlclose(handle as *mut libc::c_void) };
    wire::write_u64(stream, i64::from(status) as u64)?;
    Ok(())
}

/// Handle DLSYM: handle + fixed symbol-name field, reply with the resolved
/// address (0 when unresolved).
pub fn handle_dlsym(stream: &mut impl ReadWrite) -> Result<()> {
    let handle = wire::read_u64(stream)?;
    let mut field = [0u8; PATH_FIELD_LEN];
    stream.read_exact(&mut field)?;
    let symbol = field_cstr(&field)?;

    // SAFETY: symbol is NUL-terminated; handle passes through unchanged.
    let address = unsafe { libc::dlsym(handle as *mut libc::c_void, symbol.as_ptr()) };
    debug!(symbol = %symbol.to_string_lossy(), address = format_args!("{:#x}", address as u64), "dlsym");
    wire::write_u64(stream, address as u64)?;
    Ok(())
}

/// Handle CALL: address + argc + args, reply with the 64-bit return.
///
/// Arities above [`MAX_CALL_ARGS`] are rejected before any argument word
/// is read.
pub fn handle_call(stream: &mut impl ReadWrite) -> Result<()> {
    let address = wire::read_u64(stream)?;
    let argc = wire::read_u64(stream)?;
    if argc > MAX_CALL_ARGS {
        return Err(AgentError::CallArity(argc));
    }

    let mut args = vec![0u64; argc as usize];
    for slot in &mut args {
        *slot = wire::read_u64(stream)?;
    }

    debug!(address = format_args!("{address:#x}"), argc, "call");
    // SAFETY: the controller vouches for the address and the signature; a
    // trapping callee kills the agent by contract.
    let ret = unsafe { dispatch(address, &args) };
    wire::write_u64(stream, ret)?;
    Ok(())
}

/// Invoke `address` through the typed signature matching the arity.
///
/// The fixed table of signatures is the protocol surface: arities 0..=11,
/// machine words in, one machine word out.
unsafe fn dispatch(address: u64, args: &[u64]) -> u64 {
    type Arg0 = unsafe extern "C" fn() -> u64;
    type Arg1 = unsafe extern "C" fn(u64) -> u64;
    type Arg2 = unsafe extern "C" fn(u64, u64) -> u64;
    type Arg3 = unsafe extern "C" fn(u64, u64, u64) -> u64;
    type Arg4 = unsafe extern "C" fn(u64, u64, u64, u64) -> u64;
    type Arg5 = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;
    type Arg6 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;
    type Arg7 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, u64) -> u64;
    type Arg8 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64) -> u64;
    type Arg9 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64, u64) -> u64;
    type Arg10 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64, u64, u64) -> u64;
    type Arg11 =
        unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64, u64, u64, u64) -> u64;

    match *args {
        [] => mem::transmute::<u64, Arg0>(address)(),
        [a] => mem::transmute::<u64, Arg1>(address)(a),
        [a, b] => mem::transmute::<u64, Arg2>(address)(a, b),
        [a, b, c] => mem::transmute::<u64, Arg3>(address)(a, b, c),
        [a, b, c, d] => mem::transmute::<u64, Arg4>(address)(a, b, c, d),
        [a, b, c, d, e] => mem::transmute::<u64, Arg5>(address)(a, b, c, d, e),
        [a, b, c, d, e, f] => mem::transmute::<u64, Arg6>(address)(a, b, c, d, e, f),
        [a, b, c, d, e, f, g] => mem::transmute::<u64, Arg7>(address)(a, b, c, d, e, f, g),
        [a, b, c, d, e, f, g, h] => mem::transmute::<u64, Arg8>(address)(a, b, c, d, e, f, g, h),
        [a, b, c, d, e, f, g, h, i] => {
            mem::transmute::<u64, Arg9>(address)(a, b, c, d, e, f, g, h, i)
        }
        [a, b, c, d, e, f, g, h, i, j] => {
            mem::transmute::<u64, Arg10>(address)(a, b, c, d, e, f, g, h, i, j)
        }
        [a, b, c, d, e, f, g, h, i, j, k] => {
            mem::transmute::<u64, Arg11>(address)(a, b, c, d, e, f, g, h, i, j, k)
        }
        _ => unreachable!("arity is checked by the caller"),
    }
}

/// Borrow the NUL-terminated prefix of a fixed string field.
fn field_cstr(field: &[u8; PATH_FIELD_LEN]) -> Result<&CStr> {
    CStr::from_bytes_until_nul(field).map_err(|_| AgentError::UnterminatedString)
}

fn dlerror_text() -> String {
    // SAFETY: dlerror returns a thread-local message pointer or null.
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown error".to_string()
    } else {
        // SAFETY: non-null dlerror results are NUL-terminated strings.
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn identity(a: u64) -> u64 {
        a
    }

    unsafe extern "C" fn sum4(a: u64, b: u64, c: u64, d: u64) -> u64 {
        a + b + c + d
    }

    #[allow(clippy::too_many_arguments)]
    unsafe extern "C" fn first_of_eleven(
        a: u64,
        _b: u64,
        _c: u64,
        _d: u64,
        _e: u64,
        _f: u64,
        _g: u64,
        _h: u64,
        _i: u64,
        _j: u64,
        _k: u64,
    ) -> u64 {
        a
    }

    #[test]
    fn dispatch_routes_each_arity_to_its_signature() {
        let ret = unsafe { dispatch(identity as usize as u64, &[42]) };
        assert_eq!(ret, 42);

        let ret = unsafe { dispatch(sum4 as usize as u64, &[1, 2, 3, 4]) };
        assert_eq!(ret, 10);

        let args: Vec<u64> = (100..111).collect();
        let ret = unsafe { dispatch(first_of_eleven as usize as u64, &args) };
        assert_eq!(ret, 100);
    }

    #[test]
    fn field_cstr_stops_at_the_terminator() {
        let mut field = [0u8; PATH_FIELD_LEN];
        field[..6].copy_from_slice(b"getpid");
        assert_eq!(field_cstr(&field).unwrap().to_bytes(), b"getpid");
    }

    #[test]
    fn field_without_terminator_is_rejected() {
        let field = [b'x'; PATH_FIELD_LEN];
        assert!(matches!(
            field_cstr(&field),
            Err(AgentError::UnterminatedString)
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn loader_round_trip_resolves_getpid() {
        let filename = std::ffi::CString::new("libc.so.6").unwrap();
        // SAFETY: plain dlopen/dlsym/dlclose round trip on the platform libc.
        unsafe {
            let handle = libc::dlopen(filename.as_ptr(), libc::RTLD_NOW);
            assert!(!handle.is_null());

            let symbol = std::ffi::CString::new("getpid").unwrap();
            let address = libc::dlsym(handle, symbol.as_ptr());
            assert!(!address.is_null());

            let pid = dispatch(address as u64, &[]);
            assert_eq!(pid as u32, std::process::id());

            assert_eq!(libc::dlclose(handle), 0);
        }
    }
}
