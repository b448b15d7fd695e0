//! The dummy block object handed out by GET_DUMMY_BLOCK.
//!
//! Controllers use the pointer to probe the host's block-object layout.
//! On Mach hosts this is a genuine global block; elsewhere a static
//! placeholder keeps the reply shape uniform.

use tether_protocol::wire;

use crate::error::Result;
use crate::session::ReadWrite;

/// Handle GET_DUMMY_BLOCK: reply with the 8-byte pointer.
pub fn handle_get_dummy_block(stream: &mut impl ReadWrite) -> Result<()> {
    wire::write_u64(stream, dummy_block_addr())?;
    Ok(())
}

#[cfg(target_os = "macos")]
mod objc {
    use std::ffi::c_void;

    extern "C" {
        pub static _NSConcreteGlobalBlock: c_void;
    }

    pub const BLOCK_IS_GLOBAL: i32 = 1 << 28;

    #[repr(C)]
    pub struct BlockDescriptor {
        pub reserved: u64,
        pub size: u64,
    }

    /// ABI layout of a block literal, as the runtime expects it.
    #[repr(C)]
    pub struct BlockLiteral {
        pub isa: *const c_void,
        pub flags: i32,
        pub reserved: i32,
        pub invoke: unsafe extern "C" fn(*mut c_void),
        pub descriptor: *const BlockDescriptor,
    }

    // Never mutated after construction; the pointers are to statics.
    unsafe impl Sync for BlockLiteral {}

    unsafe extern "C" fn invoke(_block: *mut c_void) {}

    static DESCRIPTOR: BlockDescriptor = BlockDescriptor {
        reserved: 0,
        size: std::mem::size_of::<BlockLiteral>() as u64,
    };

    pub static DUMMY_BLOCK: BlockLiteral = BlockLiteral {
        // SAFETY: taking the address of the runtime's class object.
        isa: unsafe { &_NSConcreteGlobalBlock as *const c_void },
        flags: BLOCK_IS_GLOBAL,
        reserved: 0,
        invoke,
        descriptor: &DESCRIPTOR,
    };
}

#[cfg(target_os = "macos")]
fn dummy_block_addr() -> u64 {
    &objc::DUMMY_BLOCK as *const objc::BlockLiteral as u64
}

#[cfg(not(target_os = "macos"))]
fn dummy_block_addr() -> u64 {
    static PLACEHOLDER: u64 = 0;
    &PLACEHOLDER as *const u64 as u64
}
