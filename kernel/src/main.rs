#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(veridian_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use veridian_kernel::{arch, bootstrap, println};

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    arch::halt();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    veridian_kernel::test_panic_handler(info)
}

/// Kernel entry point.
///
/// Delegates the entire multi-stage boot sequence to `bootstrap::run`, which
/// never returns (it ends by handing control to the scheduler's main loop).
#[no_mangle]
pub extern "C" fn _start() -> ! {
    println!("VeridianOS v{}", env!("CARGO_PKG_VERSION"));

    #[cfg(test)]
    test_main();

    bootstrap::run();
}
