//! The module containing the [`panic_handler`] function.

use crate::x86_instructions::{cli, hlt};
use alloc::string::ToString;
use log::error;

#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    match info.location() {
        Some(location) => error!(
            "panicked at '{}', {}:{}:{}",
            info.message().to_string(),
            location.file(),
            location.line(),
            location.column()
        ),
        None => error!("panicked at '{}'", info.message().to_string()),
    }
    loop {
        // Park the current processor for good.
        cli();
        hlt();
    }
}
