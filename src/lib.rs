// Because of the nature of this crate, there are lots of times we cast aliased types to `u64`
// Often, on 64-bit platforms, it's already that, so Clippy gets upset at the u64-to-u64
// conversion.
#![allow(clippy::useless_conversion)]

#[cfg(not(target_os = "macos"))]
compile_error!("mach-inject only supports macOS/Darwin targets");

mod mac;

pub use mac::{inject, InjectError};

failspot::failspot_name! {
    pub enum FailSpotName {
        OversizedSymbolCount,
        OversizedStringTableSize,
        ShortRemoteRead,
    }
}
