//! Architecture-specific context switching
//!
//! Each target provides `Registers`, `init_context` and `switch_context`.
//! Everything above this module goes through `ExecutionContext`.

/// Entry point of a fresh context, called with the two words passed to
/// `init_context`. Must never return.
pub type EntryFn = extern "C" fn(usize, usize);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, Registers};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, Registers};
    } else {
        compile_error!("Unsupported architecture");
    }
}
