//! Architecture-specific context switching
//!
//! Each backend exposes the same three items:
//!
//! - `Context`: the callee-saved register block of a suspended fiber
//! - `init_context`: point a fresh context at an entry trampoline
//! - `switch`: save the current flow into one context, load another
//!
//! Nothing outside this module inspects a `Context`; the save/restore
//! points are exactly `Fiber::resume` and `Fiber::yield_now`.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Context, init_context, switch};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{Context, init_context, switch};
    } else {
        compile_error!("strand requires x86_64 or aarch64");
    }
}
