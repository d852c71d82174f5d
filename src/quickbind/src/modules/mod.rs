//! Built-in modules and globals: the AMD module system, console, timers,
//! the TypeScript compiler host, the debugger wire endpoints, and the
//! registry-backed builtins (`fs`, `path`, `process`, `DataBuffer`).

pub mod amd;
pub mod buffer;
pub mod compiler;
pub mod console;
pub mod debugger;
pub mod fs;
pub mod path;
pub mod process;
pub mod timers;
