mod atomic;

pub use atomic::{atomic_write, read_trimmed};
