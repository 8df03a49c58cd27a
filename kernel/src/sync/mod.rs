//! Synchronization Primitives
//!
//! Safe synchronization and global state management for Rust 2024 edition,
//! plus the kernel's blocking primitives: kthreads with swappable stacks,
//! counting semaphores, condition variables, and the abortable-sleeper
//! protocol (C3).

pub mod abort;
pub mod condvar;
pub mod hazard;
pub mod kthread;
pub mod lockfree_queue;
pub mod once_lock;
pub mod rcu;
pub mod sem;

pub use condvar::CondVar;
pub use once_lock::{OnceLock, LazyLock, GlobalState};
pub use sem::Semaphore;
