// # Provider Implementations
//
// Providers that ship with the core library. HTTP-backed providers live in
// their own crates and register themselves with the `ProviderRegistry`.

pub mod memory;

pub use memory::{MemoryProvider, MemoryProviderFactory};
