pub mod domain;
pub mod network;
pub mod paths;
pub mod vmi;

// Re-export the surface an embedding launcher needs
pub use network::{
    plug_phase1, plug_phase2, CacheStore, CriticalNetworkError, LinuxNetHandler, NetHandler,
    NetworkContext,
};
