pub mod cli;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod mcp;
pub mod proxmox;
pub mod settings;
pub mod task;
pub mod tools;
