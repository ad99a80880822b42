// Capstan - connection lifecycle management for asynchronous socket servers
//
// This library provides the substrate protocol servers are built on:
// admission control, busy/idle tracking, idle and request deadlines, and
// lifecycle event pipelines.

// Re-export core functionality
pub use capstan_core::*;
