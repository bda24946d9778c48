pub mod cancel;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard_loop;
pub mod mcp;
pub mod pipeline;
pub mod policy;
pub mod preview;
pub mod probe;
pub mod probes;
pub mod registry;
pub mod report;
pub mod selftest;
pub mod util;
pub mod watch;
