pub mod cli;
pub mod config;
pub mod error;
pub mod fsaccess;
pub mod proto;
pub mod queue;
pub mod rules;
pub mod save_local;
pub mod save_remote;
pub mod server;
pub mod session;
pub mod sync_logic;
pub mod tree;
pub mod watcher;
