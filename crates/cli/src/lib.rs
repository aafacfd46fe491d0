pub mod args;
pub mod jsonl;
pub mod logging;
pub mod shutdown;
