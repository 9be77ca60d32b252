use std::path::PathBuf;

use clap::Parser;

/// Producer/consumer handoff over a capacity-4 notification queue
#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Messages pushed before the DONE sentinel
    #[arg(short = 'n', long, default_value_t = 10)]
    pub items: usize,

    /// Upper bound of the producer's random pause before each push, in ms
    #[arg(long, default_value_t = 1000)]
    pub producer_delay_ms: u64,

    /// Upper bound of the consumer's random pause before each pop, in ms
    #[arg(long, default_value_t = 200)]
    pub consumer_delay_ms: u64,

    /// Pause of both tasks before they start, in ms
    #[arg(long, default_value_t = 200)]
    pub startup_ms: u64,

    /// Report a push or pop that has been blocked this long, in ms
    #[arg(long)]
    pub stall_warn_ms: Option<u64>,

    /// Seed for the random pauses
    #[arg(long)]
    pub seed: Option<u64>,

    /// Write per-message wait times to this CSV file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}
