pub mod pool;

pub use pool::{Mempool, MempoolConfig, MempoolEntry, MempoolError};
