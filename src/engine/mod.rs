pub mod boundary;
pub mod decomposition;
pub mod efficiency;
pub mod migration;
pub mod rebalancing;
pub mod sampler;
pub mod scanner;
pub mod service;
