pub mod cluster;
pub mod logging;
pub mod transactions;
