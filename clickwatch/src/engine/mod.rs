pub mod audit;
pub mod cycle;
pub mod retry;
pub mod scheduler;
