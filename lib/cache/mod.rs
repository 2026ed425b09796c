/// Cache replacement policies.
pub mod fifo;
