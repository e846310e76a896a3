pub mod credits;
pub mod jobs;
pub mod transactions;
pub mod webhooks;
