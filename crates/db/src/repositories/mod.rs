//! Repository layer: one zero-sized struct per table family, each method a
//! single query or transaction against a `PgPool`.

pub mod credit_repo;
pub mod short_link_repo;
pub mod task_repo;

pub use credit_repo::{CreditRepo, DebitOutcome};
pub use short_link_repo::ShortLinkRepo;
pub use task_repo::TaskRepo;
