pub mod credit;
pub mod short_link;
pub mod task;
