pub mod callbacks;
pub mod credits;
pub mod generations;
