pub mod agent;
pub mod build;
pub mod shared;
pub mod up;
pub mod workspace_ops;
