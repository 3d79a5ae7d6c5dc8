//! Resource handlers shipped with the backends crate.

pub mod record;
pub mod roles;

pub use record::KvRecordHandler;
pub use roles::RoleAssignmentHandler;
