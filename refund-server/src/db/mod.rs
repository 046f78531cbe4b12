//! Business database access layer (MySQL)
//!
//! The business database owns users and top-ups; this service reads both and
//! mutates exactly one column: `users.quota`.

pub mod admins;
pub mod topups;
pub mod users;
