//! Mathematical utilities and data structures

pub mod aabb;
pub mod frustum;
pub mod ray;

pub use aabb::Aabb;
pub use frustum::{Collision, Frustum};
pub use ray::Ray;
