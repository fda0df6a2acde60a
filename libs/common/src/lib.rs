pub mod id;
pub mod timeline;

pub use timeline::{TimeLine, TimePoint};
