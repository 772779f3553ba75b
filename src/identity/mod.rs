mod map;

pub use map::{IdentityMap, IdentityMapStats};
