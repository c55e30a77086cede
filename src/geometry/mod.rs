pub mod so3;

pub use so3::{exp_so3, skew};
