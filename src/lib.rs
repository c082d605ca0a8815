mod pierce;

pub use pierce::*;
