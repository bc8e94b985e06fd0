pub mod hash;
pub mod keys;
pub mod sensitive;
pub mod sign;
