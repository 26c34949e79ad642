pub mod segments;
pub mod spans;
pub mod sweeps;
