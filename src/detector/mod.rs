pub mod classifier;
pub mod fingerprint;

pub use classifier::classify;
pub use fingerprint::fingerprint;
