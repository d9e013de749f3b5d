pub mod actions;
pub mod keygen;
pub mod migrate;
pub mod runs;
pub mod start;
pub mod version;
