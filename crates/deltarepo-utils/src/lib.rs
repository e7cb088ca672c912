pub mod bytes;
pub mod compression;
pub mod error;
pub mod fs;
pub mod hash;
pub mod lock;
pub mod path;
