pub mod builder;
pub mod sops;

pub use builder::{BuildOptions, Builder, BuiltStream, Identity};
pub use sops::{decrypt_tree, Decrypter, SopsCli};
