#![doc = include_str!("../README.md")]
mod cgroup;
mod config;
mod container;
mod error;
mod netlink;
mod netns;
mod network;
mod pipe;
mod process;
mod rootfs;

pub use self::cgroup::*;
pub use self::config::*;
pub use self::container::*;
pub use self::error::*;
pub(crate) use self::netlink::*;
pub use self::netns::*;
pub use self::network::*;
pub(crate) use self::pipe::*;
pub(crate) use self::process::*;
pub use self::rootfs::*;
