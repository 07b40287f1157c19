#![deny(unsafe_code)]
//! Automount engine for Rust.
//!
//! This crate implements the core of an automounter in the style of `amd`:
//! a directory that looks empty until a name under it is looked up, at
//! which point a mount map is consulted and the named filesystem is mounted
//! on demand and linked into place. Idle filesystems are unmounted again.
//!
//! # Overview
//!
//! The engine is built from a handful of cooperating pieces:
//!
//! - [`mapc`]: the mount-map cache. Maps are named key/value tables backed
//!   by files, the password database, a union of directories or the
//!   internal `root` map. Each map is cached according to its `cache:=`
//!   options.
//! - [`fhandle`]: the NFS file-handle cache. It resolves `(server, path)`
//!   to a root file handle by asking the server's portmapper and mount
//!   daemon, remembers the answer for a while and wakes waiters.
//! - [`sched`]: the task scheduler. Mount and unmount work runs in child
//!   processes; completions are delivered in order and wake sleepers.
//! - [`automount`]: the [`automount::Automounter`] state machine that ties
//!   them together: lookups, mount orchestration with fallback, timeouts,
//!   server liveness and orderly shutdown.
//! - [`srv`]: the event loop. It owns the sockets and signals and feeds
//!   their events to the automounter.
//!
//! # Protocols
//!
//! The automounter speaks ONC RPC ([`rpc`], encoded with [`xdr`]). It acts
//! as a client towards portmappers, mount daemons and NFS servers through
//! [`fwd`], and as a server for the kernel's NFS client ([`nfs_srv`]) and
//! for the `amq` query tool ([`amq`]).
//!
//! # Error Handling
//!
//! Failures are reported as [`error::Error`], which always carries or maps
//! to an errno. Map lookups and mount attempts report plain `Errno` values.
//!
//! # Safety
//!
//! Unsafe code is denied everywhere except the `fork` in [`sched`]. Mount
//! and unmount system calls are reached through `nix` behind the
//! [`platform::Platform`] trait.
pub mod amq;
pub mod automount;
pub mod clock;
pub mod config;
pub mod error;
pub mod fhandle;
pub mod fserver;
pub mod fwd;
pub mod mapc;
pub mod mntfs;
pub mod nfs_srv;
pub mod node;
pub mod ops;
pub mod opts;
pub mod platform;
pub mod rpc;
pub mod sched;
pub mod srv;
pub mod svc;
#[macro_use]
pub mod utils;
pub mod xdr;

pub use crate::automount::Automounter;
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::utils::Result;
