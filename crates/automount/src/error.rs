//! Automounter error types and errno definitions.
//!
//! Every subsystem of the engine speaks errno: map backends, the mount
//! daemon, the kernel and the NFS server replies all report failures as
//! `Errno`. Transport and file I/O failures arrive as `io::Error` and are
//! folded into an errno where a reply has to carry one.

use std::{error as stderror, fmt, io};

/// Re-exported errno values.
pub mod errno {
    pub use nix::errno::Errno;
    pub use nix::errno::Errno::*;
}

use self::errno::Errno;

/// The error type used throughout the automount engine.
#[derive(Debug)]
pub enum Error {
    /// System error containing an errno.
    No(Errno),
    /// I/O error.
    Io(io::Error),
}

impl Error {
    /// Get an errno representation of this error.
    pub fn errno(&self) -> Errno {
        match *self {
            Error::No(ref e) => *e,
            Error::Io(ref e) => errno_from_ioerror(e),
        }
    }
}

/// Fold an `io::Error` into the closest errno.
pub fn errno_from_ioerror(e: &io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(match e.kind() {
        io::ErrorKind::NotFound => Errno::ENOENT,
        io::ErrorKind::PermissionDenied => Errno::EPERM,
        io::ErrorKind::TimedOut => Errno::ETIMEDOUT,
        io::ErrorKind::WouldBlock => Errno::EWOULDBLOCK,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Errno::EINVAL,
        io::ErrorKind::OutOfMemory => Errno::ENOMEM,
        _ => Errno::EIO,
    })
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::No(ref e) => write!(f, "System error: {}", e.desc()),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl stderror::Error for Error {
    fn source(&self) -> Option<&(dyn stderror::Error + 'static)> {
        match *self {
            Error::No(ref e) => Some(e),
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::No(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_fold_to_errno() {
        let e = Error::from(io::Error::from_raw_os_error(Errno::EACCES as i32));
        assert_eq!(e.errno(), Errno::EACCES);

        let e = Error::from(io::Error::new(io::ErrorKind::NotFound, "map"));
        assert_eq!(e.errno(), Errno::ENOENT);

        assert_eq!(Error::No(Errno::ESTALE).errno(), Errno::ESTALE);
    }
}
