// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io};

pub type VesselResult<T> = Result<T, VesselError>;

/// The crate-wide error type.
///
/// Distinguished storage conditions are their own variants so that callers
/// can match on them: `CannotBeShrunk` and `NotSupported` are tolerated on
/// some quota paths, `DeleteSnapshotsFirst` is honored by snapshot restore
/// with a single retry, and `Unavailable` marks a pool that is not ready on
/// this cluster member.
#[derive(Debug)]
pub enum VesselError {
    /// A plain error with no underlying cause.
    Msg(String),
    /// An error with added context wrapping the underlying cause.
    Chained(String, Box<VesselError>),

    /// The named object does not exist.
    NotFound(String),
    /// The named object already exists.
    AlreadyExists(String),
    /// The pool is pending or locally unavailable; callers may retry.
    Unavailable(String),
    /// The object is busy and cannot be operated on right now.
    Busy(String),
    /// The operation was cancelled.
    Cancelled,
    /// The driver does not support the requested operation.
    NotSupported(String),
    /// Applying the requested quota would truncate existing data.
    CannotBeShrunk(String),
    /// Restore cannot proceed until the named snapshots are deleted.
    DeleteSnapshotsFirst(Vec<String>),

    Io(io::Error),
    Nix(nix::Error),
    Serde(serde_json::Error),
    Yaml(serde_yaml::Error),
}

impl VesselError {
    /// Wrap an error with a context message.
    pub fn wrap<S>(msg: S, err: VesselError) -> VesselError
    where
        S: Into<String>,
    {
        VesselError::Chained(msg.into(), Box::new(err))
    }

    /// Whether this error, at any level of chaining, is `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            VesselError::NotFound(_) => true,
            VesselError::Chained(_, inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error, at any level of chaining, is `CannotBeShrunk`.
    pub fn is_cannot_be_shrunk(&self) -> bool {
        match self {
            VesselError::CannotBeShrunk(_) => true,
            VesselError::Chained(_, inner) => inner.is_cannot_be_shrunk(),
            _ => false,
        }
    }

    /// Whether this error, at any level of chaining, is `NotSupported`.
    pub fn is_not_supported(&self) -> bool {
        match self {
            VesselError::NotSupported(_) => true,
            VesselError::Chained(_, inner) => inner.is_not_supported(),
            _ => false,
        }
    }

    /// If this error, at any level of chaining, asks for snapshots to be
    /// deleted first, return their names.
    pub fn delete_snapshots_first(&self) -> Option<&[String]> {
        match self {
            VesselError::DeleteSnapshotsFirst(names) => Some(names),
            VesselError::Chained(_, inner) => inner.delete_snapshots_first(),
            _ => None,
        }
    }
}

impl fmt::Display for VesselError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VesselError::Msg(msg) => write!(f, "{msg}"),
            VesselError::Chained(msg, err) => write!(f, "{msg}: {err}"),
            VesselError::NotFound(what) => write!(f, "{what} not found"),
            VesselError::AlreadyExists(what) => write!(f, "{what} already exists"),
            VesselError::Unavailable(msg) => write!(f, "{msg}"),
            VesselError::Busy(msg) => write!(f, "{msg}"),
            VesselError::Cancelled => write!(f, "Operation cancelled"),
            VesselError::NotSupported(what) => write!(f, "{what} not supported"),
            VesselError::CannotBeShrunk(msg) => write!(f, "Volume cannot be shrunk: {msg}"),
            VesselError::DeleteSnapshotsFirst(names) => write!(
                f,
                "Snapshots must be deleted first: {}",
                names.join(", ")
            ),
            VesselError::Io(err) => write!(f, "IO error: {err}"),
            VesselError::Nix(err) => write!(f, "Nix error: {err}"),
            VesselError::Serde(err) => write!(f, "Serde error: {err}"),
            VesselError::Yaml(err) => write!(f, "YAML error: {err}"),
        }
    }
}

impl Error for VesselError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VesselError::Chained(_, err) => Some(err),
            VesselError::Io(err) => Some(err),
            VesselError::Nix(err) => Some(err),
            VesselError::Serde(err) => Some(err),
            VesselError::Yaml(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for VesselError {
    fn from(err: io::Error) -> VesselError {
        VesselError::Io(err)
    }
}

impl From<nix::Error> for VesselError {
    fn from(err: nix::Error) -> VesselError {
        VesselError::Nix(err)
    }
}

impl From<serde_json::Error> for VesselError {
    fn from(err: serde_json::Error) -> VesselError {
        VesselError::Serde(err)
    }
}

impl From<serde_yaml::Error> for VesselError {
    fn from(err: serde_yaml::Error) -> VesselError {
        VesselError::Yaml(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Chaining preserves the distinguished condition of the inner error.
    fn chained_condition_is_visible() {
        let err = VesselError::wrap(
            "applying quota",
            VesselError::CannotBeShrunk("5 GiB < 10 GiB".into()),
        );
        assert!(err.is_cannot_be_shrunk());
        assert!(!err.is_not_found());
    }

    #[test]
    /// The snapshot names travel with the delete-first error.
    fn delete_snapshots_first_names() {
        let err = VesselError::wrap(
            "restoring",
            VesselError::DeleteSnapshotsFirst(vec!["b".into(), "c".into()]),
        );
        assert_eq!(err.delete_snapshots_first(), Some(&["b".to_string(), "c".to_string()][..]));
    }
}
