// Shmem
// Copyright (C) 2025 Shmem contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use thiserror::Error;

/// Recoverable errors of the shared-memory stack.
///
/// Contract violations (misaligned requests, unknown resource identifiers,
/// out-of-bounds access) and region exhaustion are not represented here; those
/// paths terminate via [`fatal!`](crate::fatal), since continuing with a
/// possibly corrupted shared region is never safe. Release builds use
/// `panic = "abort"`.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to create shared memory region: {0}")]
    CreationFailed(String),

    #[error("Failed to open shared memory region: {0}")]
    OpeningFailed(String),

    #[error("Shared memory region at {path} is too small: {actual} bytes, need at least {needed}")]
    RegionTooSmall { path: String, actual: usize, needed: usize },

    #[error("Memory mapping error: {0}")]
    MappingError(String),

    #[error("Filesystem error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Logs the violation and terminates the current path.
///
/// The message reaches the tracing subscriber before the panic unwinds
/// (or aborts, with the release profile).
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        // Format once; arguments may have side effects or cost.
        let message = format!($($arg)*);
        tracing::error!("{message}");
        panic!("{message}");
    }};
}
