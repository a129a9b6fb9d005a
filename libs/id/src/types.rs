//! Typed ID definitions for devices and workloads.

use std::path::Path;

use crate::define_string_id;
use crate::IdError;

// =============================================================================
// Devices
// =============================================================================

define_string_id!(DeviceId, validate_device_id);

/// Files consulted for the host machine identity, in order.
pub const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Maximum device ID length (fits a DNS name and an X.509 common name).
const MAX_DEVICE_ID_LEN: usize = 64;

fn validate_device_id(s: &str) -> Result<(), IdError> {
    if s.len() > MAX_DEVICE_ID_LEN {
        return Err(IdError::InvalidLength {
            expected: MAX_DEVICE_ID_LEN,
            actual: s.len(),
        });
    }
    for (position, c) in s.chars().enumerate() {
        if !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
            return Err(IdError::InvalidCharacter { found: c, position });
        }
    }
    Ok(())
}

impl DeviceId {
    /// Generates a fresh random device ID (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Reads the host machine identity from the first readable path.
    ///
    /// Returns `None` when no path holds a valid identity.
    pub fn from_machine_identity<P: AsRef<Path>>(paths: &[P]) -> Option<Self> {
        paths.iter().find_map(|path| {
            let content = std::fs::read_to_string(path).ok()?;
            Self::parse(content.trim()).ok()
        })
    }

    /// Resolves the device identity.
    ///
    /// An explicitly configured ID wins; otherwise the machine identity is
    /// used; otherwise a new UUID is generated.
    pub fn resolve(explicit: Option<&str>) -> Result<Self, IdError> {
        if let Some(id) = explicit {
            return Self::parse(id.trim());
        }
        Ok(Self::from_machine_identity(MACHINE_ID_PATHS).unwrap_or_else(Self::generate))
    }
}

// =============================================================================
// Workloads
// =============================================================================

define_string_id!(WorkloadId, validate_workload_id);

/// Length of a hex-encoded SHA-256 digest.
pub const WORKLOAD_ID_LEN: usize = 64;

fn validate_workload_id(s: &str) -> Result<(), IdError> {
    if s.len() != WORKLOAD_ID_LEN {
        return Err(IdError::InvalidLength {
            expected: WORKLOAD_ID_LEN,
            actual: s.len(),
        });
    }
    for (position, c) in s.chars().enumerate() {
        if !matches!(c, '0'..='9' | 'a'..='f') {
            return Err(IdError::InvalidCharacter { found: c, position });
        }
    }
    Ok(())
}

impl WorkloadId {
    /// Builds an ID from a raw SHA-256 digest.
    #[must_use]
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        use std::fmt::Write;

        let mut hex = String::with_capacity(WORKLOAD_ID_LEN);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Returns the first 12 hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

// =============================================================================
// Tests
// =============================================================================
